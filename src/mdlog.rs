use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

const PERFORMANCE_LABEL: &str = "Performance:";
const TIME_LABEL: &str = "Time:";

/// Throughput figures reported at the end of an mdrun log.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Performance {
    pub ns_per_day: f64,
    pub hours_per_ns: f64,
    pub wall_seconds: Option<f64>,
}

fn parse_field(line: &str, label: &str, idx: usize) -> anyhow::Result<f64> {
    let field = line
        .trim_start()
        .strip_prefix(label)
        .and_then(|rest| rest.split_whitespace().nth(idx))
        .context(format!("Missing field {} on line '{}'", idx + 1, line.trim()))?;

    let value = field
        .parse::<f64>()
        .context(format!("'{}' is not a number", field))?;
    if value.is_sign_negative() || !value.is_finite() {
        return Err(anyhow!("'{}' is not a valid measurement", field));
    }

    Ok(value)
}

fn last_line_with<'a>(log: &'a str, label: &str) -> Option<&'a str> {
    log.lines()
        .filter(|line| line.trim_start().starts_with(label))
        .last()
}

/// Extracts the performance figures from the contents of an mdrun log.
///
/// The `Performance:` line holds ns/day followed by hour/ns. A log may contain more than one
/// such line (appended runs), in which case the last one is used. The wall time is left out
/// when the `Time:` line is missing or unreadable.
pub fn parse_performance(log: &str) -> anyhow::Result<Performance> {
    let line = last_line_with(log, PERFORMANCE_LABEL)
        .context("Log does not contain a performance line, did mdrun finish?")?;

    let ns_per_day = parse_field(line, PERFORMANCE_LABEL, 0)?;
    let hours_per_ns = parse_field(line, PERFORMANCE_LABEL, 1)?;

    // core time, wall time, core utilisation. Only informational, so a bad line is skipped.
    let wall_seconds = last_line_with(log, TIME_LABEL).and_then(|line| {
        parse_field(line, TIME_LABEL, 1)
            .map_err(|err| warn!("Ignoring wall time: {:#}", err))
            .ok()
    });

    Ok(Performance {
        ns_per_day,
        hours_per_ns,
        wall_seconds,
    })
}

pub fn read_performance(path: &Path) -> anyhow::Result<Performance> {
    let log = std::fs::read_to_string(path)
        .context(format!("Unable to read mdrun log {}", path.display()))?;
    parse_performance(&log).context(format!("Unable to parse mdrun log {}", path.display()))
}
