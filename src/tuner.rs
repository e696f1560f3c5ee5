use crate::{
    config::{Assignments, Config},
    execution_plan::build_invocation,
    mdlog::{self, Performance},
    optimizer::{BestAssignment, Observation, OptimizationService, QUEUE_WAIT, THROUGHPUT},
    process_control::{run_invocation, run_setup},
};
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use colored::*;
use itertools::Itertools;
use nanoid::nanoid;
use serde::Serialize;
use std::{
    path::Path,
    time::{Duration, Instant},
};
use term_table::{row, row::Row, rows, table_cell::*, Table, TableStyle};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TrialOutcome {
    Completed {
        performance: Performance,
        queue_wait_seconds: f64,
    },
    Failed {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialRecord {
    pub trial: u32,
    pub suggestion: Option<String>,
    pub assignments: Assignments,
    pub outcome: TrialOutcome,
    pub started: DateTime<Utc>,
    pub elapsed_seconds: f64,
}
impl TrialRecord {
    pub fn observation(&self) -> Observation {
        match &self.outcome {
            TrialOutcome::Completed {
                performance,
                queue_wait_seconds,
            } => Observation::measured(performance, *queue_wait_seconds),
            TrialOutcome::Failed { .. } => Observation::Failed,
        }
    }

    pub fn throughput(&self) -> Option<f64> {
        match &self.outcome {
            TrialOutcome::Completed { performance, .. } => Some(performance.ns_per_day),
            TrialOutcome::Failed { .. } => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, TrialOutcome::Completed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TuningReport {
    pub run_id: String,
    pub trials: Vec<TrialRecord>,
    pub best: Vec<BestAssignment>,
}

pub fn new_run_id() -> String {
    nanoid!(5, &nanoid::alphabet::SAFE)
}

async fn try_evaluate(
    config: &Config,
    run_id: &str,
    trial: u32,
    assignments: &Assignments,
) -> anyhow::Result<(Performance, Duration)> {
    let invocation = build_invocation(config, run_id, trial, assignments)?;

    run_setup(&invocation).await?;
    let outcome = run_invocation(&invocation).await?;
    if !outcome.success() {
        return Err(anyhow!(
            "mdrun exited with {}. Command: {}",
            outcome.status,
            invocation.command_line()
        ));
    }

    let performance = mdlog::read_performance(&invocation.log_path)?;
    let queue_wait = config.scheduler.queue_wait(&invocation.job_name).await?;
    Ok((performance, queue_wait))
}

/// Runs a single trial with the given assignments. Anything that goes wrong while launching the
/// simulation or reading its results ends up as a failed trial rather than an error.
pub async fn evaluate(
    config: &Config,
    run_id: &str,
    trial: u32,
    assignments: &Assignments,
) -> TrialRecord {
    let started = Utc::now();
    let timer = Instant::now();

    let outcome = match try_evaluate(config, run_id, trial, assignments).await {
        Ok((performance, queue_wait)) => {
            info!(
                "Trial {} reached {} ns/day after waiting {:.0}s in the queue",
                trial,
                performance.ns_per_day,
                queue_wait.as_secs_f64()
            );
            TrialOutcome::Completed {
                performance,
                queue_wait_seconds: queue_wait.as_secs_f64(),
            }
        }
        Err(err) => {
            warn!("Trial {} failed: {:#}", trial, err);
            TrialOutcome::Failed {
                reason: format!("{:#}", err),
            }
        }
    };

    TrialRecord {
        trial,
        suggestion: None,
        assignments: assignments.clone(),
        outcome,
        started,
        elapsed_seconds: timer.elapsed().as_secs_f64(),
    }
}

/// Asks the optimization service for `budget` configurations one after another, evaluates each
/// of them and reports the results back. Errors talking to the service abort the run.
pub async fn tune(
    config: &Config,
    service: &dyn OptimizationService,
    budget: u32,
) -> anyhow::Result<TuningReport> {
    let run_id = new_run_id();
    info!("Starting tuning run {} with a budget of {} trials", run_id, budget);

    let mut trials = vec![];
    for trial in 1..=budget {
        let suggestion = service.suggest().await?;

        println!(
            "> running trial {} - {}/{} [{}]",
            run_id.green(),
            trial,
            budget,
            format_assignments(&suggestion.assignments).bright_black()
        );

        let mut record = evaluate(config, &run_id, trial, &suggestion.assignments).await;
        record.suggestion = Some(suggestion.id.clone());

        match &record.outcome {
            TrialOutcome::Completed { performance, .. } => {
                println!("\t{} {:.3} ns/day", "✓".green(), performance.ns_per_day)
            }
            TrialOutcome::Failed { reason } => {
                println!("\t{} {}", "✗".red(), reason.bright_black())
            }
        }

        service.observe(&suggestion, &record.observation()).await?;
        trials.push(record);
    }

    let best = service.best().await?;

    Ok(TuningReport {
        run_id,
        trials,
        best,
    })
}

fn format_assignments(assignments: &Assignments) -> String {
    assignments
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .join(" ")
}

fn format_metric(value: Option<f64>, unit: &str) -> String {
    value
        .map(|val| format!("{:.3}{}", val, unit))
        .unwrap_or("--".to_string())
}

impl TuningReport {
    pub fn completed(&self) -> impl Iterator<Item = &TrialRecord> {
        self.trials.iter().filter(|trial| trial.is_completed())
    }

    /// The completed trial with the highest throughput measured during this run.
    pub fn fastest(&self) -> Option<&TrialRecord> {
        self.trials
            .iter()
            .filter_map(|trial| trial.throughput().map(|throughput| (trial, throughput)))
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(trial, _)| trial)
    }

    pub fn write_json(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn print_summary(&self) {
        println!("\n{}", " Summary ".reversed().green());
        println!(
            "run {}: {} of {} trials completed",
            self.run_id.green(),
            self.completed().count(),
            self.trials.len()
        );

        let mut rows = rows![row![
            TableCell::builder("Trial".bold()).build(),
            TableCell::builder("Assignments".bold()).build(),
            TableCell::builder("Throughput (ns/day)".bold()).build(),
            TableCell::builder("Queue wait (s)".bold()).build(),
            TableCell::builder("Duration (s)".bold()).build()
        ]];
        for trial in self.trials.iter() {
            let (throughput, queue_wait) = match &trial.outcome {
                TrialOutcome::Completed {
                    performance,
                    queue_wait_seconds,
                } => (
                    format!("{:.3}", performance.ns_per_day).normal(),
                    format!("{:.0}", queue_wait_seconds).normal(),
                ),
                TrialOutcome::Failed { .. } => ("failed".red(), "--".bright_black()),
            };

            rows.push(row![
                TableCell::new(trial.trial),
                TableCell::new(format_assignments(&trial.assignments)),
                TableCell::new(throughput),
                TableCell::new(queue_wait),
                TableCell::new(format!("{:.1}", trial.elapsed_seconds))
            ]);
        }

        let table = Table::builder()
            .rows(rows)
            .style(TableStyle::rounded())
            .build();
        println!("{}", table.render());

        if let Some(fastest) = self.fastest() {
            println!(
                "{} {}",
                "Fastest trial this run:".yellow(),
                format_assignments(&fastest.assignments)
            );
        }

        if !self.best.is_empty() {
            println!("\n{}", " Best assignments ".reversed().green());
            for best in self.best.iter() {
                println!(
                    "{} {} {}",
                    format_assignments(&best.assignments),
                    format_metric(best.value(THROUGHPUT), " ns/day").green(),
                    format_metric(best.value(QUEUE_WAIT), "s wait").bright_black()
                );
            }
        }
    }
}
