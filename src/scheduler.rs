use anyhow::{anyhow, Context};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const SACCT_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Where mdrun gets launched.
#[derive(Debug, Deserialize, PartialEq, Serialize, Clone)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Scheduler {
    /// Run mdrun directly on this machine.
    Local,

    /// Launch mdrun through a SLURM launcher (usually `srun`) and use the accounting tool to find
    /// out how long the job sat in the queue.
    Slurm {
        #[serde(default = "default_launcher")]
        launcher: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default = "default_accounting")]
        accounting: String,
    },
}

fn default_launcher() -> String {
    "srun".to_string()
}

fn default_accounting() -> String {
    "sacct".to_string()
}

impl Scheduler {
    /// The words placed in front of the mdrun command line.
    ///
    /// # Arguments
    /// * job_name - name given to the job so that it can be found in the accounting records
    /// * flags - scheduler flags derived from the trial's parameter assignments
    pub fn prefix(&self, job_name: &str, flags: Vec<String>) -> anyhow::Result<Vec<String>> {
        match self {
            Scheduler::Local => {
                if !flags.is_empty() {
                    return Err(anyhow!(
                        "Scheduler flags {:?} given but the scheduler is local",
                        flags
                    ));
                }
                Ok(vec![])
            }

            Scheduler::Slurm { launcher, args, .. } => {
                let mut words = shlex::split(launcher)
                    .filter(|words| !words.is_empty())
                    .context("Launcher is not a POSIX compliant command")?;
                words.extend(args.iter().cloned());
                words.extend(flags);
                words.push(format!("--job-name={}", job_name));
                Ok(words)
            }
        }
    }

    /// How long the job with the given name waited between submission and start.
    pub async fn queue_wait(&self, job_name: &str) -> anyhow::Result<Duration> {
        match self {
            Scheduler::Local => Ok(Duration::ZERO),

            Scheduler::Slurm { accounting, .. } => {
                let mut words = shlex::split(accounting)
                    .filter(|words| !words.is_empty())
                    .context("Accounting command is not a POSIX compliant command")?;
                words.extend([
                    "-n".to_string(),
                    "-X".to_string(),
                    "-P".to_string(),
                    format!("--name={}", job_name),
                    "--format=JobID,Submit,Start,State".to_string(),
                ]);

                let (command, args) = words.split_first().context("Empty accounting command")?;
                debug!("Querying accounting: {}", words.join(" "));
                let output = tokio::process::Command::new(command)
                    .args(args)
                    .kill_on_drop(true)
                    .output()
                    .await
                    .context(format!("Tokio command failed to run {command}"))?;

                if !output.status.success() {
                    let error_message = String::from_utf8_lossy(&output.stderr).to_string();
                    return Err(anyhow!(
                        "Accounting query for job {} failed: {}",
                        job_name,
                        error_message
                    ));
                }

                let stdout = String::from_utf8_lossy(&output.stdout);
                parse_accounting(&stdout)
                    .context(format!("Unable to find queue wait for job {}", job_name))
            }
        }
    }
}

/// A single record from the accounting tool.
#[derive(Debug, PartialEq)]
pub struct JobRecord {
    pub job_id: String,
    pub submit: NaiveDateTime,
    pub start: NaiveDateTime,
    pub state: String,
}
impl JobRecord {
    /// Time spent in the queue, never negative.
    pub fn wait(&self) -> Duration {
        (self.start - self.submit).to_std().unwrap_or(Duration::ZERO)
    }
}

fn parse_timestamp(field: &str) -> anyhow::Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(field.trim(), SACCT_TIME_FORMAT)
        .context(format!("Invalid accounting timestamp '{}'", field))
}

fn parse_record(line: &str) -> anyhow::Result<JobRecord> {
    let fields: Vec<&str> = line.split('|').collect();
    match &fields[..] {
        [job_id, submit, start, state, ..] => Ok(JobRecord {
            job_id: job_id.to_string(),
            submit: parse_timestamp(submit)?,
            start: parse_timestamp(start)?,
            state: state.to_string(),
        }),
        _ => Err(anyhow!("Malformed accounting record '{}'", line)),
    }
}

/// Parses parsable (`-P`) accounting output and returns the wait of the most recent job.
pub fn parse_accounting(output: &str) -> anyhow::Result<Duration> {
    let line = output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .context("Accounting returned no records")?;

    let record = parse_record(line)?;
    debug!(
        "Job {} ({}) submitted {} started {}",
        record.job_id, record.state, record.submit, record.start
    );
    Ok(record.wait())
}
