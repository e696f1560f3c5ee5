use crate::{config::Redirect, execution_plan::Invocation};
use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use std::{
    fs::OpenOptions,
    path::Path,
    process::{ExitStatus, Stdio},
    time::{Duration, Instant},
};
use tracing::{debug, info};

/// How a launched trial ended.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: ExitStatus,
    pub started: DateTime<Utc>,
    pub elapsed: Duration,
}
impl RunOutcome {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

fn append_to(path: &Path) -> anyhow::Result<Stdio> {
    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .context(format!("Unable to open {} for output", path.display()))?;
    Ok(Stdio::from(file))
}

fn redirection(invocation: &Invocation) -> anyhow::Result<(Stdio, Stdio)> {
    match invocation.redirect {
        Redirect::Null => Ok((Stdio::null(), Stdio::null())),
        Redirect::Parent => Ok((Stdio::inherit(), Stdio::inherit())),
        Redirect::File => {
            let out_path = invocation
                .workdir
                .join(format!("{}.stdout", invocation.job_name));
            let err_path = invocation
                .workdir
                .join(format!("{}.stderr", invocation.job_name));
            Ok((append_to(&out_path)?, append_to(&err_path)?))
        }
    }
}

/// Runs the setup commands of an invocation in its working directory with its environment. The
/// first command that fails stops the setup.
pub async fn run_setup(invocation: &Invocation) -> anyhow::Result<()> {
    for words in invocation.setup.iter() {
        let (command, args) = words.split_first().context("Empty setup command")?;
        debug!("Running setup command {}", words.join(" "));

        let output = tokio::process::Command::new(command)
            .args(args)
            .envs(invocation.env.iter().map(|(key, val)| (key, val)))
            .current_dir(&invocation.workdir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .context(format!("Tokio command failed to run {command}"))?;

        if !output.status.success() {
            let error_message = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(anyhow!(
                "Setup command '{}' exited with {}: {}",
                words.join(" "),
                output.status,
                error_message.trim()
            ));
        }
    }

    Ok(())
}

/// Runs the given invocation and blocks until it has finished. The child is killed if the
/// returned future is dropped.
///
/// # Arguments
///
/// * invocation - The assembled command line to run.
///
/// # Returns
///
/// The exit status and timing of the run. A non-zero exit is not an error here, callers decide
/// what a failed run means.
pub async fn run_invocation(invocation: &Invocation) -> anyhow::Result<RunOutcome> {
    let (stdout, stderr) = redirection(invocation)?;

    debug!("Running command {} in {}", invocation.command_line(), invocation.workdir.display());
    let started = Utc::now();
    let timer = Instant::now();

    let status = tokio::process::Command::new(&invocation.program)
        .args(&invocation.args)
        .envs(invocation.env.iter().map(|(key, val)| (key, val)))
        .current_dir(&invocation.workdir)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .kill_on_drop(true)
        .status()
        .await
        .context(format!(
            "Tokio command failed to run {}",
            invocation.program
        ))?;

    let elapsed = timer.elapsed();
    info!(
        "Ran command {} ({}) in {:.1}s",
        invocation.command_line(),
        status,
        elapsed.as_secs_f64()
    );

    Ok(RunOutcome {
        status,
        started,
        elapsed,
    })
}
