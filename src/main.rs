use anyhow::Context;
use colored::Colorize;
use mdtune::{
    clap_args::{self, Commands, SchedulerArg},
    config::{self, Assignments, Config, Template},
    mdlog,
    optimizer::{http::HostedOptimizer, ExperimentSpec, OptimizationService},
    tuner::{self, TrialOutcome},
};
use std::path::Path;
use tracing::{info, subscriber::set_global_default, Subscriber};
use tracing_subscriber::EnvFilter;

fn get_subscriber(env_filter: &str) -> impl Subscriber + Sync + Send {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(env_filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .finish()
}

fn init_subscriber(subscriber: impl Subscriber + Sync + Send) -> anyhow::Result<()> {
    set_global_default(subscriber).context("Failed to set subscriber")
}

async fn connect(config: &Config, experiment: Option<String>) -> anyhow::Result<HostedOptimizer> {
    let token = HostedOptimizer::token_from_env(&config.optimizer.token_env)?;

    match experiment.or(config.optimizer.experiment.clone()) {
        Some(experiment_id) => {
            HostedOptimizer::resume(&config.optimizer.url, &token, &experiment_id).await
        }
        None => {
            let spec = ExperimentSpec::from_config(config);
            HostedOptimizer::create(&config.optimizer.url, &token, &spec).await
        }
    }
}

async fn run_tune(
    file: &Path,
    budget: Option<u32>,
    experiment: Option<String>,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let config = Config::try_from_path(file)?;
    let optimizer = connect(&config, experiment).await?;
    println!(
        "> tuning {} in experiment {}",
        config.optimizer.name.green(),
        optimizer.experiment_id().green()
    );

    let budget = budget.unwrap_or(config.optimizer.budget);
    let service: &dyn OptimizationService = &optimizer;
    let report = tuner::tune(&config, service, budget).await?;

    report.print_summary();
    if let Some(path) = output {
        report
            .write_json(path)
            .context(format!("Error writing results to {}", path.display()))?;
        info!("Wrote results to {}", path.display());
    }

    Ok(())
}

async fn run_single(file: &Path, pairs: &[String]) -> anyhow::Result<()> {
    let config = Config::try_from_path(file)?;

    let mut assignments = Assignments::new();
    for pair in pairs {
        let (name, value) = config.parse_assignment(pair)?;
        assignments.insert(name, value);
    }
    config.check_assignments(&assignments)?;

    let run_id = tuner::new_run_id();
    let record = tuner::evaluate(&config, &run_id, 1, &assignments).await;
    match record.outcome {
        TrialOutcome::Completed {
            performance,
            queue_wait_seconds,
        } => {
            println!(
                "{} {:.3} ns/day ({:.3} hour/ns), waited {:.0}s in the queue",
                "✓".green(),
                performance.ns_per_day,
                performance.hours_per_ns,
                queue_wait_seconds
            );
            Ok(())
        }
        TrialOutcome::Failed { reason } => Err(anyhow::anyhow!(reason)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // read .env before anything looks at the environment
    dotenvy::dotenv().ok();

    let args = clap_args::parse();
    let level = if args.verbose { "debug" } else { "warn" };
    init_subscriber(get_subscriber(level))?;

    match args.command {
        Commands::Init { scheduler, file } => {
            let template = match scheduler {
                SchedulerArg::Slurm => Template::Slurm,
                SchedulerArg::Local => Template::Local,
            };
            config::init_config(template, &file);
        }

        Commands::Tune {
            file,
            budget,
            experiment,
            output,
        } => run_tune(&file, budget, experiment, output.as_deref()).await?,

        Commands::Run { file, assignments } => run_single(&file, &assignments).await?,

        Commands::Parse { log } => {
            let performance = mdlog::read_performance(&log)?;
            println!(
                "{:.3} ns/day\t{:.3} hour/ns",
                performance.ns_per_day, performance.hours_per_ns
            );
        }
    }

    Ok(())
}
