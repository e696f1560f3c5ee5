use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Verbose mode (-v, --verbose)
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write an example config
    Init {
        #[arg(long, value_enum, default_value_t = SchedulerArg::Slurm)]
        scheduler: SchedulerArg,

        #[arg(short, long, default_value = "mdtune.toml")]
        file: PathBuf,
    },

    /// Search the configured parameter space with the optimization service
    Tune {
        #[arg(short, long, default_value = "mdtune.toml")]
        file: PathBuf,

        /// Number of trials to run, overrides optimizer.budget
        #[arg(short, long)]
        budget: Option<u32>,

        /// Id of an existing experiment to continue
        #[arg(short, long)]
        experiment: Option<String>,

        /// Write every trial and the best assignments to this JSON file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run a single configuration without the optimization service
    Run {
        #[arg(short, long, default_value = "mdtune.toml")]
        file: PathBuf,

        /// Parameter assignment, e.g. --set threads=8
        #[arg(short = 's', long = "set", value_name = "NAME=VALUE")]
        assignments: Vec<String>,
    },

    /// Print the performance figures found in an mdrun log
    Parse { log: PathBuf },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerArg {
    Slurm,
    Local,
}

pub fn parse() -> Cli {
    Cli::parse()
}
