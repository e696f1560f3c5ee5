use crate::config::{Assignments, Config, Redirect};
use anyhow::Context;
use itertools::Itertools;
use std::path::PathBuf;

/// Everything needed to launch a single trial.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub job_name: String,
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub workdir: PathBuf,
    pub log_path: PathBuf,
    pub redirect: Redirect,
    /// Commands run one after another before the trial itself, already split into words.
    pub setup: Vec<Vec<String>>,
}
impl Invocation {
    pub fn words(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str))
    }

    /// The command line as it would be typed into a shell, environment first.
    pub fn command_line(&self) -> String {
        let words = self.words().collect_vec();
        let command = shlex::try_join(words.iter().copied()).unwrap_or_else(|_| words.join(" "));

        if self.env.is_empty() {
            command
        } else {
            let env = self
                .env
                .iter()
                .map(|(key, val)| {
                    let quoted = shlex::try_quote(val).unwrap_or_else(|_| val.into());
                    format!("{}={}", key, quoted)
                })
                .join(" ");
            format!("{} {}", env, command)
        }
    }
}

pub fn job_name(run_id: &str, trial: u32) -> String {
    format!("mdtune-{}-{}", run_id, trial)
}

fn expand(template: &str, run_id: &str, trial: u32) -> String {
    template
        .replace("{trial}", &trial.to_string())
        .replace("{run}", run_id)
}

/// Long options are glued to their value (`--ntasks=4`), short ones are passed as two words
/// (`-ntomp 4`).
fn flag_words(flag: &str, value: String) -> Vec<String> {
    if flag.starts_with("--") {
        vec![format!("{}={}", flag, value)]
    } else {
        vec![flag.to_string(), value]
    }
}

/// Assembles the scheduler-prefixed mdrun command line for one trial.
///
/// # Arguments
/// * config - the tuning configuration
/// * run_id - id of the current tuning run, substituted for `{run}`
/// * trial - trial number, substituted for `{trial}`
/// * assignments - parameter values proposed for this trial
///
/// # Returns
/// The invocation, or an error if the assignments don't fit the configured parameters or violate
/// one of the constraints
pub fn build_invocation(
    config: &Config,
    run_id: &str,
    trial: u32,
    assignments: &Assignments,
) -> anyhow::Result<Invocation> {
    config.check_assignments(assignments)?;
    let values = config.resolve_values(assignments)?;
    config.check_constraints(&values)?;

    let job_name = job_name(run_id, trial);

    let mut mdrun_words =
        shlex::split(&config.mdrun.command).context("mdrun command is not POSIX compliant")?;
    mdrun_words.extend(
        config
            .mdrun
            .args
            .iter()
            .map(|arg| expand(arg, run_id, trial)),
    );

    let mut scheduler_flags = vec![];
    let mut env = vec![];

    // walk the configured parameters so the command line keeps the order of the config file
    for param in config.parameters.iter() {
        let value = assignments
            .get(&param.name)
            .context(format!("Missing assignment for parameter {}", param.name))?
            .to_string();

        if let Some(flag) = &param.mdrun_flag {
            mdrun_words.extend(flag_words(flag, value.clone()));
        }
        if let Some(flag) = &param.scheduler_flag {
            scheduler_flags.extend(flag_words(flag, value.clone()));
        }
        if let Some(var) = &param.env {
            env.push((var.clone(), value));
        }
    }

    for derived in config.derived.iter() {
        let value = values
            .get(&derived.name)
            .context(format!("Missing derived value {}", derived.name))?
            .to_string();

        if let Some(flag) = &derived.mdrun_flag {
            mdrun_words.extend(flag_words(flag, value.clone()));
        }
        if let Some(flag) = &derived.scheduler_flag {
            scheduler_flags.extend(flag_words(flag, value.clone()));
        }
        if let Some(var) = &derived.env {
            env.push((var.clone(), value));
        }
    }

    let mut words = config.scheduler.prefix(&job_name, scheduler_flags)?;
    words.extend(mdrun_words);

    let (program, args) = words
        .split_first()
        .context("Assembled an empty command line")?;

    let setup = config
        .mdrun
        .setup
        .iter()
        .map(|cmd| {
            shlex::split(&expand(cmd, run_id, trial))
                .filter(|words| !words.is_empty())
                .context(format!("Setup command '{}' is not POSIX compliant", cmd))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(Invocation {
        job_name,
        program: program.clone(),
        args: args.to_vec(),
        env,
        workdir: config.mdrun.workdir.clone(),
        log_path: config
            .mdrun
            .workdir
            .join(expand(&config.mdrun.log, run_id, trial)),
        redirect: config.mdrun.redirect.unwrap_or(Redirect::File),
        setup,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParameterValue;
    use std::path::Path;

    fn assignments() -> Assignments {
        let mut assignments = Assignments::new();
        assignments.insert("ranks".to_string(), ParameterValue::Int(4));
        assignments.insert("threads".to_string(), ParameterValue::Int(8));
        assignments.insert("gpus".to_string(), ParameterValue::Int(2));
        assignments.insert(
            "pme".to_string(),
            ParameterValue::Categorical("gpu".to_string()),
        );
        assignments
    }

    #[test]
    fn slurm_invocation_is_prefixed_by_launcher() -> anyhow::Result<()> {
        let cfg = Config::try_from_path(Path::new("./fixtures/mdtune.slurm.toml"))?;
        let invocation = build_invocation(&cfg, "x1y2z", 3, &assignments())?;

        assert_eq!(invocation.program, "srun");
        assert_eq!(
            invocation.args,
            vec![
                "--nodes=1",
                "--partition=gpu",
                "--time=00:20:00",
                "--ntasks=4",
                "--cpus-per-task=8",
                "--gpus=2",
                "--job-name=mdtune-x1y2z-3",
                "gmx_mpi",
                "mdrun",
                "-s",
                "bench.tpr",
                "-deffnm",
                "trial-3",
                "-nsteps",
                "10000",
                "-resethway",
                "-ntomp",
                "8",
                "-pme",
                "gpu",
            ]
        );
        assert_eq!(
            invocation.env,
            vec![("OMP_NUM_THREADS".to_string(), "8".to_string())]
        );
        assert_eq!(
            invocation.log_path,
            Path::new("/scratch/bench/trial-3.log")
        );
        assert_eq!(invocation.redirect, Redirect::Null);
        Ok(())
    }

    #[test]
    fn local_invocation_runs_mdrun_directly() -> anyhow::Result<()> {
        let cfg = Config::try_from_str(
            r#"
            [mdrun]
            command = "gmx mdrun"
            args = ["-deffnm", "{run}-{trial}"]
            log = "{run}-{trial}.log"

            [scheduler]
            type = "local"

            [optimizer]
            name = "local"
            budget = 2

            [[parameter]]
            name = "ranks"
            type = "int"
            min = 1
            max = 4
            mdrun_flag = "-ntmpi"
        "#,
        )?;

        let mut assignments = Assignments::new();
        assignments.insert("ranks".to_string(), ParameterValue::Int(2));
        let invocation = build_invocation(&cfg, "run", 7, &assignments)?;

        assert_eq!(
            invocation.command_line(),
            "gmx mdrun -deffnm run-7 -ntmpi 2"
        );
        assert_eq!(invocation.log_path, Path::new("./run-7.log"));
        assert_eq!(invocation.redirect, Redirect::File);
        Ok(())
    }

    #[test]
    fn out_of_bounds_assignment_is_rejected() -> anyhow::Result<()> {
        let cfg = Config::try_from_path(Path::new("./fixtures/mdtune.slurm.toml"))?;
        let mut assignments = assignments();
        assignments.insert("gpus".to_string(), ParameterValue::Int(9));
        assert!(build_invocation(&cfg, "run", 1, &assignments).is_err());
        Ok(())
    }

    #[test]
    fn command_line_quotes_words_and_shows_env() {
        let invocation = Invocation {
            job_name: "job".to_string(),
            program: "gmx".to_string(),
            args: vec!["mdrun".to_string(), "-s".to_string(), "my run.tpr".to_string()],
            env: vec![
                ("OMP_NUM_THREADS".to_string(), "4".to_string()),
                ("GMX_LABEL".to_string(), "pme on gpu".to_string()),
            ],
            workdir: PathBuf::from("."),
            log_path: PathBuf::from("md.log"),
            redirect: Redirect::Null,
            setup: vec![],
        };
        let command_line = invocation.command_line();
        assert!(command_line.starts_with("OMP_NUM_THREADS=4 GMX_LABEL="));
        assert_eq!(
            shlex::split(&command_line),
            Some(vec![
                "OMP_NUM_THREADS=4".to_string(),
                "GMX_LABEL=pme on gpu".to_string(),
                "gmx".to_string(),
                "mdrun".to_string(),
                "-s".to_string(),
                "my run.tpr".to_string(),
            ])
        );
    }

    const PME_CONFIG: &str = r#"
        [mdrun]
        command = "gmx_mpi mdrun"
        args = ["-deffnm", "trial-{trial}"]
        log = "trial-{trial}.log"
        setup = ["module load gromacs/2020.2", "cp ../bench.tpr trial-{trial}.tpr"]

        [scheduler]
        type = "slurm"
        args = ["--mpi=pmi2"]

        [optimizer]
        name = "pme split"
        budget = 30

        [[parameter]]
        name = "ranks"
        type = "int"
        min = 1
        max = 10

        [[parameter]]
        name = "pme_ranks"
        type = "int"
        min = 0
        max = 5
        mdrun_flag = "-npme"

        [[parameter]]
        name = "threads"
        type = "int"
        min = 1
        max = 4
        mdrun_flag = "-ntomp"
        scheduler_flag = "--cpus-per-task"

        [[derived]]
        name = "tasks"
        expr = "ranks + pme_ranks"
        scheduler_flag = "-n"

        [[constraint]]
        expr = "tasks * threads <= 44"
        reason = "too many cores for one node"
    "#;

    fn pme_assignments(ranks: i64, pme_ranks: i64, threads: i64) -> Assignments {
        let mut assignments = Assignments::new();
        assignments.insert("ranks".to_string(), ParameterValue::Int(ranks));
        assignments.insert("pme_ranks".to_string(), ParameterValue::Int(pme_ranks));
        assignments.insert("threads".to_string(), ParameterValue::Int(threads));
        assignments
    }

    #[test]
    fn derived_values_become_flags() -> anyhow::Result<()> {
        let cfg = Config::try_from_str(PME_CONFIG)?;
        let invocation = build_invocation(&cfg, "run", 2, &pme_assignments(4, 1, 2))?;

        assert_eq!(invocation.program, "srun");
        assert_eq!(
            invocation.args,
            vec![
                "--mpi=pmi2",
                "--cpus-per-task=2",
                "-n",
                "5",
                "--job-name=mdtune-run-2",
                "gmx_mpi",
                "mdrun",
                "-deffnm",
                "trial-2",
                "-npme",
                "1",
                "-ntomp",
                "2",
            ]
        );
        assert_eq!(
            invocation.setup,
            vec![
                vec!["module", "load", "gromacs/2020.2"],
                vec!["cp", "../bench.tpr", "trial-2.tpr"],
            ]
        );
        Ok(())
    }

    #[test]
    fn infeasible_assignment_is_never_assembled() -> anyhow::Result<()> {
        let cfg = Config::try_from_str(PME_CONFIG)?;
        let err = build_invocation(&cfg, "run", 1, &pme_assignments(10, 2, 4)).unwrap_err();
        assert!(format!("{:#}", err).contains("too many cores for one node"));
        Ok(())
    }
}
