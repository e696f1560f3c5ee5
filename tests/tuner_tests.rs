#![cfg(target_family = "unix")]

use anyhow::anyhow;
use async_trait::async_trait;
use mdtune::{
    config::{Assignments, Config, ParameterValue},
    optimizer::{BestAssignment, MetricValue, Observation, OptimizationService, Suggestion},
    scheduler::Scheduler,
    tuner::{self, TrialOutcome},
};
use std::{
    collections::VecDeque,
    fs,
    path::PathBuf,
    sync::Mutex,
};

// `sh` plays mdrun: the parameter flags land in $1..$4 and throughput is ten times the threads.
const CONFIG: &str = r#"
[mdrun]
command = "sh"
args = ["-c", '''
case "$4" in
  crash) exit 2 ;;
  nolog) exit 0 ;;
esac
printf 'Performance: %s.000 0.500\n' "$((OMP_NUM_THREADS * 10))" > trial-{trial}.log
''', "mdrun"]
log = "trial-{trial}.log"
redirect = { to = "null" }

[scheduler]
type = "local"

[optimizer]
name = "sh throughput"
budget = 4

[[parameter]]
name = "threads"
type = "int"
min = 1
max = 8
mdrun_flag = "-ntomp"
env = "OMP_NUM_THREADS"

[[parameter]]
name = "mode"
type = "categorical"
values = ["ok", "crash", "nolog"]
mdrun_flag = "-mode"
"#;

/// Hands out a fixed list of suggestions and remembers what was reported.
#[derive(Default)]
struct ScriptedService {
    suggestions: Mutex<VecDeque<Suggestion>>,
    observations: Mutex<Vec<(String, Observation)>>,
}
impl ScriptedService {
    fn new(suggestions: Vec<Suggestion>) -> Self {
        Self {
            suggestions: Mutex::new(suggestions.into()),
            observations: Mutex::default(),
        }
    }
}
#[async_trait]
impl OptimizationService for ScriptedService {
    async fn suggest(&self) -> anyhow::Result<Suggestion> {
        self.suggestions
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow!("experiment has no more suggestions"))
    }

    async fn observe(
        &self,
        suggestion: &Suggestion,
        observation: &Observation,
    ) -> anyhow::Result<()> {
        self.observations
            .lock()
            .unwrap()
            .push((suggestion.id.clone(), observation.clone()));
        Ok(())
    }

    async fn best(&self) -> anyhow::Result<Vec<BestAssignment>> {
        let observations = self.observations.lock().unwrap();
        Ok(observations
            .iter()
            .filter_map(|(id, obs)| match obs {
                Observation::Measured { throughput, .. } => Some(BestAssignment {
                    assignments: Assignments::new(),
                    values: vec![MetricValue {
                        name: format!("throughput-{}", id),
                        value: *throughput,
                    }],
                }),
                Observation::Failed => None,
            })
            .collect())
    }
}

fn suggestion(id: &str, threads: i64, mode: &str) -> Suggestion {
    let mut assignments = Assignments::new();
    assignments.insert("threads".to_string(), ParameterValue::Int(threads));
    assignments.insert(
        "mode".to_string(),
        ParameterValue::Categorical(mode.to_string()),
    );
    Suggestion {
        id: id.to_string(),
        assignments,
    }
}

fn setup_config() -> anyhow::Result<(Config, PathBuf)> {
    let dir = std::env::temp_dir().join(format!("mdtune-{}", nanoid::nanoid!(8)));
    fs::create_dir_all(&dir)?;

    let mut config = Config::try_from_str(CONFIG)?;
    config.mdrun.workdir = dir.clone();
    Ok((config, dir))
}

#[tokio::test]
async fn tune_reports_throughput_and_failures() -> anyhow::Result<()> {
    let (config, dir) = setup_config()?;
    let service = ScriptedService::new(vec![
        suggestion("a", 4, "ok"),
        suggestion("b", 2, "crash"),
        suggestion("c", 3, "nolog"),
        suggestion("d", 99, "ok"),
    ]);

    let report = tuner::tune(&config, &service, 4).await?;

    let observations = service.observations.lock().unwrap().clone();
    assert_eq!(
        observations,
        vec![
            (
                "a".to_string(),
                Observation::Measured {
                    throughput: 40.0,
                    queue_wait: 0.0
                }
            ),
            ("b".to_string(), Observation::Failed),
            ("c".to_string(), Observation::Failed),
            ("d".to_string(), Observation::Failed),
        ]
    );

    assert_eq!(report.trials.len(), 4);
    assert_eq!(report.completed().count(), 1);
    assert_eq!(report.fastest().map(|trial| trial.trial), Some(1));
    assert_eq!(report.trials[0].suggestion.as_deref(), Some("a"));
    assert_eq!(report.best.len(), 1);
    assert_eq!(report.best[0].values[0].value, 40.0);

    // the out of bounds suggestion never reached the shell
    match &report.trials[3].outcome {
        TrialOutcome::Failed { reason } => assert!(reason.contains("threads")),
        outcome => panic!("expected a failed trial, found {:?}", outcome),
    }
    assert!(dir.join("trial-1.log").exists());
    assert!(!dir.join("trial-3.log").exists());

    fs::remove_dir_all(&dir)?;
    Ok(())
}

#[tokio::test]
async fn service_errors_abort_the_run() -> anyhow::Result<()> {
    let (config, dir) = setup_config()?;
    let service = ScriptedService::new(vec![suggestion("a", 1, "ok")]);

    let res = tuner::tune(&config, &service, 2).await;
    assert!(res.is_err());
    assert_eq!(service.observations.lock().unwrap().len(), 1);

    fs::remove_dir_all(&dir)?;
    Ok(())
}

#[tokio::test]
async fn largest_budget_still_runs_trials() -> anyhow::Result<()> {
    let (config, dir) = setup_config()?;
    let service = ScriptedService::new(vec![suggestion("a", 2, "ok")]);

    // stops once the service runs out of suggestions
    assert!(tuner::tune(&config, &service, u32::MAX).await.is_err());
    assert_eq!(
        service.observations.lock().unwrap().clone(),
        vec![(
            "a".to_string(),
            Observation::Measured {
                throughput: 20.0,
                queue_wait: 0.0
            }
        )]
    );

    fs::remove_dir_all(&dir)?;
    Ok(())
}

#[tokio::test]
async fn evaluate_runs_a_single_configuration() -> anyhow::Result<()> {
    let (config, dir) = setup_config()?;

    let record = tuner::evaluate(&config, "solo", 7, &suggestion("x", 8, "ok").assignments).await;
    match record.outcome {
        TrialOutcome::Completed {
            performance,
            queue_wait_seconds,
        } => {
            assert_eq!(performance.ns_per_day, 80.0);
            assert_eq!(performance.hours_per_ns, 0.5);
            assert_eq!(queue_wait_seconds, 0.0);
        }
        outcome => panic!("expected a completed trial, found {:?}", outcome),
    }
    assert!(dir.join("trial-7.log").exists());

    fs::remove_dir_all(&dir)?;
    Ok(())
}

// `sh` plays srun as well: it drops the leading `--` options and runs the rest. The setup command
// stages the input mdrun insists on.
const SLURM_CONFIG: &str = r#"
[mdrun]
command = "sh"
args = ["-c", '''
[ -f input-{trial}.tpr ] || exit 3
printf 'Performance: %s.000 0.500\n' "$((OMP_NUM_THREADS * 10))" > trial-{trial}.log
''', "mdrun"]
log = "trial-{trial}.log"
redirect = { to = "null" }
setup = ["sh -c 'echo staged > input-{trial}.tpr'"]

[scheduler]
type = "slurm"
launcher = '''sh -c 'while [ "${1#--}" != "$1" ]; do shift; done; exec "$@"' srun'''

[optimizer]
name = "sh on slurm"
budget = 3

[[parameter]]
name = "threads"
type = "int"
min = 1
max = 8
mdrun_flag = "-ntomp"
scheduler_flag = "--cpus-per-task"
env = "OMP_NUM_THREADS"

[[constraint]]
expr = "threads % 2 == 0"
reason = "odd thread counts leave a core idle"
"#;

const ACCOUNTING_OK: &str =
    "sh -c 'echo \"9|2024-01-01T00:00:00|2024-01-01T00:01:00|COMPLETED\"' sacct";

fn slurm_config(accounting: &str) -> anyhow::Result<(Config, PathBuf)> {
    let dir = std::env::temp_dir().join(format!("mdtune-{}", nanoid::nanoid!(8)));
    fs::create_dir_all(&dir)?;

    let mut config = Config::try_from_str(SLURM_CONFIG)?;
    config.mdrun.workdir = dir.clone();
    if let Scheduler::Slurm {
        accounting: command,
        ..
    } = &mut config.scheduler
    {
        *command = accounting.to_string();
    }
    Ok((config, dir))
}

fn threads(id: &str, threads: i64) -> Suggestion {
    let mut assignments = Assignments::new();
    assignments.insert("threads".to_string(), ParameterValue::Int(threads));
    Suggestion {
        id: id.to_string(),
        assignments,
    }
}

#[tokio::test]
async fn slurm_trials_report_queue_wait() -> anyhow::Result<()> {
    let (config, dir) = slurm_config(ACCOUNTING_OK)?;
    let service = ScriptedService::new(vec![threads("a", 4), threads("b", 3), threads("c", 2)]);

    let report = tuner::tune(&config, &service, 3).await?;

    assert_eq!(
        service.observations.lock().unwrap().clone(),
        vec![
            (
                "a".to_string(),
                Observation::Measured {
                    throughput: 40.0,
                    queue_wait: 60.0
                }
            ),
            ("b".to_string(), Observation::Failed),
            (
                "c".to_string(),
                Observation::Measured {
                    throughput: 20.0,
                    queue_wait: 60.0
                }
            ),
        ]
    );

    // the infeasible trial was rejected before setup or launch
    match &report.trials[1].outcome {
        TrialOutcome::Failed { reason } => assert!(reason.contains("leave a core idle")),
        outcome => panic!("expected a failed trial, found {:?}", outcome),
    }
    assert!(dir.join("input-1.tpr").exists());
    assert!(!dir.join("input-2.tpr").exists());
    assert!(!dir.join("trial-2.log").exists());

    fs::remove_dir_all(&dir)?;
    Ok(())
}

#[tokio::test]
async fn accounting_errors_fail_the_trial() -> anyhow::Result<()> {
    for accounting in [
        "sh -c 'echo \"9|2024-01-01T00:00:00|Unknown|PENDING\"' sacct",
        "sh -c 'echo no such job >&2; exit 1' sacct",
    ] {
        let (config, dir) = slurm_config(accounting)?;
        let service = ScriptedService::new(vec![threads("a", 4)]);

        let report = tuner::tune(&config, &service, 1).await?;

        // mdrun itself went fine
        assert!(dir.join("trial-1.log").exists());
        assert!(!report.trials[0].is_completed());
        assert_eq!(
            service.observations.lock().unwrap().clone(),
            vec![("a".to_string(), Observation::Failed)]
        );

        fs::remove_dir_all(&dir)?;
    }
    Ok(())
}
