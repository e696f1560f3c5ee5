use crate::{expression::Expression, scheduler::Scheduler};
use anyhow::{anyhow, Context};
use colored::Colorize;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
};

static SLURM_EXAMPLE_CONFIG: &str = include_str!("templates/mdtune.slurm.toml");
static LOCAL_EXAMPLE_CONFIG: &str = include_str!("templates/mdtune.local.toml");

pub const DEFAULT_API_URL: &str = "https://api.sigopt.com";
pub const DEFAULT_TOKEN_ENV: &str = "MDTUNE_API_TOKEN";

/// Parameter assignments proposed for a single trial, keyed by parameter name.
pub type Assignments = BTreeMap<String, ParameterValue>;

// ******** ******** ********
// **    CONFIGURATION     **
// ******** ******** ********
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    pub mdrun: Mdrun,
    pub scheduler: Scheduler,
    pub optimizer: Optimizer,
    #[serde(rename(serialize = "parameter", deserialize = "parameter"))]
    pub parameters: Vec<ParameterSpec>,
    #[serde(default, rename(serialize = "derived", deserialize = "derived"))]
    pub derived: Vec<DerivedValue>,
    #[serde(default, rename(serialize = "constraint", deserialize = "constraint"))]
    pub constraints: Vec<Constraint>,
}
impl Config {
    pub fn write_example_to_file(template: Template, path: &Path) -> anyhow::Result<File> {
        let example = match template {
            Template::Slurm => SLURM_EXAMPLE_CONFIG,
            Template::Local => LOCAL_EXAMPLE_CONFIG,
        };

        // the thread search never goes beyond the physical cores of this machine
        let cores = num_cpus::get_physical().max(1);
        let conf_str = example.replace("{cores}", &cores.to_string());

        // write to file
        let mut file = File::create_new(path)?;
        File::write_all(&mut file, conf_str.as_bytes())?;
        Ok(file)
    }

    pub fn try_from_path(path: &Path) -> anyhow::Result<Config> {
        let mut config_str = String::new();
        fs::File::open(path)
            .context(format!("Unable to open config file {}", path.display()))?
            .read_to_string(&mut config_str)?;
        Config::try_from_str(&config_str)
    }

    pub fn try_from_str(conf_str: &str) -> anyhow::Result<Config> {
        let config = toml::from_str::<Config>(conf_str)
            .map_err(|e| anyhow::anyhow!("TOML parsing error: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.parameters.is_empty() {
            return Err(anyhow!("At least one [[parameter]] must be configured"));
        }

        let duplicates = self
            .parameters
            .iter()
            .map(|param| param.name.as_str())
            .duplicates()
            .collect_vec();
        if !duplicates.is_empty() {
            return Err(anyhow!(
                "Parameter names must be unique, found duplicates: {}",
                duplicates.join(", ")
            ));
        }

        for param in self.parameters.iter() {
            param.domain.validate().context(format!(
                "Invalid domain for parameter {}",
                param.name
            ))?;
        }

        match shlex::split(&self.mdrun.command) {
            Some(words) if !words.is_empty() => {}
            _ => return Err(anyhow!("mdrun.command must be a non-empty POSIX command")),
        }
        if self.mdrun.log.trim().is_empty() {
            return Err(anyhow!("mdrun.log must name the log file written by mdrun"));
        }
        if self.optimizer.budget == 0 {
            return Err(anyhow!("optimizer.budget must be at least 1"));
        }
        for cmd in self.mdrun.setup.iter() {
            match shlex::split(cmd) {
                Some(words) if !words.is_empty() => {}
                _ => return Err(anyhow!("Setup command '{}' is not a POSIX command", cmd)),
            }
        }

        self.validate_expressions()?;

        if matches!(self.scheduler, Scheduler::Local) {
            let flagged = self
                .parameters
                .iter()
                .filter(|param| param.scheduler_flag.is_some())
                .map(|param| param.name.as_str())
                .chain(
                    self.derived
                        .iter()
                        .filter(|derived| derived.scheduler_flag.is_some())
                        .map(|derived| derived.name.as_str()),
                )
                .collect_vec();
            if !flagged.is_empty() {
                return Err(anyhow!(
                    "scheduler_flag is set on {} but the scheduler is local",
                    flagged.join(", ")
                ));
            }
        }

        Ok(())
    }

    /// Derived values may use integer parameters and the derived values declared before them,
    /// constraints may use any of these.
    fn validate_expressions(&self) -> anyhow::Result<()> {
        let mut known = self
            .parameters
            .iter()
            .filter(|param| matches!(param.domain, Domain::Int { .. }))
            .map(|param| param.name.as_str())
            .collect_vec();

        for derived in self.derived.iter() {
            if self.parameters.iter().any(|param| param.name == derived.name)
                || known.contains(&derived.name.as_str())
            {
                return Err(anyhow!(
                    "Derived value {} clashes with another name",
                    derived.name
                ));
            }
            check_names(&derived.expr, &known)
                .context(format!("Invalid derived value {}", derived.name))?;
            known.push(&derived.name);
        }

        for constraint in self.constraints.iter() {
            check_names(&constraint.expr, &known)
                .context(format!("Invalid constraint '{}'", constraint.expr))?;
        }

        Ok(())
    }

    /// Finds a parameter in the config with the given name.
    pub fn find_parameter(&self, name: &str) -> anyhow::Result<&ParameterSpec> {
        self.parameters
            .iter()
            .find(|param| param.name == name)
            .context(format!("Unable to find parameter with name {}", name))
    }

    /// Checks that every configured parameter has an assignment which lies inside its domain and
    /// that nothing else has been assigned.
    pub fn check_assignments(&self, assignments: &Assignments) -> anyhow::Result<()> {
        for param in self.parameters.iter() {
            let value = assignments
                .get(&param.name)
                .context(format!("Missing assignment for parameter {}", param.name))?;
            param.domain.check(value).context(format!(
                "Rejected assignment for parameter {}",
                param.name
            ))?;
        }

        for name in assignments.keys() {
            self.find_parameter(name)?;
        }

        Ok(())
    }

    /// Parses a `name=value` pair as typed by a user on the command line. The value is read
    /// according to the domain of the named parameter, so categorical labels may be numeric.
    pub fn parse_assignment(&self, pair: &str) -> anyhow::Result<(String, ParameterValue)> {
        let (name, value) = pair
            .split_once('=')
            .context(format!("Expected name=value but found {}", pair))?;
        let (name, value) = (name.trim(), value.trim());

        let value = match self.find_parameter(name)?.domain {
            Domain::Int { .. } => ParameterValue::Int(
                value
                    .parse::<i64>()
                    .context(format!("Parameter {} expects an integer, found {}", name, value))?,
            ),
            Domain::Categorical { .. } => ParameterValue::Categorical(value.to_string()),
        };
        Ok((name.to_string(), value))
    }

    /// Integer values of the assigned parameters plus every derived value, in config order.
    pub fn resolve_values(
        &self,
        assignments: &Assignments,
    ) -> anyhow::Result<BTreeMap<String, i64>> {
        let mut values: BTreeMap<String, i64> = assignments
            .iter()
            .filter_map(|(name, value)| match value {
                ParameterValue::Int(val) => Some((name.clone(), *val)),
                ParameterValue::Categorical(_) => None,
            })
            .collect();

        for derived in self.derived.iter() {
            let value = derived
                .expr
                .eval(&|name: &str| lookup(&values, name))
                .context(format!("Unable to derive {}", derived.name))?;
            values.insert(derived.name.clone(), value);
        }

        Ok(values)
    }

    /// Fails with the reason of the first constraint the values violate.
    pub fn check_constraints(&self, values: &BTreeMap<String, i64>) -> anyhow::Result<()> {
        for constraint in self.constraints.iter() {
            if !constraint.expr.holds(&|name: &str| lookup(values, name))? {
                return Err(anyhow!(
                    "Infeasible configuration: {}",
                    constraint
                        .reason
                        .clone()
                        .unwrap_or_else(|| format!("{} does not hold", constraint.expr))
                ));
            }
        }
        Ok(())
    }
}

fn lookup(values: &BTreeMap<String, i64>, name: &str) -> anyhow::Result<i64> {
    values
        .get(name)
        .copied()
        .context(format!("No integer value for {}", name))
}

fn check_names(expr: &Expression, known: &[&str]) -> anyhow::Result<()> {
    match expr.variables().into_iter().find(|name| !known.contains(name)) {
        Some(name) => Err(anyhow!(
            "{} is not an integer parameter or an earlier derived value",
            name
        )),
        None => Ok(()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Template {
    Slurm,
    Local,
}

#[derive(Debug, Deserialize, PartialEq, Clone, Copy, Serialize)]
#[serde(tag = "to", rename_all = "lowercase")]
pub enum Redirect {
    Null,
    Parent,
    File,
}

#[derive(Debug, Deserialize, PartialEq, Serialize)]
pub struct Mdrun {
    /// The simulation executable, e.g. `gmx mdrun` or `gmx_mpi mdrun`.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Log file written by mdrun, relative to `workdir`. May contain `{trial}` and `{run}`.
    pub log: String,
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,
    pub redirect: Option<Redirect>,
    /// Commands run in `workdir` before every trial, e.g. to load modules or stage input.
    #[serde(default)]
    pub setup: Vec<String>,
}

fn default_workdir() -> PathBuf {
    PathBuf::from(".")
}

#[derive(Debug, Deserialize, PartialEq, Serialize)]
pub struct Optimizer {
    #[serde(default = "default_api_url")]
    pub url: String,
    #[serde(default = "default_token_env")]
    pub token_env: String,
    pub name: String,
    pub budget: u32,
    /// Id of an existing experiment to resume instead of creating a new one.
    pub experiment: Option<String>,
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_token_env() -> String {
    DEFAULT_TOKEN_ENV.to_string()
}

#[derive(Debug, Deserialize, PartialEq, Serialize, Clone)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(flatten)]
    pub domain: Domain,
    pub mdrun_flag: Option<String>,
    pub scheduler_flag: Option<String>,
    pub env: Option<String>,
}

/// A launcher or mdrun value computed from the parameters, e.g. the total task count
/// `ranks + pme_ranks`.
#[derive(Debug, Deserialize, PartialEq, Serialize, Clone)]
pub struct DerivedValue {
    pub name: String,
    pub expr: Expression,
    pub mdrun_flag: Option<String>,
    pub scheduler_flag: Option<String>,
    pub env: Option<String>,
}

/// A feasibility condition every trial has to meet before anything is launched.
#[derive(Debug, Deserialize, PartialEq, Serialize, Clone)]
pub struct Constraint {
    pub expr: Expression,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize, PartialEq, Serialize, Clone)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Domain {
    Int { min: i64, max: i64 },
    Categorical { values: Vec<String> },
}
impl Domain {
    fn validate(&self) -> anyhow::Result<()> {
        match self {
            Domain::Int { min, .. } if *min < 0 => {
                Err(anyhow!("lower bound {} is negative", min))
            }
            Domain::Int { min, max } if min > max => {
                Err(anyhow!("lower bound {} exceeds upper bound {}", min, max))
            }
            Domain::Categorical { values } if values.is_empty() => {
                Err(anyhow!("categorical parameter has no values"))
            }
            _ => Ok(()),
        }
    }

    pub fn check(&self, value: &ParameterValue) -> anyhow::Result<()> {
        match (self, value) {
            (Domain::Int { min, max }, ParameterValue::Int(val)) => {
                if val < min || val > max {
                    Err(anyhow!("{} is outside [{}, {}]", val, min, max))
                } else {
                    Ok(())
                }
            }
            (Domain::Categorical { values }, ParameterValue::Categorical(val)) => {
                if values.contains(val) {
                    Ok(())
                } else {
                    Err(anyhow!("{} is not one of {}", val, values.join(", ")))
                }
            }
            (_, val) => Err(anyhow!("{} has the wrong type", val)),
        }
    }
}

#[derive(Debug, Deserialize, PartialEq, Eq, Serialize, Clone)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    Categorical(String),
}
impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Int(val) => write!(f, "{}", val),
            ParameterValue::Categorical(val) => write!(f, "{}", val),
        }
    }
}

/// Writes an example config for the chosen template to the given path.
pub fn init_config(template: Template, path: &Path) {
    println!("\n{}", " Setting up mdtune ".reversed().green());
    match Config::write_example_to_file(template, path) {
        Ok(_) => {
            println!("{} {}", path.display(), "created!".green());
            println!(
                "{}",
                "Edit the [mdrun] section to point at your run input before tuning.".yellow()
            );
        }

        Err(err) => {
            println!("{}\n{}", "Error creating config.".red(), err);
        }
    }
}
