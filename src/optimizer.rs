pub mod http;

use crate::{
    config::{Assignments, Config, ParameterSpec},
    mdlog::Performance,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub const THROUGHPUT: &str = "throughput";
pub const QUEUE_WAIT: &str = "queue_wait";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Objective {
    Maximize,
    Minimize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSpec {
    pub name: String,
    pub objective: Objective,
}

/// What the optimization service needs to know to set up a search.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentSpec {
    pub name: String,
    pub parameters: Vec<ParameterSpec>,
    pub metrics: Vec<MetricSpec>,
    pub observation_budget: u32,
}
impl ExperimentSpec {
    pub fn from_config(config: &Config) -> Self {
        Self {
            name: config.optimizer.name.clone(),
            parameters: config.parameters.clone(),
            metrics: vec![
                MetricSpec {
                    name: THROUGHPUT.to_string(),
                    objective: Objective::Maximize,
                },
                MetricSpec {
                    name: QUEUE_WAIT.to_string(),
                    objective: Objective::Minimize,
                },
            ],
            observation_budget: config.optimizer.budget,
        }
    }
}

/// A parameter configuration proposed by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub id: String,
    pub assignments: Assignments,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    pub name: String,
    pub value: f64,
}

/// The result of evaluating a suggestion.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    Measured { throughput: f64, queue_wait: f64 },
    Failed,
}
impl Observation {
    /// Both metrics of a completed trial, clamped at zero.
    pub fn measured(performance: &Performance, queue_wait_seconds: f64) -> Self {
        Observation::Measured {
            throughput: performance.ns_per_day.max(0.0),
            queue_wait: queue_wait_seconds.max(0.0),
        }
    }

    pub fn values(&self) -> Vec<MetricValue> {
        match self {
            Observation::Measured {
                throughput,
                queue_wait,
            } => vec![
                MetricValue {
                    name: THROUGHPUT.to_string(),
                    value: *throughput,
                },
                MetricValue {
                    name: QUEUE_WAIT.to_string(),
                    value: *queue_wait,
                },
            ],
            Observation::Failed => vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestAssignment {
    pub assignments: Assignments,
    #[serde(default)]
    pub values: Vec<MetricValue>,
}
impl BestAssignment {
    pub fn value(&self, name: &str) -> Option<f64> {
        self.values
            .iter()
            .find(|metric| metric.name == name)
            .map(|metric| metric.value)
    }
}

/// A black-box optimization service which proposes parameter configurations and learns from the
/// reported metrics. The search itself happens on the other side of this trait.
#[async_trait]
pub trait OptimizationService: Send + Sync {
    /// Returns the next configuration to evaluate.
    async fn suggest(&self) -> anyhow::Result<Suggestion>;

    /// Reports the metrics (or the failure) measured for a suggestion.
    async fn observe(
        &self,
        suggestion: &Suggestion,
        observation: &Observation,
    ) -> anyhow::Result<()>;

    /// The best configurations found so far. With more than one metric this is the Pareto front.
    async fn best(&self) -> anyhow::Result<Vec<BestAssignment>>;
}
