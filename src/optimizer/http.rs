use super::{BestAssignment, ExperimentSpec, Observation, OptimizationService, Suggestion};
use crate::config::{Assignments, Domain, ParameterSpec};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};

fn id_of(json_obj: &Value) -> Option<String> {
    match json_obj.get("id")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

fn parameter_json(param: &ParameterSpec) -> Value {
    match &param.domain {
        Domain::Int { min, max } => json!({
            "name": param.name,
            "type": "int",
            "bounds": { "min": min, "max": max },
        }),
        Domain::Categorical { values } => json!({
            "name": param.name,
            "type": "categorical",
            "categorical_values": values
                .iter()
                .map(|value| json!({ "name": value }))
                .collect::<Vec<_>>(),
        }),
    }
}

pub fn experiment_body(spec: &ExperimentSpec) -> Value {
    json!({
        "name": spec.name,
        "parameters": spec.parameters.iter().map(parameter_json).collect::<Vec<_>>(),
        "metrics": spec.metrics,
        "observation_budget": spec.observation_budget,
        "parallel_bandwidth": 1,
    })
}

pub fn observation_body(suggestion: &Suggestion, observation: &Observation) -> Value {
    match observation {
        Observation::Measured { .. } => json!({
            "suggestion": suggestion.id,
            "values": observation.values(),
        }),
        Observation::Failed => json!({
            "suggestion": suggestion.id,
            "failed": true,
        }),
    }
}

fn try_parse_suggestion(json_obj: &Value) -> anyhow::Result<Suggestion> {
    let id = id_of(json_obj).context("Suggestion has no id")?;
    let assignments = json_obj
        .get("assignments")
        .cloned()
        .context("Suggestion has no assignments")?;
    let assignments = serde_json::from_value::<Assignments>(assignments)
        .context("Suggestion contains assignments that are neither integers nor strings")?;
    Ok(Suggestion { id, assignments })
}

fn try_parse_best(json_obj: &Value) -> anyhow::Result<Vec<BestAssignment>> {
    let data = json_obj
        .get("data")
        .cloned()
        .context("Best assignments response has no data")?;
    serde_json::from_value(data).context("Error parsing best assignments")
}

async fn send(request: reqwest::RequestBuilder) -> anyhow::Result<Value> {
    let resp = request
        .header("Content-Type", "application/json")
        .send()
        .await?;

    let status = resp.status();
    let url = resp.url().to_string();
    let body = resp.text().await?;
    if !status.is_success() {
        return Err(anyhow!(
            "Optimization service returned {} for {}: {}",
            status,
            url,
            body
        ));
    }

    serde_json::from_str(&body).context(format!("Invalid JSON returned by {}", url))
}

// //////////////////////////////////////
// HostedOptimizer

/// Client for a hosted optimization REST API (experiments, suggestions, observations).
pub struct HostedOptimizer {
    base_url: String,
    client: reqwest::Client,
    token: String,
    experiment_id: String,
}
impl HostedOptimizer {
    /// Reads the API token from the environment (or a `.env` file).
    pub fn token_from_env(var: &str) -> anyhow::Result<String> {
        dotenvy::var(var).context(format!(
            "The optimization service token must be set in the {} environment variable",
            var
        ))
    }

    fn new(base_url: &str, token: &str, experiment_id: String) -> Self {
        let base_url = base_url.strip_suffix('/').unwrap_or(base_url);
        Self {
            base_url: String::from(base_url),
            client: reqwest::Client::new(),
            token: String::from(token),
            experiment_id,
        }
    }

    /// Creates a new experiment for the given spec.
    pub async fn create(base_url: &str, token: &str, spec: &ExperimentSpec) -> anyhow::Result<Self> {
        let mut optimizer = Self::new(base_url, token, String::new());

        let url = format!("{}/v1/experiments", optimizer.base_url);
        let json_obj = send(
            optimizer
                .client
                .post(url)
                .basic_auth(&optimizer.token, Some(""))
                .json(&experiment_body(spec)),
        )
        .await
        .context("Error creating experiment")?;

        optimizer.experiment_id = id_of(&json_obj).context("Created experiment has no id")?;
        info!("Created experiment {}", optimizer.experiment_id);
        Ok(optimizer)
    }

    /// Attaches to an experiment which already exists, e.g. to continue an interrupted search.
    pub async fn resume(base_url: &str, token: &str, experiment_id: &str) -> anyhow::Result<Self> {
        let optimizer = Self::new(base_url, token, experiment_id.to_string());

        let json_obj = send(
            optimizer
                .client
                .get(optimizer.experiment_url(""))
                .basic_auth(&optimizer.token, Some("")),
        )
        .await
        .context(format!("Error fetching experiment {}", experiment_id))?;

        let observations = json_obj
            .get("progress")
            .and_then(|progress| progress.get("observation_count"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        info!(
            "Resuming experiment {} with {} observations",
            experiment_id, observations
        );
        Ok(optimizer)
    }

    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    fn experiment_url(&self, path: &str) -> String {
        format!(
            "{}/v1/experiments/{}{}",
            self.base_url, self.experiment_id, path
        )
    }
}
#[async_trait]
impl OptimizationService for HostedOptimizer {
    async fn suggest(&self) -> anyhow::Result<Suggestion> {
        let json_obj = send(
            self.client
                .post(self.experiment_url("/suggestions"))
                .basic_auth(&self.token, Some(""))
                .json(&json!({})),
        )
        .await
        .context("Error fetching suggestion")?;

        let suggestion = try_parse_suggestion(&json_obj)?;
        debug!("Received suggestion {:?}", suggestion);
        Ok(suggestion)
    }

    async fn observe(
        &self,
        suggestion: &Suggestion,
        observation: &Observation,
    ) -> anyhow::Result<()> {
        debug!("Reporting {:?} for suggestion {}", observation, suggestion.id);
        send(
            self.client
                .post(self.experiment_url("/observations"))
                .basic_auth(&self.token, Some(""))
                .json(&observation_body(suggestion, observation)),
        )
        .await
        .context(format!(
            "Error reporting observation for suggestion {}",
            suggestion.id
        ))?;
        Ok(())
    }

    async fn best(&self) -> anyhow::Result<Vec<BestAssignment>> {
        let json_obj = send(
            self.client
                .get(self.experiment_url("/best_assignments"))
                .basic_auth(&self.token, Some("")),
        )
        .await
        .context("Error fetching best assignments")?;

        try_parse_best(&json_obj)
    }
}
