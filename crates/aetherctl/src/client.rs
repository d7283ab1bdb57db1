//! Thin HTTP client over the coordinator and monitor APIs.

use anyhow::{bail, Context, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct WorkflowStatus {
    pub workflow_id: String,
    pub state: String,
    #[serde(default)]
    pub current_step: Option<String>,
    pub started_at: u64,
    #[serde(default)]
    pub completed_at: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct CancelResult {
    pub workflow_id: String,
    pub cancelled: bool,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct WorkflowSummary {
    pub workflow_id: String,
    pub workflow_type: String,
    pub state: String,
    #[serde(default)]
    pub current_step: Option<String>,
    pub started_at: u64,
    #[serde(default)]
    pub completed_at: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Clone)]
pub struct AetherClient {
    http: reqwest::Client,
    coordinator_url: String,
    monitor_url: String,
}

impl AetherClient {
    pub fn new(coordinator_url: &str, monitor_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            coordinator_url: coordinator_url.trim_end_matches('/').to_string(),
            monitor_url: monitor_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn status(&self, workflow_id: &str) -> Result<WorkflowStatus> {
        let url = format!("{}/v1/workflows/{}", self.coordinator_url, workflow_id);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("cannot reach coordinator at {}", self.coordinator_url))?;
        Self::parse(response).await
    }

    pub async fn cancel(&self, workflow_id: &str) -> Result<CancelResult> {
        let url = format!("{}/v1/workflows/{}", self.coordinator_url, workflow_id);
        let response = self
            .http
            .delete(&url)
            .send()
            .await
            .with_context(|| format!("cannot reach coordinator at {}", self.coordinator_url))?;
        Self::parse(response).await
    }

    pub async fn list_workflows(
        &self,
        workflow_type: Option<&str>,
        state: Option<&str>,
    ) -> Result<Vec<WorkflowSummary>> {
        let url = format!("{}/v1/workflows", self.monitor_url);
        let mut request = self.http.get(&url);
        if let Some(workflow_type) = workflow_type {
            request = request.query(&[("workflow_type", workflow_type)]);
        }
        if let Some(state) = state {
            request = request.query(&[("state", state)]);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("cannot reach monitor at {}", self.monitor_url))?;
        Self::parse(response).await
    }

    async fn parse<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return response.json::<T>().await.context("malformed response body");
        }
        let message = match response.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => status.to_string(),
        };
        bail!("{}", message)
    }
}
