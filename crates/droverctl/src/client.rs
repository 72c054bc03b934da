//! Typed HTTP client for the droverd facade.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status}: {message}")]
    Api { status: u16, message: String },
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: String,
    pub current_stage: Option<String>,
    pub current_item_id: Option<String>,
    pub updated_at: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RunList {
    pub runs: Vec<RunSummary>,
    pub total: usize,
}

#[derive(Debug, Deserialize)]
pub struct LogPage {
    pub lines: Vec<String>,
    pub cursor: u64,
    pub total_lines: u64,
}

pub struct Client {
    base_url: String,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response
            .json::<Value>()
            .await
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(ToString::to_string))
            .unwrap_or_else(|| status.to_string());
        Err(ClientError::Api {
            status: status.as_u16(),
            message,
        })
    }

    pub async fn health(&self) -> Result<Value> {
        let response = self.http.get(format!("{}/health", self.base_url)).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn list_runs(&self, active_only: bool, limit: usize) -> Result<RunList> {
        let url = format!(
            "{}/runs?active_only={active_only}&limit={limit}",
            self.base_url
        );
        let response = self.http.get(url).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Value> {
        let url = format!("{}/runs/{run_id}", self.base_url);
        let response = self.http.get(url).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn run_status(&self, run_id: &str) -> Result<Value> {
        let url = format!("{}/runs/{run_id}/status", self.base_url);
        let response = self.http.get(url).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn start_run(&self, request: &Value) -> Result<Value> {
        let url = format!("{}/runs/start", self.base_url);
        let response = self.http.post(url).json(request).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn cancel_run(&self, run_id: &str) -> Result<Value> {
        let url = format!("{}/runs/{run_id}/cancel", self.base_url);
        let response = self.http.post(url).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn restart_run(&self, run_id: &str) -> Result<Value> {
        let url = format!("{}/runs/{run_id}/restart", self.base_url);
        let response = self.http.post(url).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn tail_log(
        &self,
        run_id: &str,
        name: &str,
        cursor: i64,
        lines: usize,
    ) -> Result<LogPage> {
        let url = format!(
            "{}/runs/{run_id}/logs/{name}?cursor={cursor}&lines={lines}",
            self.base_url
        );
        let response = self.http.get(url).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn engines(&self) -> Result<Value> {
        let url = format!("{}/config/engines", self.base_url);
        let response = self.http.get(url).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }
}
