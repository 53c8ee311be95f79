use std::time::Duration;

use reqwest::StatusCode;
use runkit_protocol::RemoteRun;
use runkit_protocol::RunRecord;
use serde::Deserialize;
use thiserror::Error;

const RUNS_PATH: &str = "/api/v1/runs";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("no API key configured")]
    MissingApiKey,

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("remote service returned {status}: {body}")]
    Status { status: StatusCode, body: String },
}

#[derive(Deserialize)]
struct RunResponse {
    run: RemoteRun,
}

/// Client for the run registration endpoint.
#[derive(Debug, Clone)]
pub struct RemoteClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl RemoteClient {
    pub fn new(base_url: &str, api_key: Option<&str>) -> Result<Self, RemoteError> {
        let api_key = api_key
            .filter(|key| !key.is_empty())
            .ok_or(RemoteError::MissingApiKey)?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("runkit-worker/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    /// Creates the run or updates it if it already exists.
    pub async fn upsert_run(&self, run: &RunRecord) -> Result<RemoteRun, RemoteError> {
        let response = self
            .http
            .post(format!("{}{RUNS_PATH}", self.base_url))
            .bearer_auth(&self.api_key)
            .json(run)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Status { status, body });
        }
        let body: RunResponse = response.json().await?;
        Ok(body.run)
    }
}
