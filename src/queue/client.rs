use async_trait::async_trait;
use serde::Serialize;

use crate::config::{join_url, QueueConfig};
use crate::error::{GateError, Result};
use crate::queue::job::{Job, JobId};

/// Where the poll loop gets jobs from, and where host-side notices go.
#[async_trait]
pub trait JobSource: Send + Sync {
    /// The most recently submitted job, used on the first cycle after start.
    async fn fetch_latest(&self) -> Result<Job>;

    /// The next pending job after `last_id`. Returns [`Job::none`] when
    /// nothing is pending.
    async fn fetch_next(&self, last_id: Option<&JobId>) -> Result<Job>;

    /// Best-effort log line to the remote observer.
    async fn post_log(&self, _message: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Serialize)]
struct LogLine<'a> {
    message: &'a str,
}

/// HTTP client for the remote queue and observer.
#[derive(Debug, Clone)]
pub struct QueueClient {
    http: reqwest::Client,
    latest_url: String,
    next_url: String,
    log_url: String,
    timeout_ms: u64,
}

impl QueueClient {
    pub fn new(config: &QueueConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| GateError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            latest_url: join_url(&config.base_url, &config.latest_path),
            next_url: join_url(&config.base_url, &config.next_path),
            log_url: config.log_endpoint(),
            timeout_ms: config.request_timeout_ms,
        })
    }

    async fn get_job(&self, request: reqwest::RequestBuilder, url: &str) -> Result<Job> {
        let response = request
            .send()
            .await
            .map_err(|e| self.transport_error(GateError::FetchFailed, url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GateError::FetchFailed(format!(
                "GET {} returned HTTP {}",
                url, status
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| self.transport_error(GateError::FetchFailed, url, e))?;

        serde_json::from_slice::<Job>(&body).map_err(|e| {
            GateError::FetchFailed(format!(
                "GET {} returned an unreadable job: {}; body={}",
                url,
                e,
                preview(&String::from_utf8_lossy(&body))
            ))
        })
    }

    fn transport_error(
        &self,
        kind: fn(String) -> GateError,
        url: &str,
        err: reqwest::Error,
    ) -> GateError {
        if err.is_timeout() {
            kind(format!("{} timed out after {}ms", url, self.timeout_ms))
        } else if err.is_connect() {
            kind(format!("could not connect to {}: {}", url, err))
        } else {
            kind(format!("request to {} failed: {}", url, err))
        }
    }
}

#[async_trait]
impl JobSource for QueueClient {
    async fn fetch_latest(&self) -> Result<Job> {
        tracing::debug!(url = %self.latest_url, "Fetching latest job");
        self.get_job(self.http.get(&self.latest_url), &self.latest_url)
            .await
    }

    async fn fetch_next(&self, last_id: Option<&JobId>) -> Result<Job> {
        tracing::debug!(url = %self.next_url, last_id = ?last_id.map(JobId::as_str), "Fetching next job");
        let mut request = self.http.get(&self.next_url);
        if let Some(id) = last_id {
            request = request.query(&[("lastid", id.as_str())]);
        }
        self.get_job(request, &self.next_url).await
    }

    async fn post_log(&self, message: &str) -> Result<()> {
        let response = self
            .http
            .post(&self.log_url)
            .json(&LogLine { message })
            .send()
            .await
            .map_err(|e| self.transport_error(GateError::LogDeliveryFailed, &self.log_url, e))?;

        if !response.status().is_success() {
            return Err(GateError::LogDeliveryFailed(format!(
                "POST {} returned HTTP {}",
                self.log_url,
                response.status()
            )));
        }
        Ok(())
    }
}

fn preview(body: &str) -> String {
    const LIMIT: usize = 120;
    if body.chars().count() > LIMIT {
        format!("{}...", body.chars().take(LIMIT).collect::<String>())
    } else {
        body.to_string()
    }
}
