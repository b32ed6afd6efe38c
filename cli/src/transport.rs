use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;

use nestling_core::models::{MutationResponse, QueuedMutation, RejectReason};
use nestling_core::orchestrator::{
    DEFAULT_SUBMIT_TIMEOUT, MutationTransport, SubmitAck, SubmitError, interpret_response,
};

use crate::server::BABY_HEADER;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Submits queued mutations to a `nestling serve` instance.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    token: String,
    baby_id: Option<String>,
}

impl HttpTransport {
    pub fn new(base_url: &str, token: String, baby_id: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!(
                "nestling/{} (baby tracker sync)",
                env!("CARGO_PKG_VERSION")
            ))
            .timeout(DEFAULT_SUBMIT_TIMEOUT)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            baby_id,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Whether the server answers its health check.
    pub async fn probe(&self) -> bool {
        let result = self
            .client
            .get(self.url("/api/health"))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await;
        match result {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!("health probe failed: {e}");
                false
            }
        }
    }
}

fn reset_header(headers: &reqwest::header::HeaderMap) -> Option<DateTime<Utc>> {
    headers
        .get("x-ratelimit-reset")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}

/// Classify a response whose body could not be read as a `MutationResponse`.
fn classify_unparsed(status: StatusCode, reset_at: Option<DateTime<Utc>>) -> SubmitError {
    match status {
        StatusCode::UNAUTHORIZED => SubmitError::Unauthenticated(format!("server returned {status}")),
        StatusCode::TOO_MANY_REQUESTS => SubmitError::RateLimited { reset_at },
        // Without a body there is no telling item refusals from caller ones; keep the queue.
        StatusCode::FORBIDDEN => SubmitError::Forbidden(format!("server returned {status}")),
        StatusCode::UNPROCESSABLE_ENTITY
        | StatusCode::BAD_REQUEST
        | StatusCode::PAYLOAD_TOO_LARGE => SubmitError::Rejected {
            reason: RejectReason::Validation,
            message: format!("server returned {status}"),
        },
        _ => SubmitError::Transient(format!("unexpected response: {status}")),
    }
}

#[async_trait]
impl MutationTransport for HttpTransport {
    async fn submit(&self, mutation: &QueuedMutation) -> Result<SubmitAck, SubmitError> {
        let mut request = self
            .client
            .post(self.url("/api/mutations"))
            .bearer_auth(&self.token)
            .json(mutation);
        if let Some(baby_id) = &self.baby_id {
            request = request.header(BABY_HEADER, baby_id);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| SubmitError::Transient(format!("failed to reach server: {e}")))?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(SubmitError::Transient(format!("server returned {status}")));
        }
        let reset_at = reset_header(resp.headers());

        match resp.json::<MutationResponse>().await {
            Ok(body) => interpret_response(body),
            Err(e) => {
                tracing::warn!(%status, "unreadable mutation response: {e}");
                Err(classify_unparsed(status, reset_at))
            }
        }
    }
}
