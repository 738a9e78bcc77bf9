//! Heartbeat client used by the agent

use crate::error::StatusError;
use crate::models::HeartbeatResponse;
use std::time::Duration;

const USER_AGENT: &str = "spacelink-status";

/// Sends one-shot heartbeats to a status server
#[derive(Debug, Clone)]
pub struct HeartbeatClient {
    client: reqwest::Client,
    url: String,
}

impl HeartbeatClient {
    pub fn new(url: impl Into<String>) -> Result<Self, StatusError> {
        Self::with_timeout(url, Duration::from_secs(5))
    }

    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Result<Self, StatusError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// POST `<url>?open=true` and check the reply
    pub async fn send(&self) -> Result<HeartbeatResponse, StatusError> {
        let response = self
            .client
            .post(&self.url)
            .query(&[("open", "true")])
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            return Err(StatusError::UnexpectedStatus {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        let reply: HeartbeatResponse = serde_json::from_slice(&body)?;
        if let Some(error) = reply.error.as_deref().filter(|e| !e.is_empty()) {
            return Err(StatusError::Rejected(error.to_string()));
        }

        Ok(reply)
    }
}
