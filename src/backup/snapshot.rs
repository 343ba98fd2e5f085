// physdbtool/src/backup/snapshot.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

use crate::errors::AppError;

const SNAPSHOT_MAX_ATTEMPTS: u32 = 10;
const SNAPSHOT_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Body of the snapshot trigger request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub name: String,
    pub key: String,
}

/// Bounded retry with a fixed delay, retrying only on the statuses it names.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub retryable_statuses: Vec<u16>,
}

impl RetryPolicy {
    pub fn snapshot_default() -> Self {
        RetryPolicy {
            max_attempts: SNAPSHOT_MAX_ATTEMPTS,
            delay: SNAPSHOT_RETRY_DELAY,
            retryable_statuses: vec![500, 502, 503, 504],
        }
    }

    pub fn is_retryable(&self, status: u16) -> bool {
        self.retryable_statuses.contains(&status)
    }
}

/// Sends the snapshot request and reports the HTTP status.
#[async_trait]
pub trait SnapshotTransport: Send + Sync {
    async fn post(&self, url: &str, request: &SnapshotRequest) -> Result<u16>;
}

pub struct HttpSnapshotTransport {
    client: reqwest::Client,
}

impl HttpSnapshotTransport {
    /// No request timeout: the trigger returns only once the volume snapshot is durable.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("Failed to build HTTP client for snapshot trigger")?;
        Ok(HttpSnapshotTransport { client })
    }
}

#[async_trait]
impl SnapshotTransport for HttpSnapshotTransport {
    async fn post(&self, url: &str, request: &SnapshotRequest) -> Result<u16> {
        let response = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .with_context(|| format!("Failed to send snapshot request to {}", url))?;
        Ok(response.status().as_u16())
    }
}

/// Asks the block-storage layer for a snapshot and waits until it is taken.
pub struct SnapshotTrigger<T: SnapshotTransport> {
    transport: T,
    url: String,
    policy: RetryPolicy,
}

impl<T: SnapshotTransport> SnapshotTrigger<T> {
    pub fn new(transport: T, url: impl Into<String>, policy: RetryPolicy) -> Self {
        SnapshotTrigger {
            transport,
            url: url.into(),
            policy,
        }
    }

    #[cfg(test)]
    pub fn set_policy(&mut self, policy: RetryPolicy) {
        self.policy = policy;
    }

    /// Returns the number of attempts it took.
    pub async fn create_snapshot(&self, request: &SnapshotRequest) -> Result<u32> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let status = self
                .transport
                .post(&self.url, request)
                .await
                .map_err(|e| {
                    anyhow::Error::new(AppError::SnapshotTrigger {
                        attempts: attempt,
                        reason: format!("{:#}", e),
                    })
                })?;

            if (200..300).contains(&status) {
                info!(snapshot = %request.name, attempt, "📸 Snapshot created");
                return Ok(attempt);
            }

            if !self.policy.is_retryable(status) {
                return Err(AppError::SnapshotTrigger {
                    attempts: attempt,
                    reason: format!("non-retryable HTTP status {}", status),
                }
                .into());
            }

            if attempt >= self.policy.max_attempts {
                return Err(AppError::SnapshotTrigger {
                    attempts: attempt,
                    reason: format!("retries exhausted, last HTTP status {}", status),
                }
                .into());
            }

            warn!(
                snapshot = %request.name,
                attempt,
                max_attempts = self.policy.max_attempts,
                status,
                "Snapshot trigger returned a server error, retrying in {:?}",
                self.policy.delay
            );
            tokio::time::sleep(self.policy.delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTransport;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            delay: Duration::ZERO,
            ..RetryPolicy::snapshot_default()
        }
    }

    fn request() -> SnapshotRequest {
        SnapshotRequest {
            name: "backup-0001".to_string(),
            key: "k3y".to_string(),
        }
    }

    #[tokio::test]
    async fn test_succeeds_on_tenth_attempt_after_nine_503() -> anyhow::Result<()> {
        let trigger = SnapshotTrigger::new(
            ScriptedTransport::new(&[503; 9]),
            "http://snapshots.local/trigger",
            fast_policy(),
        );
        assert_eq!(trigger.create_snapshot(&request()).await?, 10);
        assert_eq!(trigger.transport.requests().len(), 10);
        Ok(())
    }

    #[tokio::test]
    async fn test_fails_after_ten_503() {
        let trigger = SnapshotTrigger::new(
            ScriptedTransport::new(&[503; 10]),
            "http://snapshots.local/trigger",
            fast_policy(),
        );
        let err = trigger.create_snapshot(&request()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AppError>(),
            Some(AppError::SnapshotTrigger { attempts: 10, .. })
        ));
        assert_eq!(trigger.transport.requests().len(), 10);
    }

    #[tokio::test]
    async fn test_non_retryable_status_fails_immediately() {
        let trigger = SnapshotTrigger::new(
            ScriptedTransport::new(&[403]),
            "http://snapshots.local/trigger",
            fast_policy(),
        );
        let err = trigger.create_snapshot(&request()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AppError>(),
            Some(AppError::SnapshotTrigger { attempts: 1, .. })
        ));
        assert_eq!(trigger.transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_request_body_identifies_session() -> anyhow::Result<()> {
        let transport = ScriptedTransport::new(&[502, 201]);
        let trigger = SnapshotTrigger::new(transport, "http://snapshots.local/trigger", fast_policy());
        trigger.create_snapshot(&request()).await?;

        let requests = trigger.transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].0, "http://snapshots.local/trigger");
        assert_eq!(
            serde_json::to_value(&requests[1].1)?,
            serde_json::json!({"name": "backup-0001", "key": "k3y"})
        );
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_fixed_delay_between_attempts() -> anyhow::Result<()> {
        let trigger = SnapshotTrigger::new(
            ScriptedTransport::new(&[500, 504]),
            "http://snapshots.local/trigger",
            RetryPolicy::snapshot_default(),
        );
        let started = tokio::time::Instant::now();
        assert_eq!(trigger.create_snapshot(&request()).await?, 3);
        assert!(started.elapsed() >= Duration::from_secs(20));
        assert!(started.elapsed() < Duration::from_secs(21));
        Ok(())
    }
}
