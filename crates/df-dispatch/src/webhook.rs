//! HTTP webhook delivery executor.
//!
//! The one concrete [`JobExecutor`] the fabric ships: a dispatch job whose
//! payload is a webhook request descriptor gets POSTed to its target.
//! Status classes map to retry classes: 5xx and transport errors are
//! retryable, most 4xx are configuration problems that retrying cannot fix.

use std::time::Duration;

use async_trait::async_trait;
use df_common::DispatchJob;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::queue::{JobError, JobExecutor};

/// Webhook request descriptor carried as a job payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookRequest {
    pub url: String,
    pub body: serde_json::Value,
    #[serde(default)]
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HttpExecutorConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for HttpExecutorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

pub struct HttpJobExecutor {
    client: reqwest::Client,
}

impl HttpJobExecutor {
    pub fn new(config: HttpExecutorConfig) -> Result<Self, crate::DispatchError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| crate::DispatchError::Executor(e.to_string()))?;
        Ok(Self { client })
    }
}

/// Map an HTTP status to a job outcome. `None` means success.
fn classify_status(status: u16) -> Option<JobError> {
    match status {
        200..=299 => None,
        // Retrying won't fix a request the receiver rejects as malformed
        // or forbidden.
        400 | 403 | 404 | 405 | 410 | 422 => {
            Some(JobError::Permanent(format!("receiver rejected: HTTP {status}")))
        }
        _ => Some(JobError::Retryable(format!("HTTP {status}"))),
    }
}

#[async_trait]
impl JobExecutor for HttpJobExecutor {
    async fn execute(&self, job: &DispatchJob) -> Result<(), JobError> {
        let request: WebhookRequest = serde_json::from_value(job.payload.clone())
            .map_err(|e| JobError::Permanent(format!("malformed webhook descriptor: {e}")))?;

        let mut builder = self.client.post(&request.url).json(&request.body);
        if let Some(token) = &request.auth_token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }

        match builder.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                match classify_status(status) {
                    None => {
                        debug!(job_id = %job.id, url = %request.url, status = status, "Webhook delivered");
                        Ok(())
                    }
                    Some(err) => {
                        warn!(job_id = %job.id, url = %request.url, status = status, "Webhook delivery failed");
                        Err(err)
                    }
                }
            }
            Err(e) => {
                warn!(job_id = %job.id, url = %request.url, error = %e, "Webhook transport error");
                Err(JobError::Retryable(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn success_statuses_are_not_errors() {
        assert!(classify_status(200).is_none());
        assert!(classify_status(204).is_none());
    }

    #[test]
    fn client_config_errors_are_permanent() {
        assert!(matches!(classify_status(400), Some(JobError::Permanent(_))));
        assert!(matches!(classify_status(404), Some(JobError::Permanent(_))));
        assert!(matches!(classify_status(422), Some(JobError::Permanent(_))));
    }

    #[test]
    fn server_and_throttle_errors_are_retryable() {
        assert!(matches!(classify_status(500), Some(JobError::Retryable(_))));
        assert!(matches!(classify_status(503), Some(JobError::Retryable(_))));
        assert!(matches!(classify_status(429), Some(JobError::Retryable(_))));
        assert!(matches!(classify_status(401), Some(JobError::Retryable(_))));
    }

    #[tokio::test]
    async fn malformed_descriptor_fails_permanently() {
        let executor = HttpJobExecutor::new(HttpExecutorConfig::default()).unwrap();
        let job = DispatchJob::new(json!({ "not": "a descriptor" }));

        let err = executor.execute(&job).await.unwrap_err();
        assert!(matches!(err, JobError::Permanent(_)));
    }
}
