//! Webhook delivery for completed jobs.
//!
//! Delivery is at-least-once from the subscriber's perspective; subscribers
//! deduplicate on `jobId`. A webhook is only marked delivered after a 2xx
//! response from the target.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::jobs::{current_timestamp_ms, JobStore, JobStoreError, WebhookRecord};

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);
const BASE_RETRY_DELAY_MS: i64 = 30_000;
const MAX_RETRY_DELAY_MS: i64 = 600_000;

/// Exponential backoff with jitter for webhook redelivery.
pub fn calculate_retry_backoff(attempts: u32, base_delay_ms: i64, max_delay_ms: i64) -> i64 {
    use rand::Rng;
    debug_assert!(base_delay_ms > 0);
    debug_assert!(max_delay_ms >= base_delay_ms);

    let exponent = attempts.min(20);
    let multiplier = 2_i64.saturating_pow(exponent);
    let capped = base_delay_ms.saturating_mul(multiplier).min(max_delay_ms);

    let mut rng = rand::thread_rng();
    let jitter_factor = rng.gen_range(0.9..=1.1);
    let final_delay = ((capped as f64) * jitter_factor) as i64;

    final_delay.clamp(base_delay_ms, max_delay_ms)
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Store(#[from] Box<JobStoreError>),
}

impl From<JobStoreError> for WebhookError {
    fn from(e: JobStoreError) -> Self {
        WebhookError::Store(Box::new(e))
    }
}

/// Body POSTed to each registered webhook.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookPayload<'a> {
    job_id: &'a str,
    status: &'static str,
    timestamp: String,
}

pub struct WebhookNotifier {
    client: reqwest::Client,
    store: Arc<dyn JobStore>,
}

impl WebhookNotifier {
    pub fn new(store: Arc<dyn JobStore>) -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()?;
        Ok(Self { client, store })
    }

    /// Deliver the completion notification to every undelivered webhook of the
    /// job. Hooks that exhaust their attempts are left undelivered with the
    /// last error recorded.
    pub async fn notify_completed(&self, job_id: &str) -> Result<(), WebhookError> {
        let hooks = self.store.webhooks_for_job(job_id)?;
        for hook in hooks {
            if !hook.pending_delivery() {
                continue;
            }
            self.attempt_delivery(hook).await?;
        }
        Ok(())
    }

    /// Retry undelivered webhooks whose backoff window has passed. Run
    /// periodically by the worker pool.
    pub async fn sweep_undelivered(&self, limit: usize) -> Result<usize, WebhookError> {
        let due = self.store.due_webhooks(current_timestamp_ms(), limit)?;
        let count = due.len();
        for hook in due {
            self.attempt_delivery(hook).await?;
        }
        Ok(count)
    }

    async fn attempt_delivery(&self, mut hook: WebhookRecord) -> Result<(), WebhookError> {
        let now_ms = current_timestamp_ms();
        hook.attempts += 1;
        hook.last_attempt_at_ms = Some(now_ms);

        let payload = WebhookPayload {
            job_id: &hook.job_id,
            status: "completed",
            timestamp: rfc3339(now_ms),
        };

        match self.client.post(&hook.url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                hook.delivered = true;
                hook.delivered_at_ms = Some(now_ms);
                hook.next_attempt_at_ms = None;
                hook.error = None;
                tracing::info!(
                    job_id = %hook.job_id,
                    webhook_id = %hook.webhook_id,
                    "webhook delivered"
                );
            }
            Ok(response) => {
                hook.error = Some(format!("target returned status {}", response.status()));
                hook.next_attempt_at_ms = Some(
                    now_ms
                        + calculate_retry_backoff(hook.attempts, BASE_RETRY_DELAY_MS, MAX_RETRY_DELAY_MS),
                );
                tracing::warn!(
                    job_id = %hook.job_id,
                    webhook_id = %hook.webhook_id,
                    status = response.status().as_u16(),
                    attempts = hook.attempts,
                    "webhook delivery rejected"
                );
            }
            Err(error) => {
                hook.error = Some(error.to_string());
                hook.next_attempt_at_ms = Some(
                    now_ms
                        + calculate_retry_backoff(hook.attempts, BASE_RETRY_DELAY_MS, MAX_RETRY_DELAY_MS),
                );
                tracing::warn!(
                    job_id = %hook.job_id,
                    webhook_id = %hook.webhook_id,
                    %error,
                    attempts = hook.attempts,
                    "webhook delivery failed"
                );
            }
        }

        self.store.update_webhook(&hook)?;
        Ok(())
    }
}

fn rfc3339(at_ms: i64) -> String {
    Utc.timestamp_millis_opt(at_ms)
        .single()
        .unwrap_or_else(Utc::now)
        .to_rfc3339()
}
