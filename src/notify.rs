//! Outcome notification.
//!
//! Posts the recorded outcome to the caller's evaluation URL. Delivery is
//! fire-and-forget from the coordinator's point of view: the outcome is
//! already durable in the idempotency log before the first attempt, and a
//! notification that never lands does not change what was deployed.

use rand::Rng;
use std::time::Duration;

use crate::api::types::NotificationPayload;
use crate::error::DeployError;

const MAX_ATTEMPTS: u32 = 3;
const BASE_DELAY: Duration = Duration::from_secs(2);
const MAX_DELAY: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Delivers outcome notifications with bounded retry.
#[derive(Clone)]
pub struct Notifier {
    client: reqwest::Client,
    max_attempts: u32,
    base_delay: Duration,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl Notifier {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            max_attempts: MAX_ATTEMPTS,
            base_delay: BASE_DELAY,
        }
    }

    /// Spawn delivery in the background. Terminal failure is logged, never
    /// surfaced to the request that produced the outcome.
    pub fn spawn(&self, url: String, payload: NotificationPayload) {
        let notifier = self.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.deliver(&url, &payload).await {
                tracing::error!(
                    "notification for {} round {} undeliverable: {}",
                    payload.task,
                    payload.round,
                    e
                );
            }
        });
    }

    /// Post the payload, retrying transient failures with backoff.
    pub async fn deliver(
        &self,
        url: &str,
        payload: &NotificationPayload,
    ) -> Result<(), DeployError> {
        let mut last_error = String::new();

        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(self.base_delay, attempt)).await;
            }

            match self
                .client
                .post(url)
                .timeout(REQUEST_TIMEOUT)
                .json(payload)
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => {
                    tracing::info!(
                        "notified {} for {} round {} (attempt {})",
                        url,
                        payload.task,
                        payload.round,
                        attempt + 1
                    );
                    return Ok(());
                }
                Ok(response) => {
                    let status = response.status();
                    last_error = format!("HTTP {}", status.as_u16());
                    if !is_transient_status(status.as_u16()) {
                        // A 4xx other than 429 will not change on retry.
                        break;
                    }
                    tracing::warn!(
                        "notification attempt {} to {} got {}, will retry",
                        attempt + 1,
                        url,
                        status
                    );
                }
                Err(e) => {
                    last_error = e.to_string();
                    tracing::warn!(
                        "notification attempt {} to {} failed: {}",
                        attempt + 1,
                        url,
                        e
                    );
                }
            }
        }

        Err(DeployError::NotificationFailed(last_error))
    }
}

/// Retryable response statuses: rate limits and server-side errors.
fn is_transient_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

/// Exponential backoff with jitter, capped at [`MAX_DELAY`].
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
    let capped = exp.min(MAX_DELAY);
    let jitter = rand::thread_rng().gen_range(0.8..1.2);
    capped.mul_f64(jitter)
}
