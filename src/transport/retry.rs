//! Caller-side bounded publish retry

use super::{PublishOutcome, QoS, Transport};
use std::time::Duration;
use tracing::{debug, warn};

/// How a caller retries a publish that did not come back `Ok`
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub attempts: u32,
    /// Pause between attempts
    pub delay: Duration,
    /// Acknowledgment wait per attempt
    pub timeout: Duration,
    /// Resend after an unconfirmed (timed out) attempt
    pub retry_unconfirmed: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_millis(200),
            timeout: Duration::from_secs(5),
            retry_unconfirmed: true,
        }
    }
}

impl RetryPolicy {
    /// One attempt, no resend
    pub fn single(timeout: Duration) -> Self {
        Self {
            attempts: 1,
            delay: Duration::ZERO,
            timeout,
            retry_unconfirmed: false,
        }
    }
}

/// Publish with the policy's bounded retry loop
///
/// Stops early on `Ok` and `Error`; returns the last outcome seen. A
/// `Timeout` is retried only if the policy opts into duplicate sends.
pub async fn publish_with_retry(
    transport: &dyn Transport,
    topic: &str,
    payload: &[u8],
    qos: QoS,
    retain: bool,
    policy: &RetryPolicy,
) -> PublishOutcome {
    let attempts = policy.attempts.max(1);
    let mut outcome = PublishOutcome::RetryLater;

    for attempt in 1..=attempts {
        outcome = transport
            .publish(topic, payload.to_vec(), qos, retain, policy.timeout)
            .await;

        match outcome {
            PublishOutcome::Ok => return outcome,
            PublishOutcome::Error => {
                warn!(topic = %topic, attempt, "Publish failed permanently");
                return outcome;
            }
            PublishOutcome::Timeout if !policy.retry_unconfirmed => {
                warn!(topic = %topic, attempt, "Publish unconfirmed, not resending");
                return outcome;
            }
            PublishOutcome::Timeout | PublishOutcome::RetryLater => {
                debug!(topic = %topic, attempt, outcome = %outcome, "Publish not confirmed");
                if attempt < attempts {
                    tokio::time::sleep(policy.delay).await;
                }
            }
        }
    }

    warn!(topic = %topic, attempts, outcome = %outcome, "Publish gave up after all attempts");
    outcome
}
