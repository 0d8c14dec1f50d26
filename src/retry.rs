//! Exponential backoff and bounded send retries.

use std::time::Duration;

use rand::Rng;

use crate::error::GatewayError;
use crate::gateway::MessageGateway;
use crate::types::{ChannelId, MessageId};

/// Exponential backoff policy: base delay doubling per attempt, capped,
/// with multiplicative jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound on any single delay (pre-jitter).
    pub cap: Duration,
    /// Jitter fraction in [0, 1]: each delay is scaled by a random factor
    /// in [1 - jitter, 1 + jitter].
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

impl Backoff {
    /// Delay for the given zero-based attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
            .min(self.cap);

        if self.jitter <= 0.0 {
            return exp;
        }

        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        exp.mul_f64(factor.max(0.0))
    }
}

/// Send with bounded retries: transient failures back off and retry up to
/// `max_attempts`; fatal failures return immediately. Each attempt runs
/// under `call_timeout` (a timed-out call counts as transient).
pub async fn send_with_retry(
    gateway: &dyn MessageGateway,
    channel: &ChannelId,
    content: &str,
    sender_tag: &str,
    backoff: &Backoff,
    max_attempts: u32,
    call_timeout: Duration,
) -> Result<MessageId, GatewayError> {
    let mut attempt = 0u32;
    loop {
        let result = tokio::time::timeout(call_timeout, gateway.send(channel, content, sender_tag))
            .await
            .unwrap_or_else(|_| {
                Err(GatewayError::transient(format!(
                    "send timed out after {call_timeout:?}"
                )))
            });

        match result {
            Ok(id) => return Ok(id),
            Err(e @ GatewayError::Fatal { .. }) => return Err(e),
            Err(e @ GatewayError::Transient { .. }) => {
                attempt += 1;
                if attempt >= max_attempts {
                    return Err(e);
                }
                tracing::debug!(
                    channel = %channel,
                    attempt,
                    error = %e,
                    "send failed, backing off"
                );
                tokio::time::sleep(backoff.delay(attempt - 1)).await;
            }
        }
    }
}
