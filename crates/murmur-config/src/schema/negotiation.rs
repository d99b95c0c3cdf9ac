//! Offer/answer negotiation settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    /// Forces the collision role. Polite peers roll back their own offer
    /// when offers collide; impolite peers ignore the remote offer. When
    /// unset, the peer with the greater user id is polite.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub polite: Option<bool>,
    /// How long an offer may go unanswered before it is rolled back and
    /// sent again.
    pub offer_timeout_ms: u64,
    /// ICE restarts attempted before the connection is reported failed.
    pub ice_restart_max_attempts: u32,
    /// Delay before the first ICE restart; doubles per attempt.
    pub ice_restart_backoff_ms: u64,
    pub ice_restart_max_backoff_ms: u64,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            polite: None,
            offer_timeout_ms: 10_000,
            ice_restart_max_attempts: 5,
            ice_restart_backoff_ms: 500,
            ice_restart_max_backoff_ms: 8000,
        }
    }
}

impl NegotiationConfig {
    pub fn offer_timeout(&self) -> Duration {
        Duration::from_millis(self.offer_timeout_ms)
    }

    /// Backoff before restart number `attempt` (zero-based).
    pub fn restart_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let ms = self
            .ice_restart_backoff_ms
            .saturating_mul(factor)
            .min(self.ice_restart_max_backoff_ms);
        Duration::from_millis(ms)
    }
}
