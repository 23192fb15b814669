use std::path::Path;
use std::time::Duration;

use huddle_media::{RateLimit, SubscriptionLimits};
use serde::{Deserialize, Serialize};

use crate::errors::HuddleError;

/// Exponential backoff for transport reconnection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub initial_delay_ms: u64,
    pub backoff_coefficient: f64,
    pub max_delay_ms: u64,
    /// Give up and leave the session after this long without a link.
    pub timeout_ms: u64,
    /// Random spread added to each delay, as a fraction of it.
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            backoff_coefficient: 2.0,
            max_delay_ms: 8_000,
            timeout_ms: 60_000,
            jitter: 0.2,
        }
    }
}

impl ReconnectPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Delay before attempt `attempt` (1-based), jitter excluded.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .backoff_coefficient
            .powi(attempt.saturating_sub(1).min(32) as i32);
        let ms = (self.initial_delay_ms as f64 * exp).min(self.max_delay_ms as f64);
        Duration::from_millis(ms as u64)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        use rand::Rng;
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let spread = base.as_secs_f64() * self.jitter;
        let extra = rand::thread_rng().gen_range(0.0..=spread);
        base + Duration::from_secs_f64(extra)
    }
}

/// Tunables of the engine. Every field has a default so a partial JSON
/// file is enough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub subscriptions: SubscriptionLimits,
    pub reconnect: ReconnectPolicy,
    pub max_password_attempts: u32,
    pub password_prompt_timeout_ms: u64,
    pub max_command_bytes: usize,
    /// Shared by every command sent from this engine.
    pub command_rate: RateLimit,
    pub file_chunk_bytes: usize,
    /// Raw frames buffered between a source and its send worker.
    pub send_queue_depth: usize,
    /// Encoded packets buffered on the media uplink.
    pub uplink_queue_depth: usize,
    pub max_spotlighted_users: usize,
    pub max_sub_sessions: usize,
    pub max_session_name_len: usize,
    pub max_user_identity_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            subscriptions: SubscriptionLimits::default(),
            reconnect: ReconnectPolicy::default(),
            max_password_attempts: 3,
            password_prompt_timeout_ms: 60_000,
            max_command_bytes: 1024,
            command_rate: RateLimit {
                max_calls: 10,
                window_ms: 1_000,
            },
            file_chunk_bytes: 64 * 1024,
            send_queue_depth: 8,
            uplink_queue_depth: 256,
            max_spotlighted_users: 9,
            max_sub_sessions: 50,
            max_session_name_len: 200,
            max_user_identity_len: 35,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, HuddleError> {
        serde_json::from_str(json)
            .map_err(|e| HuddleError::InvalidParameter(format!("engine config: {e}")))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, HuddleError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            HuddleError::InvalidParameter(format!("engine config {}: {e}", path.display()))
        })?;
        Self::from_json_str(&contents)
    }

    pub fn password_prompt_timeout(&self) -> Duration {
        Duration::from_millis(self.password_prompt_timeout_ms)
    }
}
