//! Session configuration.

use std::time::Duration;

use padlink_exec::ThrottleConfig;
use serde::{Deserialize, Serialize};

/// How long a silent peer keeps its controllers, and how fast local device
/// input is sampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds a disconnected peer's controllers wait for a reconnect
    /// before they are reported removed.
    ///
    /// Default: 12 seconds.
    pub grace_period_secs: u64,

    /// Rate limit applied to button and joystick messages coming from
    /// local devices.
    pub throttle: ThrottleConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 12,
            throttle: ThrottleConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_grace_period_is_twelve_seconds() {
        let config = SessionConfig::default();
        assert_eq!(config.grace_period(), Duration::from_secs(12));
        assert_eq!(config.throttle.rate_hz, 60);
    }

    #[test]
    fn test_deserialize_partial_config_fills_defaults() {
        let config: SessionConfig = serde_json::from_str(r#"{"grace_period_secs": 3}"#).unwrap();
        assert_eq!(config.grace_period_secs, 3);
        assert_eq!(config.throttle, ThrottleConfig::default());

        let config: SessionConfig =
            serde_json::from_str(r#"{"throttle": {"rate_hz": 0}}"#).unwrap();
        assert_eq!(config.grace_period_secs, 12);
        assert_eq!(config.throttle.interval(), Duration::ZERO);
    }
}
