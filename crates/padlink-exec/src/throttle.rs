//! Trailing-edge throttling for high-frequency value streams.
//!
//! A joystick reports far more often than it is worth sending over the
//! network. [`ThrottledBuffer`] bounds the outbound rate to one value per
//! interval without ever losing the most recent sample:
//!
//! ```text
//! insert:   a    b       c     d
//! time:     0    5       12    18        (interval = 10)
//! handler:  a         b           d
//!           0         10          20
//! ```
//!
//! The first value after a quiet period goes out immediately and starts a
//! cooldown. Values arriving during the cooldown overwrite a single pending
//! slot. When the cooldown ends, a pending value is flushed and the cooldown
//! restarts; with nothing pending the buffer goes quiet again.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Rate limit for an outbound stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Maximum deliveries per second. 0 disables throttling: every value is
    /// passed straight through.
    pub rate_hz: u32,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self { rate_hz: 60 }
    }
}

impl ThrottleConfig {
    /// Maximum supported rate.
    pub const MAX_RATE_HZ: u32 = 1000;

    /// Create a config for a specific rate.
    pub fn with_rate(rate_hz: u32) -> Self {
        Self { rate_hz }
    }

    /// Clamp out-of-range values so the config is safe to use.
    ///
    /// Called automatically by [`ThrottledBuffer::from_config`].
    pub fn validated(mut self) -> Self {
        if self.rate_hz > Self::MAX_RATE_HZ {
            warn!(
                rate = self.rate_hz,
                max = Self::MAX_RATE_HZ,
                "throttle rate exceeds maximum, clamping"
            );
            self.rate_hz = Self::MAX_RATE_HZ;
        }
        self
    }

    /// Length of one throttle window. `Duration::ZERO` when disabled.
    pub fn interval(&self) -> Duration {
        if self.rate_hz == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(1.0 / self.rate_hz as f64)
        }
    }
}

// ---------------------------------------------------------------------------
// ThrottledBuffer
// ---------------------------------------------------------------------------

/// A trailing-edge coalescing rate limiter.
///
/// Owns a Tokio task that holds the pending slot and the cooldown timer, so
/// [`insert`](Self::insert) is safe to call from anywhere and inserts are
/// applied in the order they were made. The handler runs on that task.
///
/// Dropping the buffer stops the task; a value still pending at that point
/// is discarded.
pub struct ThrottledBuffer<T> {
    sender: mpsc::UnboundedSender<T>,
    interval: Duration,
}

impl<T: Send + 'static> ThrottledBuffer<T> {
    /// Creates a buffer that hands values to `handler` at most once per
    /// `interval`.
    pub fn new<F>(interval: Duration, handler: F) -> Self
    where
        F: FnMut(T) + Send + 'static,
    {
        let (sender, receiver) = mpsc::unbounded_channel();
        debug!(interval_ms = interval.as_secs_f64() * 1000.0, "throttled buffer created");
        tokio::spawn(run(receiver, interval, handler));
        Self { sender, interval }
    }

    /// Creates a buffer from a [`ThrottleConfig`].
    pub fn from_config<F>(config: ThrottleConfig, handler: F) -> Self
    where
        F: FnMut(T) + Send + 'static,
    {
        Self::new(config.validated().interval(), handler)
    }

    /// Offers a new value. Always replaces whatever is pending.
    pub fn insert(&self, value: T) {
        if self.sender.send(value).is_err() {
            trace!("throttled buffer task gone, value dropped");
        }
    }

    /// The throttle window.
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

async fn run<T, F>(mut receiver: mpsc::UnboundedReceiver<T>, interval: Duration, mut handler: F)
where
    F: FnMut(T),
{
    let mut pending: Option<T> = None;
    let mut cooldown_until: Option<Instant> = None;

    loop {
        tokio::select! {
            biased;

            received = receiver.recv() => {
                let Some(value) = received else {
                    break;
                };
                if interval.is_zero() {
                    handler(value);
                } else if cooldown_until.is_some() {
                    pending = Some(value);
                } else {
                    handler(value);
                    cooldown_until = Some(Instant::now() + interval);
                }
            }

            () = time::sleep_until(cooldown_until.unwrap_or_else(Instant::now)),
                if cooldown_until.is_some() =>
            {
                match pending.take() {
                    Some(value) => {
                        trace!("flushing trailing value");
                        handler(value);
                        cooldown_until = Some(Instant::now() + interval);
                    }
                    None => cooldown_until = None,
                }
            }
        }
    }

    trace!("throttled buffer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rate_is_sixty_hz() {
        let cfg = ThrottleConfig::default();
        assert_eq!(cfg.rate_hz, 60);
        assert_eq!(cfg.interval(), Duration::from_secs_f64(1.0 / 60.0));
    }

    #[test]
    fn test_zero_rate_disables_throttling() {
        assert_eq!(ThrottleConfig::with_rate(0).interval(), Duration::ZERO);
    }

    #[test]
    fn test_validated_clamps_rate() {
        let cfg = ThrottleConfig::with_rate(50_000).validated();
        assert_eq!(cfg.rate_hz, ThrottleConfig::MAX_RATE_HZ);
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let cfg: ThrottleConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, ThrottleConfig::default());
        let cfg: ThrottleConfig = serde_json::from_str(r#"{"rate_hz": 30}"#).unwrap();
        assert_eq!(cfg.rate_hz, 30);
    }
}
