//! Browser and client configuration.

use std::net::{IpAddr, Ipv4Addr};

use padlink_exec::ThrottleConfig;
use padlink_session::SessionConfig;
use serde::{Deserialize, Serialize};

/// Service identifier both sides agree on unless configured otherwise.
pub const DEFAULT_SERVICE_IDENTIFIER: &str = "controllerkit";

/// Configuration for a [`ControllerBrowser`](crate::ControllerBrowser).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// Service name published to discovery.
    pub name: String,

    /// Services are published as `_<service_identifier>._tcp`.
    pub service_identifier: String,

    /// Host the TCP acceptor and the UDP input socket bind to. Both take
    /// an ephemeral port.
    ///
    /// Default: every interface.
    pub bind_host: IpAddr,

    /// Grace period for remote peers and throttling for local devices.
    pub session: SessionConfig,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            name: "Padlink".to_owned(),
            service_identifier: DEFAULT_SERVICE_IDENTIFIER.to_owned(),
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            session: SessionConfig::default(),
        }
    }
}

/// Configuration for a [`Client`](crate::Client).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Name used in log output.
    pub name: String,

    /// Searches for `_<service_identifier>._tcp`.
    pub service_identifier: String,

    /// How often each controller's state is streamed at most.
    ///
    /// Default: 60 Hz.
    pub throttle: ThrottleConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "padlink-client".to_owned(),
            service_identifier: DEFAULT_SERVICE_IDENTIFIER.to_owned(),
            throttle: ThrottleConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_browser_config_defaults() {
        let config = BrowserConfig::default();
        assert_eq!(config.service_identifier, "controllerkit");
        assert!(config.bind_host.is_unspecified());
        assert_eq!(config.session.grace_period_secs, 12);
    }

    #[test]
    fn test_browser_config_from_partial_json() {
        let config: BrowserConfig = serde_json::from_str(
            r#"{"name": "Living Room", "bind_host": "127.0.0.1", "session": {"grace_period_secs": 2}}"#,
        )
        .unwrap();
        assert_eq!(config.name, "Living Room");
        assert_eq!(config.bind_host, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.session.grace_period_secs, 2);
        assert_eq!(config.service_identifier, DEFAULT_SERVICE_IDENTIFIER);
    }

    #[test]
    fn test_client_config_from_partial_json() {
        let config: ClientConfig = serde_json::from_str(r#"{"throttle": {"rate_hz": 30}}"#).unwrap();
        assert_eq!(config.throttle.rate_hz, 30);
        assert_eq!(config.name, "padlink-client");
    }
}
