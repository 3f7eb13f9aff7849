use std::time::Duration;

use browserfetch_frame::{FrameConfig, DEFAULT_MAX_PAYLOAD};

use crate::handshake::HandshakeConfig;

/// Default listening host.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default listening port shared by every broker on the machine.
pub const DEFAULT_PORT: u16 = 9404;

/// Default per-call timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(95);

/// Delay before re-running the election after a failed relay connect.
pub const DEFAULT_RELAY_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Address the primary listens on and relays connect to.
    pub host: String,
    pub port: u16,
    /// Timeout applied to calls that do not set their own.
    pub default_timeout: Duration,
    pub relay_retry_delay: Duration,
    /// Largest wire message accepted or produced, in bytes.
    pub max_payload_size: usize,
    pub handshake: HandshakeConfig,
}

impl BrokerConfig {
    /// `host:port`, bracketing IPv6 literals.
    pub fn addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// URL sibling brokers use to reach the primary.
    pub fn relay_url(&self) -> String {
        format!("ws://{}/relay", self.addr())
    }

    pub fn frame_config(&self) -> FrameConfig {
        FrameConfig {
            max_payload_size: self.max_payload_size,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            default_timeout: DEFAULT_TIMEOUT,
            relay_retry_delay: DEFAULT_RELAY_RETRY_DELAY,
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            handshake: HandshakeConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_well_known_endpoint() {
        let config = BrokerConfig::default();
        assert_eq!(config.addr(), "127.0.0.1:9404");
        assert_eq!(config.relay_url(), "ws://127.0.0.1:9404/relay");
        assert_eq!(config.default_timeout, Duration::from_secs(95));
        assert_eq!(config.frame_config().max_payload_size, 16 * 1024 * 1024);
    }

    #[test]
    fn ipv6_hosts_are_bracketed() {
        let config = BrokerConfig {
            host: "::1".to_string(),
            port: 9500,
            ..BrokerConfig::default()
        };
        assert_eq!(config.addr(), "[::1]:9500");
    }
}
