//! Session tuning shared by both engine roles.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for session behavior.
///
/// Both sides of a connection should use the same values: a client with a
/// longer liveness timeout than its server will see the server drop it
/// before it notices anything is wrong.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a peer may stay silent before it is considered gone.
    ///
    /// Also bounds how long a partially reassembled message is kept.
    pub liveness_timeout: Duration,

    /// Largest datagram a DATA frame may occupy, header included.
    ///
    /// The default fits an Ethernet MTU after IPv4 and UDP headers.
    pub max_datagram_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            liveness_timeout: Duration::from_millis(1000),
            max_datagram_size: 1472,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_default() {
        let config = SessionConfig::default();
        assert_eq!(config.liveness_timeout, Duration::from_secs(1));
        assert_eq!(config.max_datagram_size, 1472);
    }

    #[test]
    fn test_session_config_deserialize_partial_uses_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{ "max_datagram_size": 512 }"#).unwrap();
        assert_eq!(config.max_datagram_size, 512);
        assert_eq!(config.liveness_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_session_config_json_round_trip() {
        let config = SessionConfig {
            liveness_timeout: Duration::from_millis(250),
            max_datagram_size: 600,
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: SessionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
