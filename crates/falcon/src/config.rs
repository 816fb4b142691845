//! Engine configuration.

use std::time::Duration;

use falcon_protocol::DATA_HEADER_LEN;
use falcon_session::SessionConfig;
use serde::{Deserialize, Serialize};

use crate::FalconError;

/// Largest payload a single UDP datagram can carry over IPv4.
pub const MAX_UDP_PAYLOAD: usize = 65_507;

/// Configuration shared by [`FalconClient`](crate::FalconClient) and
/// [`FalconServer`](crate::FalconServer).
///
/// Every field has a default, so a config file only needs the values it
/// changes:
///
/// ```
/// # use falcon::FalconConfig;
/// let config: FalconConfig =
///     serde_json::from_str(r#"{ "receive_timeout": { "secs": 0, "nanos": 20000000 } }"#)
///         .unwrap();
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FalconConfig {
    /// Liveness and datagram sizing, used by both roles.
    pub session: SessionConfig,

    /// How long a client waits for CONNECT_ACK.
    pub connect_timeout: Duration,

    /// How often pending reliable payloads are resent.
    pub retransmit_interval: Duration,

    /// Longest single wait on the transport. Bounds how quickly the
    /// listener loop notices timers and the stop flag.
    pub receive_timeout: Duration,
}

impl Default for FalconConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            connect_timeout: Duration::from_millis(1000),
            retransmit_interval: Duration::from_millis(500),
            receive_timeout: Duration::from_millis(100),
        }
    }
}

impl FalconConfig {
    /// Checks that the values can work together.
    ///
    /// # Errors
    /// [`FalconError::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<(), FalconError> {
        let size = self.session.max_datagram_size;
        if size <= DATA_HEADER_LEN || size > MAX_UDP_PAYLOAD {
            return Err(invalid(format!(
                "max_datagram_size must be in {}..={MAX_UDP_PAYLOAD}, got {size}",
                DATA_HEADER_LEN + 1
            )));
        }

        let liveness = self.session.liveness_timeout;
        for (name, value) in [
            ("liveness_timeout", liveness),
            ("connect_timeout", self.connect_timeout),
            ("retransmit_interval", self.retransmit_interval),
            ("receive_timeout", self.receive_timeout),
        ] {
            if value.is_zero() {
                return Err(invalid(format!("{name} must be non-zero")));
            }
        }

        if self.retransmit_interval >= liveness {
            return Err(invalid(
                "retransmit_interval must be shorter than liveness_timeout",
            ));
        }
        if self.receive_timeout >= liveness {
            return Err(invalid(
                "receive_timeout must be shorter than liveness_timeout",
            ));
        }

        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> FalconError {
    FalconError::InvalidConfig(reason.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_falcon_config_default_is_valid() {
        let config = FalconConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retransmit_interval, Duration::from_millis(500));
        assert_eq!(config.receive_timeout, Duration::from_millis(100));
        assert_eq!(config.connect_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_validate_tiny_datagram_rejected() {
        let mut config = FalconConfig::default();
        config.session.max_datagram_size = DATA_HEADER_LEN;
        assert!(matches!(config.validate(), Err(FalconError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_oversized_datagram_rejected() {
        let mut config = FalconConfig::default();
        config.session.max_datagram_size = MAX_UDP_PAYLOAD + 1;
        assert!(matches!(config.validate(), Err(FalconError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_zero_timeout_rejected() {
        let config = FalconConfig {
            connect_timeout: Duration::ZERO,
            ..FalconConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("connect_timeout"));
    }

    #[test]
    fn test_validate_retransmit_not_shorter_than_liveness_rejected() {
        let config = FalconConfig {
            retransmit_interval: Duration::from_secs(1),
            ..FalconConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("retransmit_interval"));
    }

    #[test]
    fn test_falcon_config_deserialize_nested_session() {
        let json = r#"{
            "session": { "max_datagram_size": 512 },
            "retransmit_interval": { "secs": 0, "nanos": 250000000 }
        }"#;
        let config: FalconConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.session.max_datagram_size, 512);
        assert_eq!(config.session.liveness_timeout, Duration::from_secs(1));
        assert_eq!(config.retransmit_interval, Duration::from_millis(250));
        assert!(config.validate().is_ok());
    }
}
