//! Session configuration
//!
//! Everything a session needs to know up front is passed in a [`SessionConfig`];
//! the crate keeps no process-wide state.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{
    error::Error,
    protocol::{LATEST_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS},
    registry::{Capabilities, Capability},
    types::Implementation,
};

/// The default request timeout, in milliseconds
pub const DEFAULT_REQUEST_TIMEOUT_MSEC: u64 = 60_000;
pub const DEFAULT_HANDSHAKE_TIMEOUT_MSEC: u64 = 30_000;
pub const DEFAULT_CLOSE_TIMEOUT_MSEC: u64 = 5_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    /// Name and version announced to the peer
    pub implementation: Implementation,
    /// Version offered (client) or preferred (server) during the handshake
    pub protocol_version: String,
    /// Versions this side is willing to settle on
    pub supported_versions: Vec<String>,
    /// Capabilities advertised by this side
    pub capabilities: Capabilities,
    #[serde(with = "millis", rename = "requestTimeoutMs")]
    pub request_timeout: Duration,
    #[serde(with = "millis", rename = "handshakeTimeoutMs")]
    pub handshake_timeout: Duration,
    /// How long `shutdown` waits for the transport to wind down
    #[serde(with = "millis", rename = "closeTimeoutMs")]
    pub close_timeout: Duration,
    /// Usage hints a server sends back in its initialize result
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            implementation: Implementation::default(),
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            supported_versions: SUPPORTED_PROTOCOL_VERSIONS
                .iter()
                .map(|v| v.to_string())
                .collect(),
            capabilities: Capabilities::default(),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MSEC),
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MSEC),
            close_timeout: Duration::from_millis(DEFAULT_CLOSE_TIMEOUT_MSEC),
            instructions: None,
        }
    }
}

impl SessionConfig {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            implementation: Implementation {
                name: name.into(),
                version: version.into(),
            },
            ..Default::default()
        }
    }

    /// Parses a configuration from JSON, filling unspecified fields with defaults
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let config: SessionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = version.into();
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn supports_version(&self, version: &str) -> bool {
        self.supported_versions.iter().any(|v| v == version)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.implementation.name.is_empty() {
            return Err(Error::Validation("implementation name must not be empty".into()));
        }
        if !self.supports_version(&self.protocol_version) {
            return Err(Error::Validation(format!(
                "protocol version {} is not in the supported list",
                self.protocol_version
            )));
        }
        if self.request_timeout.is_zero() || self.handshake_timeout.is_zero() {
            return Err(Error::Validation("timeouts must be greater than zero".into()));
        }
        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.protocol_version, LATEST_PROTOCOL_VERSION);
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert!(config.supports_version("2024-11-05"));
        assert!(!config.supports_version("2023-10-01"));
        config.validate().unwrap();
    }

    #[test]
    fn test_from_json_partial() {
        let config = SessionConfig::from_json(
            r#"{
                "implementation": {"name": "host", "version": "1.2.3"},
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}, "logging": {}},
                "requestTimeoutMs": 1500
            }"#,
        )
        .unwrap();
        assert_eq!(config.implementation.name, "host");
        assert_eq!(config.protocol_version, "2024-11-05");
        assert_eq!(config.request_timeout, Duration::from_millis(1500));
        assert_eq!(config.handshake_timeout, Duration::from_secs(30));
        assert!(config.capabilities.contains(Capability::Tools));
        assert!(config.capabilities.contains(Capability::Logging));
    }

    #[test]
    fn test_from_json_rejects_unsupported_version() {
        let err = SessionConfig::from_json(r#"{"protocolVersion": "1999-01-01"}"#).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
