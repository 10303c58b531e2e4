//! Transport configuration for reaching the proxy.
//!
//! A `TransportConfig` is an immutable value: the only permitted mutation
//! is substituting the host after DNS resolution, which produces a new
//! value via [`TransportConfig::with_host`].

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Serialized proxy connection parameters.
///
/// Field order matters: the JSON handed to the forwarding process via
/// `-transport` is `{"host":..,"port":..,"method":..,"password":..}` with
/// `prefix` appended only when present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Proxy hostname or IP address.
    pub host: String,
    /// Proxy port.
    pub port: u16,
    /// Cipher name (e.g. `chacha20-ietf-poly1305`).
    pub method: String,
    /// Proxy secret.
    pub password: String,
    /// Optional obfuscation prefix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

impl TransportConfig {
    /// Produce a new config with the host replaced (after DNS resolution).
    /// The original value is left untouched.
    pub fn with_host(&self, host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..self.clone()
        }
    }

    /// Fail fast on a config that cannot possibly reach a proxy.
    ///
    /// Called before any process is spawned or routing is touched.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::InvalidConfig("host is empty".into()));
        }
        if self.port == 0 {
            return Err(Error::InvalidConfig("port is zero".into()));
        }
        if self.method.is_empty() {
            return Err(Error::InvalidConfig("cipher method is empty".into()));
        }
        if self.password.is_empty() {
            return Err(Error::InvalidConfig("password is empty".into()));
        }
        Ok(())
    }

    /// Serialize to the JSON shape the forwarding process expects.
    pub fn to_transport_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample() -> TransportConfig {
        TransportConfig {
            host: "proxy.example.com".to_string(),
            port: 443,
            method: "chacha20-ietf-poly1305".to_string(),
            password: "pw".to_string(),
            prefix: None,
        }
    }

    #[test]
    fn transport_json_shape() {
        let json = sample().to_transport_json().unwrap();
        assert_eq!(
            json,
            r#"{"host":"proxy.example.com","port":443,"method":"chacha20-ietf-poly1305","password":"pw"}"#
        );
    }

    #[test]
    fn prefix_serialized_when_present() {
        let mut config = sample();
        config.prefix = Some("\u{1}\u{2}".to_string());
        let json = config.to_transport_json().unwrap();
        assert!(json.contains("\"prefix\""));
    }

    #[test]
    fn with_host_substitutes_only_host() {
        let resolved = sample().with_host("203.0.113.5");
        assert_eq!(resolved.host, "203.0.113.5");
        assert_eq!(resolved.port, 443);
        assert_eq!(resolved.password, "pw");
        // original untouched
        assert_eq!(sample().host, "proxy.example.com");
    }

    #[test]
    fn validate_rejects_empty_fields() {
        let mut config = sample();
        config.host.clear();
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfig(_))
        ));

        let mut config = sample();
        config.port = 0;
        assert!(config.validate().is_err());

        assert!(sample().validate().is_ok());
    }

    #[test]
    fn deserializes_access_config() {
        let config: TransportConfig = serde_json::from_str(
            r#"{"host":"1.2.3.4","port":8388,"method":"aes-256-gcm","password":"s"}"#,
        )
        .unwrap();
        assert_eq!(config.port, 8388);
        assert!(config.prefix.is_none());
    }
}
