//! Client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default MPD port.
pub const DEFAULT_PORT: u16 = 6600;

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
  /// Host used by `connect_from_config`.
  #[serde(default = "default_host")]
  pub host: String,

  #[serde(default = "default_port")]
  pub port: u16,

  /// Upper bound for the TCP connect, in seconds.
  #[serde(default = "default_connect_timeout_secs")]
  pub connect_timeout_secs: u64,

  /// Longest reply line accepted from the server, in bytes.
  #[serde(default = "default_max_line_length")]
  pub max_line_length: usize,
}

fn default_host() -> String {
  "localhost".to_string()
}

fn default_port() -> u16 {
  DEFAULT_PORT
}

fn default_connect_timeout_secs() -> u64 {
  10
}

fn default_max_line_length() -> usize {
  64 * 1024
}

impl Default for ClientConfig {
  fn default() -> Self {
    Self {
      host: default_host(),
      port: default_port(),
      connect_timeout_secs: default_connect_timeout_secs(),
      max_line_length: default_max_line_length(),
    }
  }
}

impl ClientConfig {
  /// Defaults overridden by `MPD_HOST` and `MPD_PORT`.
  pub fn from_env() -> Self {
    let host = std::env::var("MPD_HOST").ok();
    let port = std::env::var("MPD_PORT").ok();
    Self::from_vars(host.as_deref(), port.as_deref())
  }

  /// `host` follows the `MPD_HOST` format: `[password@]host[:port]`.
  pub(crate) fn from_vars(host: Option<&str>, port: Option<&str>) -> Self {
    let mut config = Self::default();

    if let Some(port) = port {
      match port.trim().parse() {
        Ok(port) => config.port = port,
        Err(_) => log::warn!("Ignoring invalid MPD_PORT: {}", port),
      }
    }

    if let Some(value) = host.map(str::trim).filter(|value| !value.is_empty()) {
      let value = match value.rsplit_once('@') {
        Some((_, host)) => {
          log::warn!("MPD_HOST contains a password; authentication is not supported");
          host
        }
        None => value,
      };
      // A bare IPv6 address has colons of its own.
      let (host, port) = match value.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') || host.ends_with(']') => (host, Some(port)),
        _ => (value, None),
      };
      config.host = host.trim_start_matches('[').trim_end_matches(']').to_string();
      if let Some(port) = port {
        match port.parse() {
          Ok(port) => config.port = port,
          Err(_) => log::warn!("Ignoring invalid port in MPD_HOST: {}", port),
        }
      }
    }

    config
  }

  pub fn connect_timeout(&self) -> Duration {
    Duration::from_secs(self.connect_timeout_secs)
  }

  /// Validate configuration values.
  pub fn validate(&self) -> Result<(), String> {
    if self.host.trim().is_empty() {
      return Err("Host cannot be empty".to_string());
    }
    if self.port == 0 {
      return Err("Port cannot be 0".to_string());
    }
    if self.connect_timeout_secs < 1 || self.connect_timeout_secs > 300 {
      return Err("Connect timeout must be between 1 and 300 seconds".to_string());
    }
    if self.max_line_length < 1024 {
      return Err("Maximum line length must be at least 1024 bytes".to_string());
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn test_defaults() {
    let config = ClientConfig::default();
    assert_eq!(config.host, "localhost");
    assert_eq!(config.port, 6600);
    assert_eq!(config.connect_timeout(), Duration::from_secs(10));
    assert!(config.validate().is_ok());
  }

  #[test]
  fn test_deserialize_partial() {
    let config: ClientConfig =
      serde_json::from_str(r#"{"host": "music.local", "connectTimeoutSecs": 3}"#).unwrap();
    assert_eq!(config.host, "music.local");
    assert_eq!(config.port, 6600);
    assert_eq!(config.connect_timeout_secs, 3);
    assert_eq!(config.max_line_length, 64 * 1024);
  }

  #[test]
  fn test_serialize_camel_case() {
    let json = serde_json::to_value(ClientConfig::default()).unwrap();
    assert_eq!(json["maxLineLength"], 65536);
    assert_eq!(json["connectTimeoutSecs"], 10);
  }

  #[test]
  fn test_validate() {
    let mut config = ClientConfig {
      host: " ".into(),
      ..Default::default()
    };
    assert!(config.validate().is_err());

    config.host = "localhost".into();
    config.connect_timeout_secs = 0;
    assert!(config.validate().is_err());

    config.connect_timeout_secs = 5;
    config.max_line_length = 10;
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_from_vars() {
    let config = ClientConfig::from_vars(Some("music.local"), Some("6601"));
    assert_eq!((config.host.as_str(), config.port), ("music.local", 6601));

    let config = ClientConfig::from_vars(Some("secret@music.local:6700"), Some("6601"));
    assert_eq!((config.host.as_str(), config.port), ("music.local", 6700));

    let config = ClientConfig::from_vars(Some("::1"), None);
    assert_eq!((config.host.as_str(), config.port), ("::1", 6600));

    let config = ClientConfig::from_vars(Some("[::1]:6602"), None);
    assert_eq!((config.host.as_str(), config.port), ("::1", 6602));

    let config = ClientConfig::from_vars(None, Some("not a port"));
    assert_eq!(config, ClientConfig::default());
  }
}
