use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::transport::Endpoint;

pub const DEFAULT_LOG_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_INBOUND_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for field '{field}': {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible configuration: {reason}")]
    IncompatibleConfig { reason: String },

    #[error("Failed to read config file {path}: {reason}")]
    Load { path: String, reason: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Addresses and knobs for one coordinator instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PDConfig {
    /// Outbound endpoint the prefill tier pulls requests from.
    pub prefill_addr: String,
    /// Outbound endpoint the decode tier pulls requests from.
    pub decode_addr: String,
    /// Inbound endpoint both tiers push responses to.
    pub connector_addr: String,
    pub model_name: String,
    /// Seconds between "Running requests" log lines; 0 disables the reporter.
    #[serde(default = "default_log_interval")]
    pub log_interval: u64,
    /// Upper bound on each wait for a tier response. `None` waits forever.
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    /// Frames buffered between the inbound socket readers and the router.
    #[serde(default = "default_inbound_capacity")]
    pub inbound_capacity: usize,
}

fn default_log_interval() -> u64 {
    DEFAULT_LOG_INTERVAL_SECS
}

fn default_inbound_capacity() -> usize {
    DEFAULT_INBOUND_CAPACITY
}

impl PDConfig {
    pub fn new(
        prefill_addr: impl Into<String>,
        decode_addr: impl Into<String>,
        connector_addr: impl Into<String>,
        model_name: impl Into<String>,
    ) -> Self {
        Self {
            prefill_addr: prefill_addr.into(),
            decode_addr: decode_addr.into(),
            connector_addr: connector_addr.into(),
            model_name: model_name.into(),
            log_interval: DEFAULT_LOG_INTERVAL_SECS,
            request_timeout_ms: None,
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
        }
    }

    pub fn from_json_file(path: &Path) -> ConfigResult<Self> {
        let load_err = |reason: String| ConfigError::Load {
            path: path.display().to_string(),
            reason,
        };
        let raw = std::fs::read_to_string(path).map_err(|e| load_err(e.to_string()))?;
        let config: PDConfig = serde_json::from_str(&raw).map_err(|e| load_err(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    pub fn log_interval(&self) -> Option<Duration> {
        (self.log_interval > 0).then(|| Duration::from_secs(self.log_interval))
    }

    /// Parsed endpoints in (prefill, decode, connector) order.
    pub fn endpoints(&self) -> ConfigResult<(Endpoint, Endpoint, Endpoint)> {
        let parse = |field: &str, value: &str| {
            value
                .parse::<Endpoint>()
                .map_err(|e| ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: value.to_string(),
                    reason: e.to_string(),
                })
        };
        Ok((
            parse("prefill_addr", &self.prefill_addr)?,
            parse("decode_addr", &self.decode_addr)?,
            parse("connector_addr", &self.connector_addr)?,
        ))
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let (prefill, decode, connector) = self.endpoints()?;
        if prefill == decode || prefill == connector || decode == connector {
            return Err(ConfigError::IncompatibleConfig {
                reason: "prefill, decode and connector addresses must be distinct".to_string(),
            });
        }
        if self.model_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "model_name".to_string(),
                value: self.model_name.clone(),
                reason: "must not be empty".to_string(),
            });
        }
        if self.inbound_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "inbound_capacity".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.request_timeout_ms == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "request_timeout_ms".to_string(),
                value: "0".to_string(),
                reason: "must be positive; omit it to wait indefinitely".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ipc_config() -> PDConfig {
        PDConfig::new(
            "ipc:///tmp/pd_prefill",
            "ipc:///tmp/pd_decode",
            "ipc:///tmp/pd_connector",
            "meta-llama/Llama-3.1-8B-Instruct",
        )
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = ipc_config();
        config.validate().unwrap();
        assert_eq!(config.log_interval(), Some(Duration::from_secs(10)));
        assert_eq!(config.request_timeout(), None);
    }

    #[test]
    fn test_zero_log_interval_disables_reporter() {
        let config = PDConfig {
            log_interval: 0,
            ..ipc_config()
        };
        assert!(config.log_interval().is_none());
    }

    #[test]
    fn test_rejects_shared_addresses() {
        let config = PDConfig {
            decode_addr: "ipc:///tmp/pd_prefill".into(),
            ..ipc_config()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::IncompatibleConfig { .. })
        ));
    }

    #[test]
    fn test_rejects_bad_endpoint() {
        let config = PDConfig {
            connector_addr: "inproc://connector".into(),
            ..ipc_config()
        };
        match config.validate() {
            Err(ConfigError::InvalidValue { field, .. }) => assert_eq!(field, "connector_addr"),
            other => panic!("expected invalid connector_addr, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_zero_timeout_and_capacity() {
        let config = PDConfig {
            request_timeout_ms: Some(0),
            ..ipc_config()
        };
        assert!(config.validate().is_err());
        let config = PDConfig {
            inbound_capacity: 0,
            ..ipc_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_json_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pd.json");
        std::fs::write(
            &path,
            r#"{
                "prefill_addr": "tcp://127.0.0.1:7001",
                "decode_addr": "tcp://127.0.0.1:7002",
                "connector_addr": "tcp://127.0.0.1:7003",
                "model_name": "facebook/opt-125m",
                "request_timeout_ms": 30000
            }"#,
        )
        .unwrap();
        let config = PDConfig::from_json_file(&path).unwrap();
        assert_eq!(config.log_interval, DEFAULT_LOG_INTERVAL_SECS);
        assert_eq!(config.inbound_capacity, DEFAULT_INBOUND_CAPACITY);
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(30)));
    }
}
