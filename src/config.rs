//! Worker configuration.
//!
//! The worker process loads its configuration from a JSON file. Each sandbox
//! process receives a copy through the [`CONFIGURATION_ENV_KEY`] environment
//! variable, with the role switched to [`Component::Sandbox`] and the working
//! directory pointed at the sandbox's own directory.

use crate::error::{Result, WorkerError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable carrying the serialized configuration.
pub const CONFIGURATION_ENV_KEY: &str = "WORKERCONF";

const DEFAULT_WORKER_VERSION: &str = "2.0.0";
const DEFAULT_SANDBOX_EXECUTABLE: &str = "sandbox";
const DEFAULT_POLLING_FREQUENCY_SECS: u64 = 10;

/// Which process role the configuration belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    #[default]
    Worker,
    Sandbox,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Worker => "worker",
            Self::Sandbox => "sandbox",
        }
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    #[serde(rename = "jrds_cert_path")]
    pub certificate_path: String,
    #[serde(rename = "jrds_key_path")]
    pub key_path: String,
    #[serde(rename = "jrds_base_uri")]
    pub base_uri: String,

    pub account_id: String,
    pub machine_id: String,
    pub hybrid_worker_group_name: String,
    pub worker_version: String,
    #[serde(rename = "working_directory_path")]
    pub working_directory: PathBuf,
    #[serde(rename = "sandbox_executable_path")]
    pub sandbox_executable: PathBuf,

    /// Poll interval in seconds.
    #[serde(rename = "jrds_polling_frequency")]
    pub polling_frequency: u64,
    pub debug_traces: bool,

    pub component: Component,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            certificate_path: String::new(),
            key_path: String::new(),
            base_uri: String::new(),
            account_id: String::new(),
            machine_id: String::new(),
            hybrid_worker_group_name: String::new(),
            worker_version: DEFAULT_WORKER_VERSION.to_string(),
            working_directory: PathBuf::new(),
            sandbox_executable: PathBuf::from(DEFAULT_SANDBOX_EXECUTABLE),
            polling_frequency: DEFAULT_POLLING_FREQUENCY_SECS,
            debug_traces: false,
            component: Component::Worker,
        }
    }
}

impl Configuration {
    /// Load configuration from a JSON file; missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| WorkerError::io("read configuration", path, e))?;
        Self::from_json(&content)
    }

    /// Read the configuration handed down by the parent process.
    pub fn from_env() -> Result<Self> {
        let value = std::env::var(CONFIGURATION_ENV_KEY).map_err(|_| WorkerError::Config {
            reason: format!("{} is not set", CONFIGURATION_ENV_KEY),
        })?;
        Self::from_json(&value)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| WorkerError::Config {
            reason: format!("invalid configuration: {}", e),
        })
    }

    /// Serialized form placed in [`CONFIGURATION_ENV_KEY`].
    pub fn to_env_value(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| WorkerError::Config {
            reason: format!("unable to serialize configuration: {}", e),
        })
    }

    /// Copy of this configuration for a sandbox process rooted at `working_directory`.
    pub fn for_sandbox(&self, working_directory: &Path) -> Self {
        Self {
            working_directory: working_directory.to_path_buf(),
            component: Component::Sandbox,
            ..self.clone()
        }
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_frequency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_keys_take_defaults() {
        let config = Configuration::from_json(r#"{"account_id": "acc-1"}"#).unwrap();
        assert_eq!(config.account_id, "acc-1");
        assert_eq!(config.worker_version, "2.0.0");
        assert_eq!(config.sandbox_executable, PathBuf::from("sandbox"));
        assert_eq!(config.polling_interval(), Duration::from_secs(10));
        assert_eq!(config.component, Component::Worker);
    }

    #[test]
    fn test_wire_keys() {
        let config = Configuration::from_json(
            r#"{
                "jrds_base_uri": "https://jrds.example",
                "working_directory_path": "/var/lib/worker",
                "jrds_polling_frequency": 3,
                "component": "sandbox"
            }"#,
        )
        .unwrap();
        assert_eq!(config.base_uri, "https://jrds.example");
        assert_eq!(config.working_directory, PathBuf::from("/var/lib/worker"));
        assert_eq!(config.polling_frequency, 3);
        assert_eq!(config.component, Component::Sandbox);
    }

    #[test]
    fn test_for_sandbox_switches_role_and_directory() {
        let config = Configuration {
            account_id: "acc".to_string(),
            working_directory: PathBuf::from("/base"),
            ..Default::default()
        };
        let sandbox = config.for_sandbox(Path::new("/base/sbx-1"));
        assert_eq!(sandbox.component, Component::Sandbox);
        assert_eq!(sandbox.working_directory, PathBuf::from("/base/sbx-1"));
        assert_eq!(sandbox.account_id, "acc");

        let decoded = Configuration::from_json(&sandbox.to_env_value().unwrap()).unwrap();
        assert_eq!(decoded, sandbox);
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let err = Configuration::from_json("{not json").unwrap_err();
        assert!(matches!(err, WorkerError::Config { .. }));
    }
}
