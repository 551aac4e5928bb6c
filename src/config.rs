//! Runtime configuration, read from the environment

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::GatewayConfig;
use crate::reconcile::ReconcileOptions;
use crate::store::DEFAULT_LOCK_TIMEOUT;

pub const TREE_FILE_NAME: &str = "task_tree.json";
pub const MIRROR_FILE_NAME: &str = "tasks.db";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for {name}: '{value}'")]
    InvalidValue { name: &'static str, value: String },
}

/// Everything needed to construct a [`crate::TaskManager`]
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub gateway: GatewayConfig,
    pub reconcile: ReconcileOptions,
    pub lock_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            gateway: GatewayConfig::default(),
            reconcile: ReconcileOptions::default(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

impl Config {
    /// Config rooted at `data_dir` with every other setting defaulted
    pub fn with_data_dir(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    pub fn tree_path(&self) -> PathBuf {
        self.data_dir.join(TREE_FILE_NAME)
    }

    pub fn mirror_path(&self) -> PathBuf {
        self.data_dir.join(MIRROR_FILE_NAME)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a config from any variable source; unset or empty variables
    /// keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(model) = get("MODEL_NAME") {
            config.gateway.model = model;
        }
        if let Some(key) = get("MODEL_API_KEY") {
            config.gateway.api_key = key;
        }
        if let Some(url) = get("MODEL_BASE_URL") {
            config.gateway.base_url = url;
        }
        if let Some(dir) = get("CORTEX_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(raw) = get("CORTEX_LLM_TIMEOUT_SECS") {
            let secs = raw.trim().parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                name: "CORTEX_LLM_TIMEOUT_SECS",
                value: raw.clone(),
            })?;
            config.gateway.timeout = Duration::from_secs(secs);
        }
        if let Some(raw) = get("CORTEX_ALLOW_REOPEN") {
            config.reconcile.allow_reopen = parse_flag("CORTEX_ALLOW_REOPEN", &raw)?;
        }
        if let Some(raw) = get("CORTEX_AUTO_ROLLUP") {
            config.reconcile.auto_rollup = parse_flag("CORTEX_AUTO_ROLLUP", &raw)?;
        }
        Ok(config)
    }
}

fn parse_flag(name: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name,
            value: raw.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("MODEL_NAME", "deepseek-chat"),
            ("MODEL_API_KEY", "sk-test"),
            ("CORTEX_DATA_DIR", "/tmp/cortex"),
            ("CORTEX_LLM_TIMEOUT_SECS", "15"),
            ("CORTEX_ALLOW_REOPEN", "yes"),
            ("MODEL_BASE_URL", ""),
        ]))
        .unwrap();

        assert_eq!(config.gateway.model, "deepseek-chat");
        assert_eq!(config.gateway.api_key, "sk-test");
        assert_eq!(config.gateway.base_url, GatewayConfig::default().base_url);
        assert_eq!(config.gateway.timeout, Duration::from_secs(15));
        assert_eq!(config.tree_path(), PathBuf::from("/tmp/cortex/task_tree.json"));
        assert!(config.reconcile.allow_reopen);
        assert!(config.reconcile.auto_rollup);
    }

    #[test]
    fn test_bad_timeout_is_rejected() {
        let err = Config::from_lookup(lookup(&[("CORTEX_LLM_TIMEOUT_SECS", "soon")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                name: "CORTEX_LLM_TIMEOUT_SECS",
                value: "soon".to_string()
            }
        );
    }
}
