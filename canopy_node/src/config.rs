use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeConfig {
    pub identity: NodeConfigIdentity,
    pub project: NodeConfigProject,
    pub storage: NodeConfigStorage,
    #[serde(default)]
    pub sync: NodeConfigSync,
}

/// Either key may be given; an inline `secret_key` wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeConfigIdentity {
    pub secret_key: Option<String>,
    pub secret_key_file: Option<String>,
}

/// Keys are hex or base64.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeConfigProject {
    pub project_key: String,
    /// Only set on the device that created the project.
    pub project_secret_key: Option<String>,
    pub root_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeConfigStorage {
    /// Directory of the redb database holding the keys of remote cores.
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NodeConfigSync {
    pub have_debounce_ms: u64,
    pub sync_state_throttle_ms: u64,
    pub autostop_data_sync_after_ms: Option<u64>,
    pub role_chain_iteration_limit: usize,
}

impl Default for NodeConfigSync {
    fn default() -> Self {
        Self {
            have_debounce_ms: canopy_cores::DEFAULT_HAVE_DEBOUNCE.as_millis() as u64,
            sync_state_throttle_ms: canopy_sync::DEFAULT_STATE_THROTTLE.as_millis() as u64,
            autostop_data_sync_after_ms: None,
            role_chain_iteration_limit: canopy_auth::ROLE_CHAIN_ITERATION_LIMIT,
        }
    }
}

impl NodeConfig {
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read node config {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("invalid node config {}", path.display()))
    }

    /// Resolves relative paths against `config_dir`.
    pub fn resolve_path(&self, path: &Path, config_dir: Option<&Path>) -> PathBuf {
        match config_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }
}
