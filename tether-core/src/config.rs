use crate::{Result, TetherError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Toolchain settings, usually read from `tether.toml`.
///
/// Everything a subprocess needs to know about the SDK (its root, the
/// interpreter to use, extra variables) lives here and is handed to the
/// launcher explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    pub sdk_root: Option<PathBuf>,
    pub cli_name: String,
    pub user_agent: String,
    pub default_timeout_secs: Option<u64>,
    pub env: BTreeMap<String, String>,
    pub install: InstallConfig,
    pub update: UpdateConfig,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
    pub archive_url: Option<String>,
    /// Install script relative to the SDK root; platform default when unset
    pub script: Option<PathBuf>,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    pub args: Vec<String>,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            sdk_root: None,
            cli_name: "gcloud".to_string(),
            user_agent: concat!("tether/", env!("CARGO_PKG_VERSION")).to_string(),
            default_timeout_secs: None,
            env: BTreeMap::new(),
            install: InstallConfig::default(),
            update: UpdateConfig::default(),
        }
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            args: vec![
                "components".to_string(),
                "update".to_string(),
                "--quiet".to_string(),
            ],
        }
    }
}

impl ToolchainConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: ToolchainConfig = toml::from_str(content)
            .map_err(|e| TetherError::InvalidConfiguration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cli_name.trim().is_empty() {
            return Err(TetherError::InvalidConfiguration(
                "cli_name must not be empty".to_string(),
            ));
        }
        if self.user_agent.trim().is_empty() {
            return Err(TetherError::InvalidConfiguration(
                "user_agent must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_secs.map(Duration::from_secs)
    }

    /// SDK root, or `InvalidConfiguration` when none was configured.
    pub fn require_sdk_root(&self) -> Result<&Path> {
        self.sdk_root.as_deref().ok_or_else(|| {
            TetherError::InvalidConfiguration("sdk_root is not configured".to_string())
        })
    }

    /// Path of the CLI executable inside the SDK.
    pub fn cli_path(&self) -> Result<PathBuf> {
        let name = if cfg!(windows) {
            format!("{}.cmd", self.cli_name)
        } else {
            self.cli_name.clone()
        };
        Ok(self.require_sdk_root()?.join("bin").join(name))
    }

    pub fn install_script(&self) -> PathBuf {
        match &self.install.script {
            Some(script) => script.clone(),
            None if cfg!(windows) => PathBuf::from("install.bat"),
            None => PathBuf::from("install.sh"),
        }
    }
}
