//! Declarative build recipe for an environment.

use std::collections::BTreeMap;

use cu_state::{ObjectId, VcsStore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::error::{CuError, Result};

/// Repository-relative location of the defaults file.
pub const CONFIG_PATH: &str = ".container-use/environment.json";

pub const DEFAULT_BASE_IMAGE: &str = "ubuntu:24.04";
pub const DEFAULT_WORKDIR: &str = "/workdir";

/// How to build an environment's container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentConfig {
    #[serde(default = "default_base_image")]
    pub base_image: String,

    #[serde(default = "default_workdir")]
    pub workdir: String,

    /// Run once at creation, before any user command.
    #[serde(default)]
    pub setup_commands: Vec<String>,

    /// Run after `setup_commands`; dependency installation.
    #[serde(default)]
    pub install_commands: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_base_image() -> String {
    DEFAULT_BASE_IMAGE.to_string()
}

fn default_workdir() -> String {
    DEFAULT_WORKDIR.to_string()
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            base_image: default_base_image(),
            workdir: default_workdir(),
            setup_commands: Vec::new(),
            install_commands: Vec::new(),
            env: BTreeMap::new(),
        }
    }
}

impl EnvironmentConfig {
    /// Parse and validate a defaults file.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let config: Self =
            serde_json::from_slice(bytes).map_err(|e| CuError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read the repository defaults from `tree`, or fall back to
    /// [`EnvironmentConfig::default`] when the file is absent.
    pub async fn load(store: &dyn VcsStore, tree: &ObjectId) -> Result<Self> {
        match store.read_file(tree, CONFIG_PATH).await? {
            Some(bytes) => {
                debug!(tree = %tree.short(), "loaded {CONFIG_PATH}");
                Self::from_json(&bytes)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_image.trim().is_empty() {
            return Err(CuError::InvalidConfig("base_image must not be empty".into()));
        }
        if !self.workdir.starts_with('/') || self.workdir.split('/').any(|c| c == "..") {
            return Err(CuError::InvalidConfig(format!(
                "workdir must be an absolute path without `..`, got {:?}",
                self.workdir
            )));
        }
        for key in self.env.keys() {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(CuError::InvalidConfig(format!(
                    "invalid environment variable name {key:?}"
                )));
            }
        }
        Ok(())
    }

    /// Setup then install commands, in execution order.
    pub fn build_commands(&self) -> impl Iterator<Item = &str> {
        self.setup_commands
            .iter()
            .chain(self.install_commands.iter())
            .map(String::as_str)
    }

    /// SHA-256 of the canonical JSON encoding. Identical configs always
    /// produce identical digests.
    pub fn digest(&self) -> Result<String> {
        let canonical = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&canonical)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_keys_take_defaults() {
        let config = EnvironmentConfig::from_json(br#"{"setup_commands": ["echo hi > f"]}"#).unwrap();
        assert_eq!(config.base_image, DEFAULT_BASE_IMAGE);
        assert_eq!(config.workdir, DEFAULT_WORKDIR);
        assert_eq!(config.setup_commands, vec!["echo hi > f"]);
        assert!(config.env.is_empty());
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let err = EnvironmentConfig::from_json(br#"{"base_imag": "alpine"}"#).unwrap_err();
        assert!(matches!(err, CuError::InvalidConfig(_)));
    }

    #[test]
    fn test_relative_workdir_is_rejected() {
        let err = EnvironmentConfig::from_json(br#"{"workdir": "src"}"#).unwrap_err();
        assert!(err.to_string().contains("absolute"));
    }

    #[test]
    fn test_build_commands_run_setup_before_install() {
        let config = EnvironmentConfig {
            setup_commands: vec!["a".into(), "b".into()],
            install_commands: vec!["c".into()],
            ..Default::default()
        };
        assert_eq!(config.build_commands().collect::<Vec<_>>(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_digest_is_stable_and_content_sensitive() {
        let mut config = EnvironmentConfig::default();
        config.env.insert("B".into(), "2".into());
        config.env.insert("A".into(), "1".into());
        let first = config.digest().unwrap();
        assert_eq!(first, config.clone().digest().unwrap());
        assert_eq!(first.len(), 64);

        config.base_image = "alpine:3".into();
        assert_ne!(first, config.digest().unwrap());
    }
}
