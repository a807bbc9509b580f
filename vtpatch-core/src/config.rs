//! Engine configuration loaded from `vtpatch.toml` at the repository root.

use std::path::{Component, Path};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;

pub const CONFIG_FILE_NAME: &str = "vtpatch.toml";
pub const DEFAULT_STATE_DIR: &str = ".vtpatch";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Hidden directory at the repository root holding the lock file,
    /// backups and patch logs.
    pub state_dir: String,
    pub external: ExternalToolConfig,
    pub backup: BackupConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: DEFAULT_STATE_DIR.to_string(),
            external: ExternalToolConfig::default(),
            backup: BackupConfig::default(),
        }
    }
}

/// Settings for the external `patch` utility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExternalToolConfig {
    pub enabled: bool,
    pub program: String,
    pub dry_run_timeout_secs: u64,
    pub apply_timeout_secs: u64,
}

impl Default for ExternalToolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            program: "patch".to_string(),
            dry_run_timeout_secs: 10,
            apply_timeout_secs: 60,
        }
    }
}

impl ExternalToolConfig {
    pub fn dry_run_timeout(&self) -> Duration {
        Duration::from_secs(self.dry_run_timeout_secs)
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_secs(self.apply_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackupConfig {
    /// Abort the apply when an existing file cannot be backed up.
    pub fail_on_error: bool,
}

impl EngineConfig {
    /// Load `vtpatch.toml` from `repo_root`, or defaults when it is absent.
    pub fn load(repo_root: &Path) -> Result<Self, ConfigError> {
        let path = repo_root.join(CONFIG_FILE_NAME);
        if !path.is_file() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config: Self =
            toml::from_str(&raw).map_err(|source| ConfigError::Parse { path, source })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut components = Path::new(&self.state_dir).components();
        let single_normal = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !single_normal {
            return Err(ConfigError::Invalid(format!(
                "state_dir must be a single relative directory name, got {:?}",
                self.state_dir
            )));
        }

        if self.external.program.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "external.program cannot be empty".to_string(),
            ));
        }

        if self.external.dry_run_timeout_secs == 0 || self.external.apply_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "external tool timeouts must be at least one second".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::load(dir.path()).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.external.dry_run_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn partial_file_merges_with_defaults() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "state_dir = \".patches\"\n[backup]\nfail_on_error = true\n",
        )
        .unwrap();

        let config = EngineConfig::load(dir.path()).unwrap();
        assert_eq!(config.state_dir, ".patches");
        assert!(config.backup.fail_on_error);
        assert_eq!(config.external.program, "patch");
    }

    #[test]
    fn rejects_unknown_keys() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE_NAME), "colour = \"blue\"\n").unwrap();
        assert!(matches!(
            EngineConfig::load(dir.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn rejects_nested_state_dir() {
        let config = EngineConfig {
            state_dir: "../outside".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
