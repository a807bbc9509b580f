//! Public entry point tying validation, locking, backups and the apply
//! strategies to one repository root.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::coordinator::{ApplyCoordinator, ApplyReport};
use crate::error::{ConfigError, PatchError, RollbackError};
use crate::producers::{self, CodeMatch};
use crate::rollback::{RollbackEngine, RollbackReport};
use crate::runner::{CommandRunner, ProcessRunner, resolve_program};
use crate::store::StateLayout;
use crate::strategy::{ApplyStrategy, default_strategies};

/// Flat result of [`PatchEngine::apply`] and [`PatchEngine::rollback`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyOutcome {
    pub success: bool,
    pub message: String,
}

impl ApplyOutcome {
    fn ok(message: String) -> Self {
        Self {
            success: true,
            message,
        }
    }

    fn failed(message: String) -> Self {
        Self {
            success: false,
            message,
        }
    }
}

/// Applies and rolls back unified diffs inside one repository.
///
/// ```no_run
/// # async fn demo() -> anyhow::Result<()> {
/// let engine = vtpatch_core::PatchEngine::new("/path/to/repo")?;
/// let outcome = engine.apply("--- a/x.py\n+++ b/x.py\n@@ -1 +1 @@\n-a\n+b\n", "fix-1").await;
/// assert!(outcome.success, "{}", outcome.message);
/// # Ok(())
/// # }
/// ```
pub struct PatchEngine {
    repo_root: PathBuf,
    config: EngineConfig,
    layout: StateLayout,
    runner: Option<Arc<dyn CommandRunner>>,
    program: String,
    strategies: Vec<Box<dyn ApplyStrategy>>,
}

impl PatchEngine {
    /// Engine for `repo_root`, configured from its `vtpatch.toml` if any.
    pub fn new(repo_root: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config = EngineConfig::load(repo_root.as_ref())?;
        Self::with_config(repo_root, config)
    }

    pub fn with_config(repo_root: impl AsRef<Path>, config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let given = repo_root.as_ref();
        let repo_root = given
            .canonicalize()
            .map_err(|source| ConfigError::RepoRoot {
                path: given.to_path_buf(),
                source,
            })?;

        let mut program = config.external.program.clone();
        let runner: Option<Arc<dyn CommandRunner>> = if config.external.enabled {
            resolve_program(&program).map(|path| {
                program = path.to_string_lossy().into_owned();
                Arc::new(ProcessRunner::new()) as Arc<dyn CommandRunner>
            })
        } else {
            debug!("External patch tool disabled by configuration");
            None
        };

        let layout = StateLayout::new(&repo_root, &config.state_dir);
        let strategies = default_strategies(runner.is_some());
        info!(
            repo = %repo_root.display(),
            external_tool = runner.is_some(),
            "Patch engine ready"
        );

        Ok(Self {
            repo_root,
            config,
            layout,
            runner,
            program,
            strategies,
        })
    }

    /// Route external tool calls through `runner` instead of child processes.
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = Some(runner);
        self.strategies = default_strategies(true);
        self
    }

    /// Use only the in-process strategies.
    pub fn without_external_tool(mut self) -> Self {
        self.runner = None;
        self.strategies = default_strategies(false);
        self
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state_dir(&self) -> &Path {
        self.layout.dir()
    }

    pub fn has_external_tool(&self) -> bool {
        self.runner.is_some()
    }

    pub async fn try_apply(&self, diff_text: &str, patch_id: &str) -> Result<ApplyReport, PatchError> {
        let mut coordinator = ApplyCoordinator::new(
            &self.repo_root,
            &self.config,
            &self.layout,
            &self.strategies,
            self.runner.as_deref(),
            &self.program,
        );
        let result = coordinator.run(diff_text, patch_id).await;
        debug!(patch_id, phase = %coordinator.phase(), "Apply finished");
        result
    }

    /// Apply `diff_text` under `patch_id`. Never panics; every failure is
    /// reported in the outcome.
    pub async fn apply(&self, diff_text: &str, patch_id: &str) -> ApplyOutcome {
        match AssertUnwindSafe(self.try_apply(diff_text, patch_id))
            .catch_unwind()
            .await
        {
            Ok(Ok(report)) => ApplyOutcome::ok(report.message()),
            Ok(Err(err @ PatchError::AllStrategiesFailed(_))) => ApplyOutcome::failed(format!(
                "{err}. Roll back '{patch_id}' to undo any partial changes"
            )),
            Ok(Err(err)) => ApplyOutcome::failed(err.to_string()),
            Err(panic) => ApplyOutcome::failed(internal_error(panic)),
        }
    }

    pub async fn try_rollback(&self, patch_id: &str) -> Result<RollbackReport, RollbackError> {
        RollbackEngine {
            repo_root: &self.repo_root,
            config: &self.config,
            layout: &self.layout,
            runner: self.runner.as_deref(),
            program: &self.program,
        }
        .run(patch_id)
        .await
    }

    pub async fn rollback(&self, patch_id: &str) -> ApplyOutcome {
        match AssertUnwindSafe(self.try_rollback(patch_id))
            .catch_unwind()
            .await
        {
            Ok(Ok(report)) => ApplyOutcome::ok(report.message()),
            Ok(Err(err)) => ApplyOutcome::failed(err.to_string()),
            Err(panic) => ApplyOutcome::failed(internal_error(panic)),
        }
    }

    pub fn search_code(&self, pattern: &str, limit: usize) -> Result<Vec<CodeMatch>> {
        producers::search_code(&self.repo_root, pattern, limit)
    }

    pub fn module_move_diff(&self, from: &str, to: &str) -> Result<String> {
        producers::module_move_diff(&self.repo_root, from, to)
    }

    pub fn import_update_diff(&self, old: &str, new: &str) -> Result<String> {
        producers::import_update_diff(&self.repo_root, old, new)
    }
}

fn internal_error(panic: Box<dyn Any + Send>) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("Internal error: {detail}")
}
