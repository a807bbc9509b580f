//! Validated, lock-guarded application of unified diffs with rollback
//!
//! This crate provides:
//! - Path validation that rejects traversal and absolute paths before any write
//! - Patch level detection (`-p0` / `-p1`)
//! - Per-patch backups and a log of every applied diff
//! - A repository-scoped advisory lock
//! - Tiered application: external `patch`, per-file shards, block replacement
//! - Rollback from backups, or by reversing the logged diff

mod atomic;
pub mod backup;
pub mod config;
pub mod coordinator;
pub mod diff;
pub mod engine;
pub mod error;
pub mod lock;
pub mod producers;
pub mod rollback;
pub mod runner;
pub mod store;
pub mod strategy;
pub mod validate;

pub use backup::{BackupManager, BackupManifest, RestoreSummary};
pub use config::{BackupConfig, EngineConfig, ExternalToolConfig};
pub use coordinator::{ApplyPhase, ApplyReport};
pub use diff::{ParsedDiff, PatchLevel, detect_level, reverse_diff};
pub use engine::{ApplyOutcome, PatchEngine};
pub use error::{ConfigError, LockError, PatchError, RollbackError, SecurityError, TierFailure};
pub use lock::LockGuard;
pub use producers::{CodeMatch, import_update_diff, module_move_diff, search_code};
pub use rollback::{RollbackMethod, RollbackReport};
pub use runner::{CommandOutput, CommandRequest, CommandRunner, ProcessRunner};
pub use store::StateLayout;
pub use strategy::{ApplyStrategy, StrategyKind};
pub use validate::{DiffValidator, validate_diff, validate_patch_id};
