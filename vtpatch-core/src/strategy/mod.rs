//! Apply strategies tried in order by the coordinator.
//!
//! Each strategy either applies the whole diff or reports why it could not;
//! the coordinator falls through to the next one on failure.

mod block;
mod external;
mod shard;

use std::fmt;
use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::config::ExternalToolConfig;
use crate::diff::ParsedDiff;
use crate::runner::CommandRunner;

pub use block::SimpleBlockReplaceStrategy;
pub use external::ExternalPatchStrategy;
pub(crate) use external::PatchTool;
pub use shard::PerFileShardStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    ExternalPatch,
    PerFileShard,
    SimpleBlockReplace,
}

impl StrategyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExternalPatch => "external patch",
            Self::PerFileShard => "per-file shard",
            Self::SimpleBlockReplace => "block replace",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a strategy may use besides the diff itself.
pub struct ApplyContext<'a> {
    pub repo_root: &'a Path,
    /// `None` when no external `patch` tool is available.
    pub runner: Option<&'a dyn CommandRunner>,
    pub program: &'a str,
    pub tool: &'a ExternalToolConfig,
}

impl<'a> ApplyContext<'a> {
    pub(crate) fn patch_tool(&self) -> Option<PatchTool<'a>> {
        self.runner.map(|runner| PatchTool {
            runner,
            program: self.program,
            cwd: self.repo_root,
            config: self.tool,
        })
    }
}

#[async_trait]
pub trait ApplyStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    async fn attempt(&self, ctx: &ApplyContext<'_>, diff: &ParsedDiff) -> Result<()>;
}

/// The tier list, in order. The external strategy only registers when an
/// external tool is available.
pub fn default_strategies(external_available: bool) -> Vec<Box<dyn ApplyStrategy>> {
    let mut strategies: Vec<Box<dyn ApplyStrategy>> = Vec::new();
    if external_available {
        strategies.push(Box::new(ExternalPatchStrategy));
    }
    strategies.push(Box::new(PerFileShardStrategy));
    strategies.push(Box::new(SimpleBlockReplaceStrategy));
    strategies
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted stand-in for the `patch` binary.

    use std::sync::Mutex;

    use anyhow::Result;
    use async_trait::async_trait;

    use crate::runner::{CommandOutput, CommandRequest, CommandRunner};

    type Responder = Box<dyn Fn(&[String], Option<&str>) -> Result<CommandOutput> + Send + Sync>;

    pub(crate) struct ScriptedRunner {
        responder: Responder,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedRunner {
        pub(crate) fn new(
            responder: impl Fn(&[String], Option<&str>) -> Result<CommandOutput> + Send + Sync + 'static,
        ) -> Self {
            Self {
                responder: Box::new(responder),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn exit(code: i32) -> CommandOutput {
            CommandOutput {
                exit_code: Some(code),
                stdout: String::new(),
                stderr: if code == 0 {
                    String::new()
                } else {
                    "scripted failure".to_string()
                },
            }
        }

        pub(crate) fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, request: CommandRequest<'_>) -> Result<CommandOutput> {
            self.calls.lock().unwrap().push(request.args.clone());
            (self.responder)(&request.args, request.stdin)
        }
    }
}
