//! Command runner trait.

use async_trait::async_trait;

use crate::command::{CommandOutput, CommandSpec};
use crate::error::RunnerResult;

/// Executes external commands on behalf of components.
///
/// Implementations must honour [`CommandSpec::check`]: when it is set, a
/// non-zero exit code is returned as [`crate::RunnerError::CommandFailed`]
/// instead of an `Ok` output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion.
    async fn run(&self, spec: &CommandSpec) -> RunnerResult<CommandOutput>;
}
