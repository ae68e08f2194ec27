use async_trait::async_trait;

use crate::error::SandboxError;

use super::{Invocation, ProcessOutcome};

/// Trait for different sandbox execution implementations
///
/// This trait abstracts launching one command of a job under resource limits,
/// from hardened containers to plain process groups without isolation. A
/// backend must forcibly terminate the whole sandbox when the invocation's
/// timeout expires and must not leave instances behind on any path.
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Runs the invocation's command to completion, timeout or failure
    ///
    /// `Err` is reserved for failures of the sandbox itself; a command that
    /// runs and exits non-zero is an `Ok` outcome.
    async fn run(&self, invocation: Invocation<'_>) -> Result<ProcessOutcome, SandboxError>;

    /// Removes sandbox instances that no live job owns, returning how many went away
    async fn reap_orphans(&self) -> Result<usize, SandboxError> {
        Ok(0)
    }
}
