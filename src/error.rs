use thiserror::Error;

/// Failure while materializing a job's archive into its staging directory
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive is corrupt: {0}")]
    Corrupt(String),

    #[error("archive entry `{entry}` is unsafe: {reason}")]
    Unsafe { entry: String, reason: &'static str },
}

/// Failure of the sandbox machinery itself, as opposed to the code running inside it
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox runtime unavailable: {0}")]
    Unavailable(String),

    #[error("sandbox failed to start: {0}")]
    Launch(String),

    #[error("sandbox supervision failed: {0}")]
    Supervision(String),
}

/// Job-level outcomes other than success
///
/// None of these are ever returned to the caller of `Engine::execute` as an error;
/// they are folded into the `ExecutionResult` of the job.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("unsupported runtime `{0}`")]
    UnsupportedRuntime(String),

    #[error("build failed with exit code {0}")]
    BuildFailed(i32),

    #[error("execution timed out after {0} seconds")]
    Timeout(u64),

    #[error(transparent)]
    Infrastructure(#[from] SandboxError),

    #[error("process exited with code {0}")]
    RuntimeExit(i32),
}
