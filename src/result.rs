use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::create_timestamp;
use crate::error::{ArchiveError, JobError};
use crate::job::JobId;
use crate::sandbox::CapturedOutput;

/// The sandbox could not be started or supervised
pub const INFRA_ERROR_EXIT_CODE: i32 = -1;
/// The job ran out of its wall-clock budget
pub const TIMEOUT_EXIT_CODE: i32 = -2;
/// The build phase exited non-zero; the run phase never started
pub const BUILD_FAILED_EXIT_CODE: i32 = -3;
/// The job was rejected before anything ran
pub const REJECTED_EXIT_CODE: i32 = -4;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    RuntimeExit,
    BuildFailed,
    Timeout,
    InfrastructureError,
    ArchiveCorrupt,
    ArchiveUnsafe,
    UnsupportedRuntime,
}

impl From<&JobError> for OutcomeKind {
    fn from(error: &JobError) -> Self {
        match error {
            JobError::Archive(ArchiveError::Corrupt(_)) => OutcomeKind::ArchiveCorrupt,
            JobError::Archive(ArchiveError::Unsafe { .. }) => OutcomeKind::ArchiveUnsafe,
            JobError::UnsupportedRuntime(_) => OutcomeKind::UnsupportedRuntime,
            JobError::BuildFailed(_) => OutcomeKind::BuildFailed,
            JobError::Timeout(_) => OutcomeKind::Timeout,
            JobError::Infrastructure(_) => OutcomeKind::InfrastructureError,
            JobError::RuntimeExit(_) => OutcomeKind::RuntimeExit,
        }
    }
}

impl JobError {
    /// Exit code reported to the caller: the real one for a process that ran, a sentinel otherwise
    pub fn exit_code(&self) -> i32 {
        match self {
            JobError::Archive(_) | JobError::UnsupportedRuntime(_) => REJECTED_EXIT_CODE,
            JobError::BuildFailed(_) => BUILD_FAILED_EXIT_CODE,
            JobError::Timeout(_) => TIMEOUT_EXIT_CODE,
            JobError::Infrastructure(_) => INFRA_ERROR_EXIT_CODE,
            JobError::RuntimeExit(code) => *code,
        }
    }
}

/// Final, immutable outcome of one job
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub job_id: JobId,
    pub success: bool,
    pub exit_code: i32,
    pub kind: OutcomeKind,
    pub output: String,
    pub truncated: bool,
    pub duration_ms: u64,
    pub started_at: String,
    pub finished_at: String,
}

/// Produces the `ExecutionResult` of a job, exactly once
#[derive(Debug)]
pub struct ResultCollector {
    job_id: JobId,
    started: Instant,
    started_at: String,
}

impl ResultCollector {
    pub fn start(job_id: JobId) -> Self {
        Self {
            job_id,
            started: Instant::now(),
            started_at: create_timestamp(),
        }
    }

    /// The process exited inside its budget with code 0
    pub fn success(self, output: CapturedOutput) -> ExecutionResult {
        let text = output.text();
        self.finish(true, 0, OutcomeKind::Success, text, output.truncated)
    }

    /// Any other terminal state
    ///
    /// The captured output is passed through untouched; when there is none the
    /// diagnostic message of `error` takes its place.
    pub fn failure(self, error: &JobError, output: Option<CapturedOutput>) -> ExecutionResult {
        let (text, truncated) = match output {
            Some(output) if !output.is_empty() => (output.text(), output.truncated),
            _ => (error.to_string(), false),
        };
        self.finish(false, error.exit_code(), error.into(), text, truncated)
    }

    fn finish(
        self,
        success: bool,
        exit_code: i32,
        kind: OutcomeKind,
        output: String,
        truncated: bool,
    ) -> ExecutionResult {
        ExecutionResult {
            job_id: self.job_id,
            success,
            exit_code,
            kind,
            output,
            truncated,
            duration_ms: self.started.elapsed().as_millis() as u64,
            started_at: self.started_at,
            finished_at: create_timestamp(),
        }
    }
}
