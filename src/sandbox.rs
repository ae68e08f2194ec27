mod docker_runner;
mod output;
mod process_runner;
mod runner;

// Re-export the trait and common types
pub use docker_runner::{ContainerRegistry, DockerRunner, build_docker_args};
pub use output::{BoundedOutput, CapturedOutput, OutputCollector};
pub use process_runner::ProcessRunner;
pub use runner::SandboxRunner;

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::config::{Backend, EngineConfig};
use crate::job::{JobId, ResourceLimits};

/// Where the staging directory appears inside a container
pub const MOUNT_POINT: &str = "/poc";

/// Which step of a job a sandbox launch belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Build,
    Run,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Build => f.write_str("build"),
            Phase::Run => f.write_str("run"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
    ReadOnly,
    ReadWrite,
}

impl MountMode {
    pub fn as_docker_flag(&self) -> &'static str {
        match self {
            MountMode::ReadOnly => "ro",
            MountMode::ReadWrite => "rw",
        }
    }
}

/// Everything a backend needs to launch one command of one job
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    pub job_id: JobId,
    pub phase: Phase,
    pub image: &'a str,
    pub command: &'a [String],
    pub env: &'a [(String, String)],
    /// Host path of the job's staging directory
    pub workdir: &'a Path,
    pub mount: MountMode,
    pub limits: &'a ResourceLimits,
    pub timeout: Duration,
    pub output_limit: usize,
}

/// How the sandboxed process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Exited(i32),
    /// Killed by a signal the engine did not send
    Signaled(i32),
    /// Killed by the engine once the wall-clock budget ran out
    TimedOut,
    /// Killed for exceeding the memory ceiling, with the exit code observed
    OutOfMemory(i32),
}

#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub status: ProcessStatus,
    pub output: CapturedOutput,
    pub elapsed: Duration,
}

/// Creates the sandbox runner selected by the engine configuration
///
/// `process` provides no filesystem or network isolation and is meant for
/// development and tests only. `docker` runs every phase in a hardened container.
pub fn create_sandbox_runner(config: &EngineConfig) -> Result<Arc<dyn SandboxRunner>> {
    match config.backend {
        Backend::Docker => {
            log::info!("Creating DockerRunner (full isolation mode)");
            let runner = DockerRunner::build(&config.docker_binary)?;
            Ok(Arc::new(runner))
        }
        Backend::Process => {
            log::info!("Creating ProcessRunner (NO container isolation)");
            Ok(Arc::new(ProcessRunner::new()))
        }
    }
}
