use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::SandboxError;

use super::{Invocation, OutputCollector, ProcessOutcome, ProcessStatus, SandboxRunner};

const HOST_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
const SCRATCH_DIR: &str = ".tmp";
const OUTPUT_GRACE: Duration = Duration::from_secs(2);
const FILE_SIZE_LIMIT: u64 = 64 * 1024 * 1024;

/// A runner that executes commands as a plain local process group
///
/// ProcessRunner enforces the wall-clock timeout (killing the whole process
/// group), a data-segment memory ceiling and a CPU-time backstop through
/// rlimits. It provides NO filesystem, network or process-count isolation and
/// ignores the image. This is intended for development and testing only.
#[derive(Debug, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        log::warn!(
            "ProcessRunner provides NO security isolation - use only in trusted environments"
        );
        Self
    }
}

#[async_trait]
impl SandboxRunner for ProcessRunner {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn run(&self, invocation: Invocation<'_>) -> Result<ProcessOutcome, SandboxError> {
        let (program, args) = invocation
            .command
            .split_first()
            .ok_or_else(|| SandboxError::Launch("empty command".to_string()))?;

        let scratch = invocation.workdir.join(SCRATCH_DIR);
        std::fs::create_dir_all(&scratch)
            .map_err(|e| SandboxError::Launch(format!("cannot create scratch dir: {e}")))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(invocation.workdir)
            .env_clear()
            .env("PATH", HOST_PATH)
            .env("HOME", &scratch)
            .env("TMPDIR", &scratch)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);
        for (key, value) in invocation.env {
            cmd.env(key, rebase_scratch(value, &scratch));
        }

        let memory_bytes = invocation.limits.memory.0 * 1024 * 1024;
        let cpu_secs = invocation.timeout.as_secs() + 1;
        // SAFETY: the closure only calls setrlimit, which is async-signal-safe
        unsafe {
            cmd.pre_exec(move || apply_rlimits(memory_bytes, cpu_secs));
        }

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            SandboxError::Launch(format!("failed to spawn `{program}`: {e}"))
        })?;
        let pgid = child.id().map(|id| id as i32);
        let collector = OutputCollector::attach(&mut child, invocation.output_limit);

        let status = match timeout(invocation.timeout, child.wait()).await {
            Ok(Ok(exit_status)) => {
                // Background descendants must not outlive the job
                kill_process_group(pgid);
                status_from_exit(exit_status)
            }
            Ok(Err(e)) => {
                kill_process_group(pgid);
                let _ = child.wait().await;
                return Err(SandboxError::Supervision(format!("wait failed: {e}")));
            }
            Err(_) => {
                log::info!(
                    "Job {} {} phase hit {:?} timeout, killing process group",
                    invocation.job_id,
                    invocation.phase,
                    invocation.timeout
                );
                kill_process_group(pgid);
                let _ = child.wait().await;
                ProcessStatus::TimedOut
            }
        };
        let elapsed = started.elapsed();
        let output = collector.finish(OUTPUT_GRACE).await;

        Ok(ProcessOutcome {
            status,
            output,
            elapsed,
        })
    }
}

/// Profiles address scratch space as `/tmp/...`; locally that maps into the job's own directory
fn rebase_scratch(value: &str, scratch: &Path) -> String {
    match value.strip_prefix("/tmp") {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => {
            format!("{}{rest}", scratch.display())
        }
        _ => value.to_string(),
    }
}

fn status_from_exit(status: ExitStatus) -> ProcessStatus {
    match (status.code(), status.signal()) {
        (Some(code), _) => ProcessStatus::Exited(code),
        (None, Some(signal)) => ProcessStatus::Signaled(signal),
        (None, None) => ProcessStatus::Exited(-1),
    }
}

fn kill_process_group(pgid: Option<i32>) {
    let Some(pgid) = pgid else {
        return;
    };
    // SAFETY: plain syscall; a negative pid addresses the whole group
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            log::warn!("Failed to kill process group {pgid}: {err}");
        }
    }
}

fn apply_rlimits(memory_bytes: u64, cpu_secs: u64) -> io::Result<()> {
    set_rlimit(libc::RLIMIT_DATA, memory_bytes)?;
    set_rlimit(libc::RLIMIT_CPU, cpu_secs)?;
    set_rlimit(libc::RLIMIT_FSIZE, FILE_SIZE_LIMIT)?;
    set_rlimit(libc::RLIMIT_CORE, 0)?;
    Ok(())
}

#[cfg(target_env = "gnu")]
type Resource = libc::__rlimit_resource_t;
#[cfg(not(target_env = "gnu"))]
type Resource = libc::c_int;

fn set_rlimit(resource: Resource, value: u64) -> io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: value as libc::rlim_t,
        rlim_max: value as libc::rlim_t,
    };
    // SAFETY: `limit` is a valid rlimit for the duration of the call
    if unsafe { libc::setrlimit(resource, &limit) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
