use std::collections::HashSet;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::SandboxError;

use super::{
    Invocation, MOUNT_POINT, OutputCollector, ProcessOutcome, ProcessStatus, SandboxRunner,
};

// Container configuration constants
const MANAGED_LABEL: &str = "pocrun.managed=true";
const TMPFS_MOUNT: &str = "/tmp:rw,nosuid,nodev,size=64m";
const NOFILE_LIMIT: u32 = 256;
const OUTPUT_GRACE: Duration = Duration::from_secs(2);
const KILL_GRACE: Duration = Duration::from_secs(5);

/// `docker run` exits with 125 when the daemon failed, but a PoC may exit 125 too
const DOCKER_RUN_ERROR: i32 = 125;
/// `State.StartedAt` of a container that was created but never started
const NEVER_STARTED: &str = "0001-01-01";

/// Names of containers currently owned by a live job
#[derive(Debug, Default)]
pub struct ContainerRegistry {
    active: Mutex<HashSet<String>>,
}

impl ContainerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, name: &str) {
        self.active.lock().insert(name.to_string());
    }

    fn remove(&self, name: &str) {
        self.active.lock().remove(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.active.lock().contains(name)
    }

    pub fn len(&self) -> usize {
        self.active.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A sandbox backend that runs every phase in a hardened, throwaway container
///
/// Containers get no network, no capabilities, no privilege escalation, a
/// read-only root filesystem, memory/CPU/pids ceilings and the staging
/// directory mounted at `/poc`. They run as the engine's own uid/gid so the
/// staging directory needs no extra permissions.
#[derive(Debug)]
pub struct DockerRunner {
    docker: String,
    registry: Arc<ContainerRegistry>,
    user: String,
}

impl DockerRunner {
    pub fn build(docker: &str) -> Result<Self> {
        // SAFETY: getuid/getgid cannot fail and touch no memory
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };

        log::info!("DockerRunner initialized with `{docker}`, containers run as {uid}:{gid}");
        Ok(Self {
            docker: docker.to_string(),
            registry: Arc::new(ContainerRegistry::new()),
            user: format!("{uid}:{gid}"),
        })
    }

    pub fn registry(&self) -> Arc<ContainerRegistry> {
        Arc::clone(&self.registry)
    }

    /// Asks the daemon whether the container was killed by the OOM killer
    async fn was_oom_killed(&self, name: &str) -> bool {
        let output = Command::new(&self.docker)
            .args(["inspect", "--format", "{{.State.OOMKilled}}", name])
            .stdin(Stdio::null())
            .output()
            .await;
        match output {
            Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout).trim() == "true",
            _ => false,
        }
    }

    /// Whether the container process ever ran, telling a PoC that exited 125
    /// apart from a daemon that refused to start it
    async fn container_started(&self, name: &str) -> bool {
        let output = Command::new(&self.docker)
            .args(["inspect", "--format", "{{.State.StartedAt}}", name])
            .stdin(Stdio::null())
            .output()
            .await;
        match output {
            Ok(out) if out.status.success() => {
                let started_at = String::from_utf8_lossy(&out.stdout);
                let started_at = started_at.trim();
                !started_at.is_empty() && !started_at.starts_with(NEVER_STARTED)
            }
            _ => false,
        }
    }

    async fn exit_status(&self, name: &str, code: i32) -> Option<ProcessStatus> {
        if code == DOCKER_RUN_ERROR && !self.container_started(name).await {
            return None;
        }
        if self.was_oom_killed(name).await {
            Some(ProcessStatus::OutOfMemory(code))
        } else {
            Some(ProcessStatus::Exited(code))
        }
    }

    async fn kill(&self, name: &str) {
        let result = Command::new(&self.docker)
            .args(["kill", name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = result {
            log::warn!("Failed to run docker kill for {name}: {e}");
        }
    }

    async fn list_managed(&self) -> Result<Vec<String>, SandboxError> {
        let filter = format!("label={MANAGED_LABEL}");
        let output = Command::new(&self.docker)
            .args(["ps", "-a", "--filter", &filter, "--format", "{{.Names}}"])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| unavailable(&self.docker, e))?;

        if !output.status.success() {
            return Err(SandboxError::Unavailable(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

#[async_trait]
impl SandboxRunner for DockerRunner {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn run(&self, invocation: Invocation<'_>) -> Result<ProcessOutcome, SandboxError> {
        if invocation.command.is_empty() {
            return Err(SandboxError::Launch("empty command".to_string()));
        }

        let name = container_name(&invocation);
        let args = build_docker_args(&invocation, &name, &self.user);
        let container = ContainerHandle::register(&self.docker, &name, Arc::clone(&self.registry));

        log::debug!("Job {} launching container {name}", invocation.job_id);
        let started = Instant::now();
        let mut child = match Command::new(&self.docker)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                container.remove().await;
                return Err(unavailable(&self.docker, e));
            }
        };
        let collector = OutputCollector::attach(&mut child, invocation.output_limit);

        let waited = timeout(invocation.timeout, child.wait()).await;
        let status = match waited {
            Ok(Ok(exit_status)) => match exit_status.code() {
                Some(code) => self.exit_status(&name, code).await,
                None => Some(ProcessStatus::Exited(-1)),
            },
            Ok(Err(e)) => {
                container.remove().await;
                return Err(SandboxError::Supervision(format!("wait failed: {e}")));
            }
            Err(_) => {
                log::info!(
                    "Job {} {} phase hit {:?} timeout, killing container {name}",
                    invocation.job_id,
                    invocation.phase,
                    invocation.timeout
                );
                self.kill(&name).await;
                if timeout(KILL_GRACE, child.wait()).await.is_err() {
                    let _ = child.kill().await;
                }
                Some(ProcessStatus::TimedOut)
            }
        };
        let elapsed = started.elapsed();
        let output = collector.finish(OUTPUT_GRACE).await;
        container.remove().await;

        match status {
            Some(status) => Ok(ProcessOutcome {
                status,
                output,
                elapsed,
            }),
            None => Err(SandboxError::Launch(output.text().trim().to_string())),
        }
    }

    async fn reap_orphans(&self) -> Result<usize, SandboxError> {
        let mut reaped = 0;
        for name in self.list_managed().await? {
            if self.registry.contains(&name) {
                continue;
            }
            let status = Command::new(&self.docker)
                .args(["rm", "-f", &name])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
                .map_err(|e| unavailable(&self.docker, e))?;
            if status.success() {
                log::info!("Reaped orphaned container {name}");
                reaped += 1;
            }
        }
        Ok(reaped)
    }
}

/// Container name unique to one phase of one job
fn container_name(invocation: &Invocation<'_>) -> String {
    format!(
        "pocrun-{}-{}",
        invocation.job_id.0.simple(),
        invocation.phase
    )
}

fn unavailable(docker: &str, e: io::Error) -> SandboxError {
    if e.kind() == io::ErrorKind::NotFound {
        SandboxError::Unavailable(format!("`{docker}` not found"))
    } else {
        SandboxError::Unavailable(format!("failed to run `{docker}`: {e}"))
    }
}

/// Builds the `docker run` arguments enforcing every sandbox restriction
pub fn build_docker_args(invocation: &Invocation<'_>, name: &str, user: &str) -> Vec<String> {
    let limits = invocation.limits;
    let mut args: Vec<String> = vec![
        "run".into(),
        "--name".into(),
        name.into(),
        "--label".into(),
        MANAGED_LABEL.into(),
        "--label".into(),
        format!("pocrun.job={}", invocation.job_id),
        "--label".into(),
        format!("pocrun.phase={}", invocation.phase),
        "--network=none".into(),
        "--cap-drop=ALL".into(),
        "--security-opt=no-new-privileges".into(),
        "--read-only".into(),
        "--tmpfs".into(),
        TMPFS_MOUNT.into(),
        format!("--memory={}m", limits.memory.0),
        // Same value as --memory: no swap on top of the ceiling
        format!("--memory-swap={}m", limits.memory.0),
        format!("--cpus={}", limits.cpus),
        format!("--pids-limit={}", limits.pids),
        "--ulimit".into(),
        format!("nofile={NOFILE_LIMIT}:{NOFILE_LIMIT}"),
        "--init".into(),
        "--user".into(),
        user.into(),
        "-v".into(),
        format!(
            "{}:{MOUNT_POINT}:{}",
            invocation.workdir.display(),
            invocation.mount.as_docker_flag()
        ),
        "-w".into(),
        MOUNT_POINT.into(),
        "-e".into(),
        "HOME=/tmp".into(),
    ];

    for (key, value) in invocation.env {
        args.push("-e".into());
        args.push(format!("{key}={value}"));
    }

    args.push(invocation.image.into());
    args.extend(invocation.command.iter().cloned());
    args
}

/// A registered container name whose removal is guaranteed
///
/// `remove` is the normal path; `Drop` covers futures cancelled mid-job.
struct ContainerHandle {
    docker: String,
    name: String,
    registry: Arc<ContainerRegistry>,
    removed: bool,
}

impl ContainerHandle {
    fn register(docker: &str, name: &str, registry: Arc<ContainerRegistry>) -> Self {
        registry.insert(name);
        Self {
            docker: docker.to_string(),
            name: name.to_string(),
            registry,
            removed: false,
        }
    }

    async fn remove(mut self) {
        let result = Command::new(&self.docker)
            .args(["rm", "-f", &self.name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await;
        self.finish(result.map(|out| (out.status.success(), out.stderr)));
    }

    fn finish(&mut self, result: io::Result<(bool, Vec<u8>)>) {
        match result {
            Ok((true, _)) => log::debug!("Removed container {}", self.name),
            // "No such container" means it never got created, which is fine
            Ok((false, stderr)) if String::from_utf8_lossy(&stderr).contains("No such container") => {}
            Ok((false, stderr)) => log::error!(
                "Failed to remove container {}: {}",
                self.name,
                String::from_utf8_lossy(&stderr).trim()
            ),
            Err(e) => log::error!("Failed to remove container {}: {e}", self.name),
        }
        self.registry.remove(&self.name);
        self.removed = true;
    }
}

impl Drop for ContainerHandle {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        let result = std::process::Command::new(&self.docker)
            .args(["rm", "-f", &self.name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output();
        self.finish(result.map(|out| (out.status.success(), out.stderr)));
    }
}
