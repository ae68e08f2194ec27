use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::Semaphore;

use crate::archive::{self, ArchiveLimits};
use crate::config::Config;
use crate::error::JobError;
use crate::job::{JobId, LimitPolicy, PoCJob, ResourceLimits};
use crate::result::{ExecutionResult, OutcomeKind, ResultCollector};
use crate::runtime::{RuntimeProfile, RuntimeTable};
use crate::sandbox::{CapturedOutput, Invocation, MountMode, Phase, ProcessStatus, SandboxRunner};
use crate::staging::{self, StagingDir};

/// States a job moves through; `Terminated` is reached exactly once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Staged,
    Building,
    Running,
    Collecting,
    Terminated(OutcomeKind),
}

impl JobState {
    pub fn can_advance_to(&self, next: &JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Staged, Building)
                | (Staged, Running)
                | (Staged, Collecting)
                | (Building, Running)
                | (Building, Collecting)
                | (Running, Collecting)
                | (Collecting, Terminated(_))
        )
    }
}

/// Tracks and logs the state machine of one job
#[derive(Debug)]
struct Lifecycle {
    job: String,
    state: JobState,
}

impl Lifecycle {
    fn new(job: String) -> Self {
        Self {
            job,
            state: JobState::Staged,
        }
    }

    fn advance(&mut self, next: JobState) {
        if !self.state.can_advance_to(&next) {
            log::error!(
                "Job {} attempted invalid transition {:?} -> {:?}",
                self.job,
                self.state,
                next
            );
            debug_assert!(false, "invalid job state transition");
        }
        log::debug!("Job {} {:?} -> {:?}", self.job, self.state, next);
        self.state = next;
    }

    fn terminate(&mut self, result: ExecutionResult) -> ExecutionResult {
        if self.state != JobState::Collecting {
            self.advance(JobState::Collecting);
        }
        self.advance(JobState::Terminated(result.kind));
        result
    }
}

/// A job-level failure together with whatever output the failing phase produced
type Failure = (JobError, Option<CapturedOutput>);

/// The parts of an invocation shared by every phase of one job
struct Launch<'a> {
    job: JobId,
    profile: &'a RuntimeProfile,
    limits: &'a ResourceLimits,
    staging: &'a StagingDir,
    mount: MountMode,
    output_limit: usize,
}

impl Launch<'_> {
    fn invocation<'b>(
        &'b self,
        phase: Phase,
        command: &'b [String],
        timeout: Duration,
    ) -> Invocation<'b> {
        Invocation {
            job_id: self.job,
            phase,
            image: &self.profile.image,
            command,
            env: &self.profile.env,
            workdir: self.staging.path(),
            mount: self.mount,
            limits: self.limits,
            timeout,
            output_limit: self.output_limit,
        }
    }
}

/// Static settings an engine is constructed with
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub runtimes: RuntimeTable,
    pub limits: LimitPolicy,
    pub staging_root: PathBuf,
    pub output_limit: usize,
    pub max_concurrent_jobs: usize,
    pub build_time_fraction: f64,
    pub archive_limits: ArchiveLimits,
}

impl EngineSettings {
    /// Settings with built-in defaults, staging under `staging_root`
    pub fn new(staging_root: impl Into<PathBuf>) -> Self {
        let engine = crate::config::EngineConfig::default();
        Self {
            runtimes: RuntimeTable::builtin(),
            limits: LimitPolicy::default(),
            staging_root: staging_root.into(),
            output_limit: engine.output_limit_bytes,
            max_concurrent_jobs: engine.max_concurrent_jobs,
            build_time_fraction: engine.build_time_fraction,
            archive_limits: engine.archive_limits(),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let staging_root = match &config.engine.staging_root {
            Some(root) => root.clone(),
            None => staging::default_staging_root()?,
        };
        Ok(Self {
            runtimes: config.runtime_table(),
            limits: config.limits,
            staging_root,
            output_limit: config.engine.output_limit_bytes,
            max_concurrent_jobs: config.engine.max_concurrent_jobs,
            build_time_fraction: config.engine.build_time_fraction,
            archive_limits: config.engine.archive_limits(),
        })
    }
}

/// The PoC execution engine
///
/// Constructed once at startup and shared by reference; holds no per-job state.
pub struct Engine {
    settings: EngineSettings,
    runner: Arc<dyn SandboxRunner>,
    permits: Semaphore,
}

impl Engine {
    pub fn new(settings: EngineSettings, runner: Arc<dyn SandboxRunner>) -> Result<Self> {
        staging::prepare_root(&settings.staging_root)?;
        log::info!(
            "Engine ready: backend {}, staging root {}, {} concurrent jobs",
            runner.name(),
            settings.staging_root.display(),
            settings.max_concurrent_jobs
        );

        let permits = Semaphore::new(settings.max_concurrent_jobs.max(1));
        Ok(Self {
            settings,
            runner,
            permits,
        })
    }

    pub fn runtimes(&self) -> &RuntimeTable {
        &self.settings.runtimes
    }

    pub fn runner(&self) -> Arc<dyn SandboxRunner> {
        Arc::clone(&self.runner)
    }

    /// Executes one job end to end
    ///
    /// Every job-level failure is reported inside the `ExecutionResult`; `Err`
    /// means the engine itself is unhealthy (e.g. the staging directory could
    /// not be created).
    pub async fn execute(&self, job: &PoCJob) -> Result<ExecutionResult> {
        let job_id = job.id();
        let mut lifecycle = Lifecycle::new(job_id.to_string());

        let profile = match self.settings.runtimes.select(job.language()) {
            Ok(profile) => profile,
            Err(e) => {
                log::warn!("Job {job_id} rejected: {e}");
                let result = ResultCollector::start(job_id).failure(&e, None);
                return Ok(lifecycle.terminate(result));
            }
        };
        let limits = self.settings.limits.resolve(job.limits());

        let _permit = self.permits.acquire().await?;
        let collector = ResultCollector::start(job_id);
        let staging = StagingDir::create(&self.settings.staging_root, job_id)?;
        log::info!(
            "Job {job_id} started: {} with {}MB/{} cpus/{} pids/{}s",
            profile.language,
            limits.memory.0,
            limits.cpus,
            limits.pids,
            limits.timeout.0
        );

        let outcome = self
            .drive(job, profile, &limits, &staging, &mut lifecycle)
            .await;

        if let Err(e) = staging.close() {
            log::error!("Job {job_id} failed to remove its staging dir: {e}");
        }

        let result = match outcome? {
            Ok(output) => collector.success(output),
            Err((error, output)) => {
                if let JobError::Infrastructure(e) = &error {
                    log::error!("Job {job_id} infrastructure failure: {e}");
                }
                collector.failure(&error, output)
            }
        };
        let result = lifecycle.terminate(result);

        log::info!(
            "Job {job_id} finished: {:?} (exit {}) in {}ms",
            result.kind,
            result.exit_code,
            result.duration_ms
        );
        Ok(result)
    }

    /// Runs the staged, building and running states of a job
    ///
    /// The outer `Result` carries engine faults, the inner one the job outcome.
    async fn drive(
        &self,
        job: &PoCJob,
        profile: &RuntimeProfile,
        limits: &ResourceLimits,
        staging: &StagingDir,
        lifecycle: &mut Lifecycle,
    ) -> Result<Result<CapturedOutput, Failure>> {
        let extracted = archive::extract(
            job.archive(),
            staging.path(),
            &self.settings.archive_limits,
            &profile.file_name,
        );
        if let Err(e) = extracted {
            log::warn!("Job {} archive rejected: {e}", job.id());
            lifecycle.advance(JobState::Collecting);
            return Ok(Err((e.into(), None)));
        }
        staging.write_source(&profile.file_name, job.source())?;

        let budget = Duration::from(limits.timeout);
        let started = Instant::now();
        let mount = if profile.writable_mount() {
            MountMode::ReadWrite
        } else {
            MountMode::ReadOnly
        };
        let launch = Launch {
            job: job.id(),
            profile,
            limits,
            staging,
            mount,
            output_limit: self.settings.output_limit,
        };

        if let Some(build) = profile.build_command() {
            lifecycle.advance(JobState::Building);
            let build_budget = budget.mul_f64(self.settings.build_time_fraction);

            let outcome = self
                .runner
                .run(launch.invocation(Phase::Build, &build, build_budget))
                .await;
            match outcome {
                Err(e) => {
                    lifecycle.advance(JobState::Collecting);
                    return Ok(Err((e.into(), None)));
                }
                Ok(outcome) => {
                    let failure = match outcome.status {
                        ProcessStatus::Exited(0) => None,
                        ProcessStatus::TimedOut => Some(JobError::Timeout(limits.timeout.0)),
                        ProcessStatus::Exited(code) | ProcessStatus::OutOfMemory(code) => {
                            Some(JobError::BuildFailed(code))
                        }
                        ProcessStatus::Signaled(signal) => Some(JobError::BuildFailed(128 + signal)),
                    };
                    if let Some(error) = failure {
                        lifecycle.advance(JobState::Collecting);
                        return Ok(Err((error, Some(outcome.output))));
                    }
                    log::debug!("Job {} built in {:?}", job.id(), outcome.elapsed);
                }
            }
        }

        lifecycle.advance(JobState::Running);
        let remaining = budget.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            lifecycle.advance(JobState::Collecting);
            return Ok(Err((JobError::Timeout(limits.timeout.0), None)));
        }

        let run = profile.run_command();
        let outcome = self.runner.run(launch.invocation(Phase::Run, &run, remaining)).await;
        lifecycle.advance(JobState::Collecting);

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => return Ok(Err((e.into(), None))),
        };
        let error = match outcome.status {
            ProcessStatus::Exited(0) => return Ok(Ok(outcome.output)),
            ProcessStatus::Exited(code) => JobError::RuntimeExit(code),
            ProcessStatus::OutOfMemory(code) => {
                log::warn!("Job {} exceeded its {}MB memory ceiling", job.id(), limits.memory.0);
                JobError::RuntimeExit(code)
            }
            ProcessStatus::Signaled(signal) => JobError::RuntimeExit(128 + signal),
            ProcessStatus::TimedOut => JobError::Timeout(limits.timeout.0),
        };
        Ok(Err((error, Some(outcome.output))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_transitions() {
        use JobState::*;
        let allowed = [
            (Staged, Building),
            (Staged, Running),
            (Staged, Collecting),
            (Building, Running),
            (Building, Collecting),
            (Running, Collecting),
            (Collecting, Terminated(OutcomeKind::Success)),
        ];
        for (from, to) in allowed {
            assert!(from.can_advance_to(&to), "{from:?} -> {to:?}");
        }

        let forbidden = [
            (Staged, Terminated(OutcomeKind::Success)),
            (Running, Building),
            (Running, Terminated(OutcomeKind::Timeout)),
            (Collecting, Running),
            (Terminated(OutcomeKind::Success), Collecting),
            (
                Terminated(OutcomeKind::Success),
                Terminated(OutcomeKind::Timeout),
            ),
        ];
        for (from, to) in forbidden {
            assert!(!from.can_advance_to(&to), "{from:?} -> {to:?}");
        }
    }

    #[test]
    fn test_lifecycle_terminates_once_from_any_phase() {
        let result = ResultCollector::start(JobId::new())
            .failure(&JobError::Timeout(1), None);

        let mut lifecycle = Lifecycle::new("a".into());
        lifecycle.advance(JobState::Running);
        lifecycle.advance(JobState::Collecting);
        lifecycle.terminate(result.clone());
        assert_eq!(lifecycle.state, JobState::Terminated(OutcomeKind::Timeout));

        let mut lifecycle = Lifecycle::new("b".into());
        lifecycle.terminate(result);
        assert_eq!(lifecycle.state, JobState::Terminated(OutcomeKind::Timeout));
    }

    #[test]
    fn test_rejected_runtime_terminates_from_staged() {
        let result = ResultCollector::start(JobId::new())
            .failure(&JobError::UnsupportedRuntime("cobol".into()), None);

        let mut lifecycle = Lifecycle::new("c".into());
        let result = lifecycle.terminate(result);
        assert_eq!(result.kind, OutcomeKind::UnsupportedRuntime);
        assert_eq!(
            lifecycle.state,
            JobState::Terminated(OutcomeKind::UnsupportedRuntime)
        );
    }
}
