//! Shared fixtures for the engine integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use pocrun::engine::{Engine, EngineSettings};
use pocrun::error::SandboxError;
use pocrun::sandbox::{
    CapturedOutput, Invocation, MountMode, Phase, ProcessOutcome, ProcessStatus, SandboxRunner,
};

/// What the fake runner saw when a phase was launched
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub phase: Phase,
    pub image: String,
    pub command: Vec<String>,
    pub workdir: PathBuf,
    pub mount: MountMode,
    pub timeout: Duration,
    /// Names present in the workdir at launch time, sorted
    pub files: Vec<String>,
}

pub type Scripted = Result<ProcessOutcome, SandboxError>;

pub fn exited(code: i32, output: &str) -> Scripted {
    Ok(ProcessOutcome {
        status: ProcessStatus::Exited(code),
        output: CapturedOutput {
            bytes: output.as_bytes().to_vec(),
            truncated: false,
        },
        elapsed: Duration::from_millis(5),
    })
}

pub fn timed_out(output: &str) -> Scripted {
    Ok(ProcessOutcome {
        status: ProcessStatus::TimedOut,
        output: CapturedOutput {
            bytes: output.as_bytes().to_vec(),
            truncated: false,
        },
        elapsed: Duration::from_secs(1),
    })
}

/// A sandbox runner that records every launch and replays scripted outcomes
///
/// Unscripted launches exit 0 with empty output. With `check_markers` set, every
/// run phase drops a marker file into its workdir and reports any marker that
/// is not its own.
#[derive(Default)]
pub struct FakeRunner {
    calls: Mutex<Vec<RecordedCall>>,
    build: Mutex<VecDeque<Scripted>>,
    run: Mutex<VecDeque<Scripted>>,
    check_markers: bool,
}

impl FakeRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn checking_markers() -> Arc<Self> {
        Arc::new(Self {
            check_markers: true,
            ..Self::default()
        })
    }

    pub fn script_build(&self, outcome: Scripted) {
        self.build.lock().push_back(outcome);
    }

    pub fn script_run(&self, outcome: Scripted) {
        self.run.lock().push_back(outcome);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn phases(&self) -> Vec<Phase> {
        self.calls.lock().iter().map(|c| c.phase).collect()
    }

    fn next(&self, phase: Phase) -> Scripted {
        let queue = match phase {
            Phase::Build => &self.build,
            Phase::Run => &self.run,
        };
        queue.lock().pop_front().unwrap_or_else(|| exited(0, ""))
    }

    async fn check_markers_in(&self, invocation: &Invocation<'_>) -> Scripted {
        let own = format!("marker-{}", invocation.job_id);
        fs::write(invocation.workdir.join(&own), b"x").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let foreign: Vec<String> = list_files(invocation.workdir)
            .into_iter()
            .filter(|name| name.starts_with("marker-") && *name != own)
            .collect();
        exited(0, &format!("foreign={}\n", foreign.join(",")))
    }
}

#[async_trait]
impl SandboxRunner for FakeRunner {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn run(&self, invocation: Invocation<'_>) -> Result<ProcessOutcome, SandboxError> {
        self.calls.lock().push(RecordedCall {
            phase: invocation.phase,
            image: invocation.image.to_string(),
            command: invocation.command.to_vec(),
            workdir: invocation.workdir.to_path_buf(),
            mount: invocation.mount,
            timeout: invocation.timeout,
            files: list_files(invocation.workdir),
        });

        if self.check_markers && invocation.phase == Phase::Run {
            return self.check_markers_in(&invocation).await;
        }
        self.next(invocation.phase)
    }
}

pub fn list_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

/// An engine over `runner` with a private staging root
pub fn engine_with(runner: Arc<FakeRunner>) -> (Engine, TempDir) {
    let root = tempfile::tempdir().unwrap();
    let settings = EngineSettings::new(root.path().join("staging"));
    let engine = Engine::new(settings, runner).unwrap();
    (engine, root)
}

pub fn staging_root(root: &TempDir) -> PathBuf {
    root.path().join("staging")
}

/// Builds a zip archive at `dir/name` with the given file entries
pub fn write_zip(dir: &Path, name: &str, entries: &[(&str, &[u8])]) -> PathBuf {
    use zip::write::SimpleFileOptions;

    let path = dir.join(name);
    let file = fs::File::create(&path).unwrap();
    let mut writer = zip::ZipWriter::new(file);
    for (entry, content) in entries {
        writer
            .start_file(*entry, SimpleFileOptions::default())
            .unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap();
    path
}
