//! End-to-end jobs on the local process backend

use std::sync::Arc;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use pocrun::engine::{Engine, EngineSettings};
use pocrun::job::PoCJob;
use pocrun::result::{BUILD_FAILED_EXIT_CODE, OutcomeKind, TIMEOUT_EXIT_CODE};
use pocrun::sandbox::ProcessRunner;

fn process_engine() -> (Engine, TempDir) {
    let root = tempfile::tempdir().unwrap();
    let settings = EngineSettings::new(root.path().join("staging"));
    let engine = Engine::new(settings, Arc::new(ProcessRunner::new())).unwrap();
    (engine, root)
}

/// The process backend only searches the standard system directories
fn has_tool(name: &str) -> bool {
    ["/usr/local/sbin", "/usr/local/bin", "/usr/sbin", "/usr/bin", "/sbin", "/bin"]
        .iter()
        .any(|dir| std::path::Path::new(dir).join(name).exists())
}

fn staging_is_empty(root: &TempDir) -> bool {
    std::fs::read_dir(root.path().join("staging"))
        .unwrap()
        .next()
        .is_none()
}

#[tokio::test]
async fn test_bash_echo() {
    let (engine, root) = process_engine();

    let result = engine.execute(&PoCJob::new("bash", "echo ok")).await.unwrap();

    assert!(result.success, "{result:?}");
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.output, "ok\n");
    assert!(staging_is_empty(&root));
}

#[tokio::test]
async fn test_stderr_is_merged_and_exit_code_kept() {
    let (engine, _root) = process_engine();

    let result = engine
        .execute(&PoCJob::new("bash", "echo out; echo err >&2; exit 7"))
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.kind, OutcomeKind::RuntimeExit);
    assert_eq!(result.exit_code, 7);
    assert!(result.output.contains("out\n"));
    assert!(result.output.contains("err\n"));
}

#[tokio::test]
async fn test_sleep_beyond_timeout_is_killed() {
    let (engine, root) = process_engine();

    let started = Instant::now();
    let job = PoCJob::new("bash", "sleep 30").with_timeout(1);
    let result = engine.execute(&job).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.kind, OutcomeKind::Timeout);
    assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(staging_is_empty(&root));
}

#[tokio::test]
async fn test_background_descendants_do_not_outlive_the_job() {
    let (engine, root) = process_engine();
    let witness = root.path().join("late");

    let script = format!("(sleep 2; touch {}) &\necho started", witness.display());
    let result = engine.execute(&PoCJob::new("bash", script)).await.unwrap();
    assert!(result.success);
    assert_eq!(result.output, "started\n");

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!witness.exists());
}

#[tokio::test]
async fn test_output_is_capped() {
    let (engine, _root) = process_engine();

    let result = engine
        .execute(&PoCJob::new("bash", "head -c 200000 /dev/zero | tr '\\0' a"))
        .await
        .unwrap();

    assert!(result.success);
    assert!(result.truncated);
    assert_eq!(result.output.len(), 64 * 1024);
}

#[tokio::test]
async fn test_memory_exhaustion_never_succeeds() {
    let (engine, _root) = process_engine();

    let job = PoCJob::new(
        "bash",
        "x=$(head -c 300000000 /dev/zero | tr '\\0' a)\necho survived ${#x}",
    )
    .with_timeout(20);
    let result = engine.execute(&job).await.unwrap();

    assert!(!result.success, "{result:?}");
    assert!(!result.output.contains("survived 300000000"));
}

#[tokio::test]
async fn test_python_print() {
    if !has_tool("python3") {
        eprintln!("python3 not installed, skipping");
        return;
    }
    let (engine, root) = process_engine();

    let result = engine
        .execute(&PoCJob::new("python", "print(\"ok\")"))
        .await
        .unwrap();

    assert!(result.success, "{result:?}");
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.output, "ok\n");
    assert!(staging_is_empty(&root));
}

#[tokio::test]
async fn test_go_compile_error() {
    if !has_tool("go") {
        eprintln!("go not installed, skipping");
        return;
    }
    let (engine, _root) = process_engine();

    let job = PoCJob::new("go", "package main\nfunc main() { undefined() }\n").with_timeout(60);
    let result = engine.execute(&job).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.kind, OutcomeKind::BuildFailed);
    assert_eq!(result.exit_code, BUILD_FAILED_EXIT_CODE);
}

#[tokio::test]
async fn test_locked_down_directories_are_still_cleaned_up() {
    if unsafe { libc::geteuid() } == 0 {
        eprintln!("running as root, permission bits are not enforced, skipping");
        return;
    }
    let (engine, root) = process_engine();

    let job = PoCJob::new("bash", "mkdir -p d/e; touch d/e/f; chmod 000 d/e; chmod 500 d");
    let result = engine.execute(&job).await.unwrap();

    assert!(result.success, "{result:?}");
    assert!(staging_is_empty(&root));
}
