//! Worker subprocess spawning and collector thread setup.

use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::cli::Cli;
use crate::error::{NxjError, Result};
use crate::proc::WorkerProc;

/// Counter naming the stderr forwarding threads.
static WORKER_STDERR_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Stack size for collector threads (64 MiB).
///
/// Collectors only drive the IPC loop, but replies can nest deeply and the
/// JSON recursion needs room.
pub const COLLECTOR_STACK_SIZE: usize = 64 * 1024 * 1024;

/// Fork a worker: this same binary with `--internal-worker`, pipes on
/// stdin/stdout, stderr forwarded into the log.
pub fn spawn_worker(cli: &Cli) -> Result<WorkerProc> {
    let exe = std::env::current_exe()
        .map_err(|e| NxjError::Worker(format!("cannot locate own executable: {e}")))?;

    let mut cmd = Command::new(exe);
    cmd.args(cli.worker_args());
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    // The worker owns the evaluator heap; reclamation is process death.
    cmd.env("GC_DONT_GC", "1");

    let mut child = cmd
        .spawn()
        .map_err(|e| NxjError::Worker(format!("failed to spawn worker: {e}")))?;

    if let Some(stderr) = child.stderr.take() {
        let worker_id = WORKER_STDERR_COUNTER.fetch_add(1, Ordering::Relaxed);
        std::thread::Builder::new()
            .name(format!("worker-{worker_id}-stderr"))
            .spawn(move || forward_worker_stderr(worker_id, stderr))
            .ok(); // stderr forwarding is best-effort
    }

    WorkerProc::from_child(child)
}

/// Forward worker stderr lines through tracing.
///
/// Evaluation errors already travel in the JSON replies; their stderr copies
/// and any interpreter chatter surface here for the log.
fn forward_worker_stderr(worker_id: usize, stderr: std::process::ChildStderr) {
    let reader = BufReader::new(stderr);
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break, // pipe closed
        };
        if line.trim().is_empty() {
            continue;
        }
        let lower = line.to_lowercase();
        if lower.contains("error:") {
            tracing::warn!(worker_id, "{line}");
        } else if lower.contains("warning:") {
            tracing::debug!(worker_id, "{line}");
        } else {
            tracing::debug!(worker_id, "{line}");
        }
    }
}

/// Spawn a collector thread with the large stack.
pub fn spawn_collector_thread<F>(id: usize, f: F) -> std::thread::JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(format!("collector-{id}"))
        .stack_size(COLLECTOR_STACK_SIZE)
        .spawn(f)
        .expect("failed to spawn collector thread")
}
