//! Diagnosis of unexpected worker deaths.
//!
//! When a worker pipe hits EOF without a `restart` handoff, the collector
//! reaps the child and turns its wait status into a message naming the
//! suspected cause.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// Why a worker process went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerDeath {
    /// Exit status 1 is the evaluator blowing its own stack.
    LikelyInfiniteRecursion,
    /// SIGKILL is almost always the kernel OOM killer.
    MemoryLimit,
    /// Exited with some other status code.
    Exited(i32),
    /// Killed by a signal other than the recognized ones.
    Signaled(Signal),
    /// waitpid gave nothing usable.
    Unknown,
}

impl WorkerDeath {
    pub fn describe(&self) -> String {
        match self {
            Self::LikelyInfiniteRecursion => "possible infinite recursion".to_string(),
            Self::MemoryLimit => "memory limit reached".to_string(),
            Self::Exited(code) => format!("exited with code {code}"),
            Self::Signaled(sig) => format!("killed by signal {sig}"),
            Self::Unknown => "terminated for an unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for WorkerDeath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.describe())
    }
}

/// Classify a wait status.
pub fn diagnose(status: WaitStatus) -> WorkerDeath {
    match status {
        WaitStatus::Exited(_, 1) => WorkerDeath::LikelyInfiniteRecursion,
        WaitStatus::Exited(_, code) => WorkerDeath::Exited(code),
        WaitStatus::Signaled(_, Signal::SIGKILL, _) => WorkerDeath::MemoryLimit,
        // Stack overflow surfaces as SIGSEGV on Linux and SIGBUS on macOS.
        WaitStatus::Signaled(_, Signal::SIGSEGV, _)
        | WaitStatus::Signaled(_, Signal::SIGBUS, _) => WorkerDeath::LikelyInfiniteRecursion,
        WaitStatus::Signaled(_, sig, _) => WorkerDeath::Signaled(sig),
        _ => WorkerDeath::Unknown,
    }
}
