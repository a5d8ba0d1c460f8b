//! Handle to a worker subprocess.
//!
//! Owns the child's pid and the pipe pair carrying the protocol. Each
//! collector drives exactly one of these at a time; at most one request is
//! outstanding per worker.

use std::io;
use std::process::Child;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::error::{NxjError, Result};
use crate::ipc::{LineReader, LineWriter, PipeEnd};
use crate::protocol::{SupervisorMsg, WorkerMsg};
use crate::signals::{diagnose, WorkerDeath};

pub struct WorkerProc {
    pid: Pid,
    writer: LineWriter,
    reader: LineReader,
    reaped: bool,
}

impl WorkerProc {
    /// Take over a spawned child whose stdin/stdout are piped.
    pub fn from_child(mut child: Child) -> Result<Self> {
        let pid = Pid::from_raw(child.id() as i32);

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| NxjError::Worker("child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| NxjError::Worker("child stdout not captured".into()))?;

        Ok(Self {
            pid,
            writer: LineWriter::new(PipeEnd::new(stdin.into())),
            reader: LineReader::new(PipeEnd::new(stdout.into())),
            reaped: false,
        })
    }

    /// Send one protocol line to the worker.
    pub fn send(&mut self, msg: &SupervisorMsg) -> io::Result<()> {
        self.writer.write_line(&msg.to_line())
    }

    /// Read one protocol message. `None` means the worker closed its pipe.
    pub fn recv(&mut self) -> Result<Option<WorkerMsg>> {
        match self.reader.read_line()? {
            Some(line) => Ok(Some(WorkerMsg::parse(&line)?)),
            None => Ok(None),
        }
    }

    fn try_wait(&mut self) -> Option<WaitStatus> {
        if self.reaped {
            return None;
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => None,
            Ok(status) => {
                self.reaped = true;
                Some(status)
            }
            Err(_) => {
                self.reaped = true;
                None
            }
        }
    }

    /// Reap the worker after its pipe closed unexpectedly and name the cause.
    ///
    /// Gives the child a moment to finish dying on its own so the real wait
    /// status is preserved; only then escalates to SIGKILL.
    pub fn reap_and_diagnose(&mut self) -> WorkerDeath {
        for _ in 0..50 {
            if let Some(status) = self.try_wait() {
                return diagnose(status);
            }
            if self.reaped {
                return WorkerDeath::Unknown;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let _ = signal::kill(self.pid, Signal::SIGKILL);
        match waitpid(self.pid, None) {
            Ok(_) => {
                self.reaped = true;
                WorkerDeath::Unknown
            }
            Err(_) => {
                self.reaped = true;
                WorkerDeath::Unknown
            }
        }
    }

    /// Reap a worker that was told to exit.
    pub fn wait_for_exit(&mut self) {
        if self.reaped {
            return;
        }
        if waitpid(self.pid, None).is_ok() {
            self.reaped = true;
        }
    }
}

impl Drop for WorkerProc {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        let _ = signal::kill(self.pid, Signal::SIGTERM);
        std::thread::sleep(Duration::from_millis(10));
        if self.try_wait().is_some() || self.reaped {
            return;
        }
        let _ = signal::kill(self.pid, Signal::SIGKILL);
        let _ = waitpid(self.pid, None);
        self.reaped = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};

    fn spawn(cmd: &str, args: &[&str]) -> WorkerProc {
        let child = Command::new(cmd)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("spawn test child");
        WorkerProc::from_child(child).expect("wrap test child")
    }

    #[test]
    fn test_send_recv_through_cat() {
        let mut proc = spawn("cat", &[]);
        proc.send(&SupervisorMsg::Exit).unwrap();
        // cat echoes the line back; "exit" is not a worker keyword or JSON.
        match proc.recv() {
            Err(NxjError::Protocol(line)) => assert_eq!(line, "exit"),
            other => panic!("expected protocol violation, got {other:?}"),
        }
    }

    #[test]
    fn test_eof_after_child_exit() {
        let mut proc = spawn("true", &[]);
        assert!(proc.recv().unwrap().is_none());
        assert_eq!(proc.reap_and_diagnose(), WorkerDeath::Exited(0));
    }

    #[test]
    fn test_diagnose_exit_code_one() {
        let mut proc = spawn("sh", &["-c", "exit 1"]);
        assert!(proc.recv().unwrap().is_none());
        assert_eq!(
            proc.reap_and_diagnose(),
            WorkerDeath::LikelyInfiniteRecursion
        );
    }
}
