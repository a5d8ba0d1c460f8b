//! Wire protocol between supervisor and worker.
//!
//! Line-oriented ASCII over a pipe pair:
//!
//! | direction | line |
//! |---|---|
//! | worker → supervisor | `next` |
//! | worker → supervisor | `restart` |
//! | worker → supervisor | `<json object>` (reply or error) |
//! | supervisor → worker | `exit` |
//! | supervisor → worker | `do <json array>` |

use crate::attr::AttrPath;
use crate::error::{NxjError, Result};

/// A line received from a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMsg {
    /// Worker is idle and ready for a job.
    Next,
    /// Worker self-terminated (memory cap) and wants to be respawned.
    Restart,
    /// A JSON reply: job record, children enumeration, or error.
    Reply(serde_json::Value),
}

impl WorkerMsg {
    /// Parse a received line. Anything that is neither a keyword nor valid
    /// JSON is a protocol violation.
    pub fn parse(line: &str) -> Result<Self> {
        match line {
            "next" => Ok(Self::Next),
            "restart" => Ok(Self::Restart),
            _ => match serde_json::from_str::<serde_json::Value>(line) {
                Ok(value) if value.is_object() => Ok(Self::Reply(value)),
                _ => Err(NxjError::Protocol(line.to_string())),
            },
        }
    }
}

/// A line sent to a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorMsg {
    /// Terminate the worker.
    Exit,
    /// Evaluate the value at the given path.
    Do(AttrPath),
}

impl SupervisorMsg {
    pub fn to_line(&self) -> String {
        match self {
            Self::Exit => "exit".to_string(),
            Self::Do(path) => format!(
                "do {}",
                serde_json::to_string(path).expect("attr path serialization")
            ),
        }
    }

    pub fn parse(line: &str) -> Result<Self> {
        if line == "exit" {
            return Ok(Self::Exit);
        }
        if let Some(json) = line.strip_prefix("do ") {
            let path: AttrPath =
                serde_json::from_str(json).map_err(|_| NxjError::Protocol(line.to_string()))?;
            return Ok(Self::Do(path));
        }
        Err(NxjError::Protocol(line.to_string()))
    }
}
