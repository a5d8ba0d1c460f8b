//! Collector thread: drives exactly one worker subprocess at a time.
//!
//! The loop mirrors the worker's: read the worker's state line, acquire a
//! path, send `do`, process the reply. A worker that announces `restart` is
//! reaped and replaced; one that dies is diagnosed and the run poisoned.

use tracing::{debug, warn};

use crate::attr::AttrPath;
use crate::error::{NxjError, Result};
use crate::proc::WorkerProc;
use crate::protocol::{SupervisorMsg, WorkerMsg};

use super::output::OutputLock;
use super::state::WorkSet;

pub struct Collector<'a> {
    pub id: usize,
    pub state: &'a WorkSet,
    pub out: &'a OutputLock,
    pub spawn: &'a (dyn Fn() -> Result<WorkerProc> + Sync),
}

impl Collector<'_> {
    /// Run until the queue drains or the run is poisoned. Any failure in
    /// here poisons the shared state so the other collectors stop too.
    pub fn run(&self) {
        if let Err(err) = self.drive() {
            debug!(collector = self.id, error = %err, "collector failed");
            self.state.poison(err);
        }
    }

    fn drive(&self) -> Result<()> {
        let mut idle: Option<WorkerProc> = None;

        loop {
            let mut worker = match idle.take() {
                Some(worker) => worker,
                None => (self.spawn)()?,
            };

            // The worker speaks first: `next` when ready, `restart` when it
            // recycled itself after the previous reply.
            match worker.recv() {
                Ok(Some(WorkerMsg::Next)) => {}
                Ok(Some(WorkerMsg::Restart)) => {
                    debug!(collector = self.id, "worker hit its memory cap, respawning");
                    worker.wait_for_exit();
                    continue;
                }
                Ok(Some(WorkerMsg::Reply(reply))) => {
                    return Err(match reply.get("error").and_then(|e| e.as_str()) {
                        Some(message) => NxjError::Worker(message.to_string()),
                        None => NxjError::Protocol(reply.to_string()),
                    });
                }
                Ok(None) => {
                    return Err(escalate(&mut worker, "checking worker process"));
                }
                Err(e) => return Err(e),
            }

            let Some(path) = self.state.acquire() else {
                if worker.send(&SupervisorMsg::Exit).is_err() {
                    return Err(escalate(&mut worker, "sending exit"));
                }
                worker.wait_for_exit();
                return Ok(());
            };

            if worker.send(&SupervisorMsg::Do(path.clone())).is_err() {
                return Err(escalate(
                    &mut worker,
                    &format!("sending attrPath '{}'", path.joined()),
                ));
            }

            let reply = match worker.recv() {
                Ok(Some(WorkerMsg::Reply(reply))) => reply,
                Ok(Some(other)) => {
                    return Err(NxjError::Worker(format!(
                        "unexpected message {other:?} in response to attrPath '{}'",
                        path.joined()
                    )))
                }
                Ok(None) => {
                    return Err(escalate(
                        &mut worker,
                        &format!("reading response for attrPath '{}'", path.joined()),
                    ));
                }
                Err(e) => return Err(e),
            };

            self.process_reply(&path, reply)?;
            self.state.finish(&path);
            idle = Some(worker);
        }
    }

    fn process_reply(&self, path: &AttrPath, reply: serde_json::Value) -> Result<()> {
        // A children enumeration extends the queue and is never printed.
        if let Some(attrs) = reply.get("attrs") {
            let names = attrs
                .as_array()
                .map(|values| {
                    values
                        .iter()
                        .map(|v| v.as_str().map(String::from))
                        .collect::<Option<Vec<_>>>()
                })
                .unwrap_or_default()
                .ok_or_else(|| {
                    NxjError::Worker(format!(
                        "expected an array of attribute names from worker, got: {reply}"
                    ))
                })?;
            self.state.push_children(path, &names);
            return Ok(());
        }

        let attr = reply
            .get("attr")
            .and_then(|a| a.as_str())
            .ok_or_else(|| NxjError::Worker(format!("worker reply has no attr: {reply}")))?
            .to_string();

        if !self.state.record_job(&attr, reply.clone()) {
            warn!(attr = %attr, "duplicate record dropped");
            return Ok(());
        }

        // Records awaiting constituent resolution are held back until the
        // aggregate pass; everything else streams out immediately.
        let print_now = reply
            .get("namedConstituents")
            .and_then(|v| v.as_array())
            .map_or(true, |named| named.is_empty());
        if print_now {
            self.out.emit(&reply)?;
        }
        Ok(())
    }
}

fn escalate(worker: &mut WorkerProc, context: &str) -> NxjError {
    let death = worker.reap_and_diagnose();
    NxjError::Worker(format!("while {context}: worker {death}"))
}
