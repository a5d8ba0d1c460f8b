//! Shared work state for the collector threads.
//!
//! One mutex guards the queue, the in-flight set, the finished-record map,
//! and the first captured failure. A condition variable wakes waiters when
//! the queue gains items or termination becomes possible.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::attr::AttrPath;
use crate::error::NxjError;

use super::interrupt;

#[derive(Default)]
struct SharedState {
    /// Paths waiting to be dispatched.
    todo: BTreeSet<AttrPath>,
    /// Paths dispatched to a worker, reply not yet processed.
    active: BTreeSet<AttrPath>,
    /// Every path ever enqueued; a path enters the queue at most once.
    seen: BTreeSet<AttrPath>,
    /// Finished records keyed by dotted attribute path.
    jobs: BTreeMap<String, serde_json::Value>,
    /// First captured failure; set once, poisons the run.
    exc: Option<NxjError>,
}

impl SharedState {
    fn done(&self) -> bool {
        self.todo.is_empty() && self.active.is_empty()
    }
}

pub struct WorkSet {
    state: Mutex<SharedState>,
    wakeup: Condvar,
}

impl WorkSet {
    /// A fresh work set seeded with the root path.
    pub fn new() -> Self {
        let mut state = SharedState::default();
        state.todo.insert(AttrPath::root());
        state.seen.insert(AttrPath::root());
        Self {
            state: Mutex::new(state),
            wakeup: Condvar::new(),
        }
    }

    /// Take a path to work on, moving it into the active set.
    ///
    /// Blocks while the queue is empty but work is still in flight. Returns
    /// `None` when the run is finished, poisoned, or interrupted; the caller
    /// should tell its worker to exit and return.
    pub fn acquire(&self) -> Option<AttrPath> {
        let mut state = self.state.lock().expect("work state poisoned");
        loop {
            if interrupt::interrupted() {
                if state.exc.is_none() {
                    state.exc = Some(NxjError::Interrupted);
                }
                self.wakeup.notify_all();
                return None;
            }
            if state.exc.is_some() || state.done() {
                return None;
            }
            if let Some(path) = state.todo.iter().next().cloned() {
                state.todo.remove(&path);
                state.active.insert(path.clone());
                return Some(path);
            }
            // Bounded wait so the interrupt flag is observed promptly even
            // when no notification arrives.
            let (next, _) = self
                .wakeup
                .wait_timeout(state, Duration::from_millis(100))
                .expect("work state poisoned");
            state = next;
        }
    }

    /// Enqueue the children of `parent`. Paths seen before are skipped.
    pub fn push_children(&self, parent: &AttrPath, names: &[String]) {
        let mut state = self.state.lock().expect("work state poisoned");
        for name in names {
            let child = parent.child(name);
            if state.seen.insert(child.clone()) {
                state.todo.insert(child);
            }
        }
        self.wakeup.notify_all();
    }

    /// Mark `path` as fully processed.
    pub fn finish(&self, path: &AttrPath) {
        let mut state = self.state.lock().expect("work state poisoned");
        state.active.remove(path);
        self.wakeup.notify_all();
    }

    /// Store a finished record under its dotted path. Returns false if the
    /// key was already taken (each leaf is inserted exactly once).
    pub fn record_job(&self, attr: &str, record: serde_json::Value) -> bool {
        let mut state = self.state.lock().expect("work state poisoned");
        match state.jobs.entry(attr.to_string()) {
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(record);
                true
            }
            std::collections::btree_map::Entry::Occupied(_) => false,
        }
    }

    /// Capture a failure. Only the first one is kept; everyone is woken so
    /// the poison is discovered promptly.
    pub fn poison(&self, err: NxjError) {
        let mut state = self.state.lock().expect("work state poisoned");
        if state.exc.is_none() {
            state.exc = Some(err);
        }
        self.wakeup.notify_all();
    }

    /// Take the captured failure, if any.
    pub fn take_error(&self) -> Option<NxjError> {
        self.state.lock().expect("work state poisoned").exc.take()
    }

    /// Consume the record map after all collectors joined.
    pub fn into_jobs(self) -> BTreeMap<String, serde_json::Value> {
        self.state.into_inner().expect("work state poisoned").jobs
    }
}
