//! The supervisor: owns the shared queue, fans work across collector
//! threads, and runs the aggregate pass after the traversal drains.

pub mod collector;
pub mod interrupt;
pub mod output;
pub mod state;

use std::sync::Arc;

use tracing::{info, warn};

use crate::aggregate;
use crate::cli::Cli;
use crate::error::{NxjError, Result};
use crate::spawn;
use crate::store::dir::DirStore;

use collector::Collector;
use output::OutputLock;
use state::WorkSet;

/// Run the whole evaluation: traversal plus, if requested, the aggregate
/// pass. Returns the first captured failure, if the run was poisoned.
pub fn run(cli: &Cli) -> Result<()> {
    interrupt::install_handlers();

    // The aggregate pass registers roots for the rewritten derivations; a
    // run that asked for constituents without a roots directory gets a
    // temporary one.
    let mut cli = cli.clone();
    let mut _tmp_roots: Option<tempfile::TempDir> = None;
    if cli.gc_roots_dir.is_none() {
        warn!("`--gc-roots-dir' not specified");
        if cli.constituents {
            let dir = tempfile::TempDir::new()?;
            cli.gc_roots_dir = Some(dir.path().to_path_buf());
            _tmp_roots = Some(dir);
        }
    }

    let state = Arc::new(WorkSet::new());
    let out = Arc::new(OutputLock::stdout());

    info!(workers = cli.workers, "starting traversal");
    let threads: Vec<_> = (0..cli.workers.max(1))
        .map(|id| {
            let state = Arc::clone(&state);
            let out = Arc::clone(&out);
            let cli = cli.clone();
            spawn::spawn_collector_thread(id, move || {
                let spawner = || spawn::spawn_worker(&cli);
                Collector {
                    id,
                    state: &state,
                    out: &out,
                    spawn: &spawner,
                }
                .run();
            })
        })
        .collect();

    for thread in threads {
        thread
            .join()
            .map_err(|_| NxjError::Worker("collector thread panicked".into()))?;
    }

    if let Some(err) = state.take_error() {
        return Err(err);
    }

    if cli.constituents {
        let state = Arc::into_inner(state).expect("collectors joined");
        let mut jobs = state.into_jobs();
        run_aggregate_pass(&cli, &mut jobs, &out)?;
    }
    Ok(())
}

fn run_aggregate_pass(
    cli: &Cli,
    jobs: &mut std::collections::BTreeMap<String, serde_json::Value>,
    out: &OutputLock,
) -> Result<()> {
    let aggregates = match aggregate::resolve_named_constituents(jobs) {
        Ok(aggregates) => aggregates,
        Err(NxjError::DependencyCycle { a, b, remaining }) => {
            return aggregate::emit_cycle_errors(jobs, &a, &b, &remaining, out);
        }
        Err(e) => return Err(e),
    };
    if aggregates.is_empty() {
        return Ok(());
    }

    let store = open_store(cli)?;
    info!(count = aggregates.len(), "resolving aggregate jobs");
    aggregate::rewrite_aggregates(
        jobs,
        aggregates,
        store.as_ref(),
        cli.gc_roots_dir.as_deref(),
        out,
    )
}

/// The store the aggregate pass rewrites derivations through. Workers open
/// their own; the supervisor only needs one here.
fn open_store(cli: &Cli) -> Result<Box<dyn crate::store::Store>> {
    match &cli.fixture {
        Some(dir) => Ok(Box::new(DirStore::open(dir)?)),
        None => Err(NxjError::Store(
            "no store backend available to rewrite aggregates".into(),
        )),
    }
}
