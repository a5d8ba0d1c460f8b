//! Worker subprocess.
//!
//! Spawned by a collector with `--internal-worker`. Loads the traversal root
//! once, then serves `do <path>` requests in a loop, streaming one-line JSON
//! replies. Exits voluntarily (with a `restart` handoff) once its peak RSS
//! crosses the configured cap; the collector forks a replacement.

pub mod job;

use std::io;
use std::path::PathBuf;

use tracing::debug;

use crate::attr::AttrPath;
use crate::cli::Cli;
use crate::eval::fixture::FixtureEvaluator;
use crate::eval::{EvalError, EvalOptions, EvalValue, Evaluator};
use crate::ipc::{is_disconnect, LineReader, LineWriter, PipeEnd};
use crate::memory::MemorySize;
use crate::protocol::SupervisorMsg;
use crate::record::ChildrenReply;
use crate::store::Store;

/// Worker-side settings that are not the evaluator's business.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub gc_roots_dir: Option<PathBuf>,
    pub check_cache_status: bool,
    pub no_instantiate: bool,
    pub force_recurse: bool,
    pub max_rss: MemorySize,
}

impl WorkerContext {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            gc_roots_dir: cli.gc_roots_dir.clone(),
            check_cache_status: cli.check_cache_status,
            no_instantiate: cli.no_instantiate,
            force_recurse: cli.force_recurse,
            max_rss: cli.max_memory_size,
        }
    }
}

fn eval_options(cli: &Cli) -> EvalOptions {
    EvalOptions {
        release_expr: cli.release_expr.clone(),
        from_args: cli.expr,
        flake: cli.flake,
        impure: cli.impure,
        meta: cli.meta,
        show_input_drvs: cli.show_input_drvs,
        constituents: cli.constituents,
        no_instantiate: cli.no_instantiate,
        show_trace: cli.show_trace,
        apply: cli.apply.clone(),
        select: cli.select.clone(),
        reference_lock_file: cli.reference_lock_file.clone(),
        override_inputs: cli
            .override_input
            .iter()
            .filter_map(|pair| {
                pair.split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect(),
    }
}

/// Peak resident set size of this process, in MiB.
fn peak_rss_mib() -> u64 {
    use nix::sys::resource::{getrusage, UsageWho};

    match getrusage(UsageWho::RUSAGE_SELF) {
        Ok(usage) => {
            let max_rss = usage.max_rss() as u64;
            if cfg!(target_os = "macos") {
                max_rss / (1024 * 1024)
            } else {
                max_rss / 1024
            }
        }
        Err(_) => 0,
    }
}

/// Decide whether an attribute set's children should be enumerated.
///
/// The root is always walked into; elsewhere the `recurseForDerivations`
/// marker gates recursion unless `--force-recurse` overrides everything.
fn should_recurse(ctx: &WorkerContext, path: &AttrPath, marker: Option<bool>) -> bool {
    if ctx.force_recurse {
        return true;
    }
    match marker {
        Some(value) => value,
        None => path.is_root(),
    }
}

/// Serve requests until `exit`, parent death, or the memory cap.
fn serve<E: Evaluator>(
    eval: &mut E,
    store: &dyn Store,
    ctx: &WorkerContext,
    reader: &mut LineReader,
    writer: &mut LineWriter,
) -> io::Result<()> {
    loop {
        if let Err(e) = writer.write_line("next") {
            return if is_disconnect(&e) { Ok(()) } else { Err(e) };
        }

        let Some(line) = reader.read_line()? else {
            return Ok(()); // supervisor died
        };
        let path = match SupervisorMsg::parse(&line) {
            Ok(SupervisorMsg::Exit) => break,
            Ok(SupervisorMsg::Do(path)) => path,
            Err(_) => {
                eprintln!("worker error: received invalid command '{line}'");
                return Err(io::Error::new(io::ErrorKind::InvalidData, line));
            }
        };

        debug!(path = %path, "evaluating");
        let reply = evaluate_one(eval, store, ctx, &path);

        if let Err(e) = writer.write_line(&reply.to_string()) {
            return if is_disconnect(&e) { Ok(()) } else { Err(e) };
        }

        let rss = peak_rss_mib();
        if rss > ctx.max_rss.as_mib() {
            debug!(rss_mib = rss, cap_mib = ctx.max_rss.as_mib(), "memory cap reached");
            break;
        }
    }

    if let Err(e) = writer.write_line("restart") {
        return if is_disconnect(&e) { Ok(()) } else { Err(e) };
    }
    Ok(())
}

/// Evaluate one path into a single-line JSON reply.
fn evaluate_one<E: Evaluator>(
    eval: &mut E,
    store: &dyn Store,
    ctx: &WorkerContext,
    path: &AttrPath,
) -> serde_json::Value {
    let mut reply = serde_json::json!({
        "attr": path.joined(),
        "attrPath": path,
    });

    let outcome = eval.resolve(path).and_then(|value| match value {
        EvalValue::Derivation(info) => job::assemble(path, *info, store, ctx)
            .map_err(|e| EvalError::new(e.to_string()))
            .map(|record| serde_json::to_value(record).expect("record serialization")),
        EvalValue::Attrs(attrs) => {
            let keys = if should_recurse(ctx, path, attrs.recurse_marker) {
                attrs.keys
            } else {
                Vec::new()
            };
            Ok(serde_json::to_value(ChildrenReply::new(path, keys))
                .expect("children serialization"))
        }
        // Everything that cannot be built is ignored.
        EvalValue::Other => Ok(serde_json::to_value(ChildrenReply::new(path, Vec::new()))
            .expect("children serialization")),
    });

    match outcome {
        Ok(value) => value,
        Err(e) => {
            // The error travels in the reply, and also to the stderr log.
            eprintln!("{e}");
            reply["error"] = serde_json::Value::String(e.message().to_string());
            reply
        }
    }
}

/// Worker entry point; the process exit code.
pub fn run(cli: &Cli) -> i32 {
    // fds 0/1 carry the protocol; they are pipes set up by the supervisor.
    let stdin = unsafe { PipeEnd::from_raw(0) };
    let stdout = unsafe { PipeEnd::from_raw(1) };
    let mut reader = LineReader::new(stdin);
    let mut writer = LineWriter::new(stdout);

    let opts = eval_options(cli);
    let ctx = WorkerContext::from_cli(cli);

    let backend = match &cli.fixture {
        Some(dir) => FixtureEvaluator::open(dir, opts).map(|eval| {
            let store = crate::store::dir::DirStore::open(dir);
            (eval, store)
        }),
        None => Err(EvalError::new(format!(
            "no evaluation backend available for '{}'; this build only carries the harness backend",
            cli.release_expr
        ))),
    };

    let result = match backend {
        Ok((mut eval, Ok(store))) => serve(&mut eval, &store, &ctx, &mut reader, &mut writer),
        Ok((_, Err(e))) => startup_failure(&mut writer, &EvalError::new(e.to_string())),
        Err(e) => startup_failure(&mut writer, &e),
    };

    match result {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("worker error: {e}");
            1
        }
    }
}

/// Report a failure to come up at all, then hand the slot back.
fn startup_failure(writer: &mut LineWriter, err: &EvalError) -> io::Result<()> {
    eprintln!("{err}");
    let reply = serde_json::json!({ "error": err.message() });
    if let Err(e) = writer.write_line(&reply.to_string()) {
        return if is_disconnect(&e) { Ok(()) } else { Err(e) };
    }
    if let Err(e) = writer.write_line("restart") {
        return if is_disconnect(&e) { Ok(()) } else { Err(e) };
    }
    Ok(())
}
