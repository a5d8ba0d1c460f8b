//! nxj - stream derivation jobs from a nested expression as JSON lines.
//!
//! One binary, two roles: the supervisor (default) owns the work queue and
//! the output stream; with `--internal-worker` the process becomes a worker
//! subprocess serving evaluation requests over its stdin/stdout pipes.

mod aggregate;
mod attr;
mod cli;
mod error;
mod eval;
mod ipc;
mod logging;
mod memory;
mod proc;
mod protocol;
mod record;
mod signals;
mod spawn;
mod store;
mod supervisor;
mod worker;

use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};

use cli::Cli;

fn main() {
    // Environment bootstrap, strictly before any thread exists: evaluation
    // must not pick up ambient search paths, and the embedded interpreter's
    // collector stays off because worker death is the reclamation.
    std::env::remove_var("NIX_PATH");
    std::env::set_var("GC_DONT_GC", "1");

    let cli = Cli::parse();
    logging::init(cli.log_level.as_deref(), cli.log_format.as_deref());

    if cli.internal_worker {
        std::process::exit(worker::run(&cli));
    }

    let result: anyhow::Result<()> = cli
        .validate()
        .and_then(|()| supervisor::run(&cli))
        .map_err(Into::into);

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}
