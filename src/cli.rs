//! Command-line interface definitions using clap.

use clap::Parser;
use std::ffi::OsString;
use std::path::PathBuf;

use crate::error::{NxjError, Result};
use crate::memory::MemorySize;

fn parse_memory(s: &str) -> std::result::Result<MemorySize, String> {
    s.parse()
}

/// nxj - stream derivation jobs from a nested expression as JSON lines
#[derive(Parser, Debug, Clone)]
#[command(name = "nxj")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Number of evaluation workers.
    #[arg(long, default_value_t = 1)]
    pub workers: usize,

    /// Maximum evaluation memory per worker in MiB (suffixes M/G accepted).
    #[arg(long, value_parser = parse_memory, default_value = "4096")]
    pub max_memory_size: MemorySize,

    /// Garbage collector roots directory.
    #[arg(long)]
    pub gc_roots_dir: Option<PathBuf>,

    /// Interpret the argument as a flake reference (optionally with a fragment).
    #[arg(long, conflicts_with = "expr")]
    pub flake: bool,

    /// Treat the argument as an inline expression.
    #[arg(long, short = 'E')]
    pub expr: bool,

    /// Allow impure evaluation.
    #[arg(long)]
    pub impure: bool,

    /// Force recursion (don't respect the recurseForDerivations marker).
    #[arg(long)]
    pub force_recurse: bool,

    /// Include derivation meta field in output.
    #[arg(long)]
    pub meta: bool,

    /// Check whether derivation outputs are present locally or substitutable,
    /// exposed in the `cacheStatus` field of the output.
    #[arg(long)]
    pub check_cache_status: bool,

    /// Show input derivations in the output for each derivation.
    #[arg(long)]
    pub show_input_drvs: bool,

    /// Print a stack trace in case of evaluation errors.
    #[arg(long)]
    pub show_trace: bool,

    /// Evaluate constituents for aggregate jobs and resolve them after
    /// traversal.
    #[arg(long)]
    pub constituents: bool,

    /// Apply a function to each derivation; the JSON result is stored under
    /// the `extraValue` key of the output.
    #[arg(long, value_name = "expr")]
    pub apply: Option<String>,

    /// Apply a function to the evaluation root before any traversal begins.
    #[arg(long, value_name = "expr")]
    pub select: Option<String>,

    /// Don't instantiate (write) derivations, only evaluate.
    #[arg(long)]
    pub no_instantiate: bool,

    /// Read the given lock file instead of `flake.lock` within the top-level
    /// flake.
    #[arg(long, value_name = "flake-lock-path")]
    pub reference_lock_file: Option<PathBuf>,

    /// Override a specific flake input (e.g. `dwarffs/nixpkgs=flake:nixpkgs`).
    #[arg(long, value_name = "input-path=flake-url")]
    pub override_input: Vec<String>,

    /// Log level: error, warn, info, debug, trace.
    #[arg(long, env = "NXJ_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log format: pretty, compact, json.
    #[arg(long, env = "NXJ_LOG_FORMAT")]
    pub log_format: Option<String>,

    /// Run as a worker subprocess (spawned by the supervisor).
    #[arg(long, hide = true)]
    pub internal_worker: bool,

    /// Use the directory-backed harness backend rooted at this path.
    #[arg(long, hide = true, value_name = "path")]
    pub fixture: Option<PathBuf>,

    /// Expression, file path, or flake reference to evaluate.
    #[arg(value_name = "expr")]
    pub release_expr: String,
}

impl Cli {
    /// Reject flag combinations the run could not honor.
    pub fn validate(&self) -> Result<()> {
        if self.release_expr.is_empty() {
            return Err(NxjError::Usage("no expression specified".into()));
        }
        if self.no_instantiate && self.check_cache_status {
            return Err(NxjError::Usage(
                "--no-instantiate cannot be combined with --check-cache-status".into(),
            ));
        }
        for pair in &self.override_input {
            if !pair.contains('=') {
                return Err(NxjError::Usage(format!(
                    "--override-input expects input-path=flake-url, got '{pair}'"
                )));
            }
        }
        Ok(())
    }

    /// Rebuild the argument vector for a worker subprocess.
    ///
    /// Everything evaluation-related is passed through; supervisor-only
    /// settings (worker count) are not.
    pub fn worker_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["--internal-worker".into()];
        args.push("--max-memory-size".into());
        args.push(self.max_memory_size.as_mib().to_string().into());
        if let Some(dir) = &self.gc_roots_dir {
            args.push("--gc-roots-dir".into());
            args.push(dir.into());
        }
        if self.flake {
            args.push("--flake".into());
        }
        if self.expr {
            args.push("--expr".into());
        }
        if self.impure {
            args.push("--impure".into());
        }
        if self.force_recurse {
            args.push("--force-recurse".into());
        }
        if self.meta {
            args.push("--meta".into());
        }
        if self.check_cache_status {
            args.push("--check-cache-status".into());
        }
        if self.show_input_drvs {
            args.push("--show-input-drvs".into());
        }
        if self.show_trace {
            args.push("--show-trace".into());
        }
        if self.constituents {
            args.push("--constituents".into());
        }
        if let Some(expr) = &self.apply {
            args.push("--apply".into());
            args.push(expr.into());
        }
        if let Some(expr) = &self.select {
            args.push("--select".into());
            args.push(expr.into());
        }
        if self.no_instantiate {
            args.push("--no-instantiate".into());
        }
        if let Some(path) = &self.reference_lock_file {
            args.push("--reference-lock-file".into());
            args.push(path.into());
        }
        for pair in &self.override_input {
            args.push("--override-input".into());
            args.push(pair.into());
        }
        if let Some(path) = &self.fixture {
            args.push("--fixture".into());
            args.push(path.into());
        }
        args.push("--".into());
        args.push(self.release_expr.clone().into());
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("nxj").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let cli = parse(&["./release.nix"]);
        assert_eq!(cli.workers, 1);
        assert_eq!(cli.max_memory_size, MemorySize::from_mib(4096));
        assert!(!cli.flake);
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_flake_conflicts_with_expr() {
        let result =
            Cli::try_parse_from(["nxj", "--flake", "--expr", "github:NixOS/nixpkgs#hello"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_no_instantiate_rejects_cache_status() {
        let cli = parse(&["--no-instantiate", "--check-cache-status", "x.nix"]);
        assert!(matches!(cli.validate(), Err(NxjError::Usage(_))));
    }

    #[test]
    fn test_override_input_wants_key_value() {
        let cli = parse(&["--override-input", "nixpkgs", "x.nix"]);
        assert!(cli.validate().is_err());

        let cli = parse(&["--override-input", "nixpkgs=flake:nixpkgs", "x.nix"]);
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_worker_args_roundtrip() {
        let cli = parse(&[
            "--workers",
            "4",
            "--max-memory-size",
            "2048",
            "--meta",
            "--constituents",
            "--expr",
            "{ a = 1; }",
        ]);
        let args = cli.worker_args();
        let rebuilt = Cli::try_parse_from(
            std::iter::once(OsString::from("nxj")).chain(args.into_iter()),
        )
        .unwrap();
        assert!(rebuilt.internal_worker);
        assert!(rebuilt.meta);
        assert!(rebuilt.constituents);
        assert!(rebuilt.expr);
        assert_eq!(rebuilt.max_memory_size, MemorySize::from_mib(2048));
        assert_eq!(rebuilt.release_expr, "{ a = 1; }");
        // Supervisor-only settings stay at their defaults in the worker.
        assert_eq!(rebuilt.workers, 1);
    }
}
