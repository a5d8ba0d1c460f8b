//! The evaluator seam.
//!
//! The configuration-language interpreter is an external collaborator. The
//! worker consumes it through [`Evaluator`]: give it an attribute path, get
//! back a classified value. All returned data is owned; nothing borrows from
//! the interpreter across the process boundary.

pub mod fixture;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use crate::attr::AttrPath;

/// Evaluation settings shared by every backend, derived from the CLI.
#[derive(Debug, Clone, Default)]
#[allow(dead_code)] // the harness backend consumes a subset; the rest are for interpreter-backed evaluators
pub struct EvalOptions {
    pub release_expr: String,
    /// Interpret `release_expr` as an inline expression instead of a file.
    pub from_args: bool,
    /// Interpret `release_expr` as a flake reference.
    pub flake: bool,
    pub impure: bool,
    pub meta: bool,
    pub show_input_drvs: bool,
    pub constituents: bool,
    pub no_instantiate: bool,
    pub show_trace: bool,
    pub apply: Option<String>,
    pub select: Option<String>,
    pub reference_lock_file: Option<PathBuf>,
    pub override_inputs: Vec<(String, String)>,
}

/// A rendered, ANSI-filtered evaluation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalError(String);

impl EvalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(filter_ansi(&message.into()))
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for EvalError {}

/// What the evaluator found at a path.
#[derive(Debug, Clone)]
pub enum EvalValue {
    /// An attribute set that is a derivation.
    Derivation(Box<DrvInfo>),
    /// A plain attribute set with enumerable keys.
    Attrs(AttrsInfo),
    /// Anything else; cannot be built, cannot be recursed into.
    Other,
}

/// An attribute set seen by the traversal.
#[derive(Debug, Clone, Default)]
pub struct AttrsInfo {
    /// Immediate child keys in lexicographic order.
    pub keys: Vec<String>,
    /// Value of the `recurseForDerivations` attribute, if present.
    pub recurse_marker: Option<bool>,
}

/// Everything interpreter-side of a derivation's job record.
///
/// Store-side concerns (cache status, GC roots) are layered on by the worker.
#[derive(Debug, Clone, Default)]
pub struct DrvInfo {
    pub name: String,
    pub system: String,
    /// Absent under `--no-instantiate`.
    pub drv_path: Option<String>,
    pub outputs: BTreeMap<String, Option<String>>,
    pub input_drvs: Option<BTreeMap<String, BTreeSet<String>>>,
    pub meta: Option<serde_json::Value>,
    pub required_system_features: Option<Vec<String>>,
    /// Present when `--constituents` is set and the value carries the
    /// aggregate marker attribute.
    pub aggregate: Option<AggregateInfo>,
    /// Result of the `--apply` expression.
    pub extra_value: Option<serde_json::Value>,
}

/// Constituent references extracted from an aggregate derivation.
#[derive(Debug, Clone, Default)]
pub struct AggregateInfo {
    /// Constituent derivation paths already known at evaluation time.
    pub constituents: Vec<String>,
    /// Symbolic references to other jobs by dotted-path name.
    pub named_constituents: Vec<String>,
    /// Treat named references as glob patterns.
    pub glob_constituents: bool,
}

/// The opaque evaluation capability the worker drives.
pub trait Evaluator {
    /// Resolve and classify the value at `path` under the traversal root.
    fn resolve(&mut self, path: &AttrPath) -> Result<EvalValue, EvalError>;
}

/// Strip ANSI escape sequences from interpreter output.
pub fn filter_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\x1b' {
            if c == '\r' {
                continue;
            }
            out.push(c);
            continue;
        }
        // CSI sequence: ESC [ parameters final-byte
        if chars.peek() == Some(&'[') {
            chars.next();
            for c in chars.by_ref() {
                if ('\x40'..='\x7e').contains(&c) {
                    break;
                }
            }
        } else {
            // Two-character escape
            chars.next();
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_ansi_strips_color() {
        let input = "\x1b[31;1merror:\x1b[0m attribute \x1b[35mfoo\x1b[0m missing";
        assert_eq!(filter_ansi(input), "error: attribute foo missing");
    }

    #[test]
    fn test_filter_ansi_passes_plain_text() {
        assert_eq!(filter_ansi("nothing fancy"), "nothing fancy");
    }

    #[test]
    fn test_eval_error_is_filtered() {
        let err = EvalError::new("\x1b[31mboom\x1b[0m");
        assert_eq!(err.message(), "boom");
    }
}
