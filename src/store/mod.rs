//! The artifact-store seam.
//!
//! The persistent store is an external collaborator; this module defines only
//! the operations the supervisor and worker consume from it, plus the
//! derivation model those operations exchange. [`dir::DirStore`] is the
//! directory-backed implementation used by the harness backend.

pub mod dir;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::error::Result;

/// A build recipe with named outputs, as stored in the artifact store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Derivation {
    pub name: String,
    /// Output name to store path. CA outputs have no static path.
    pub outputs: BTreeMap<String, Option<String>>,
    /// Input derivation path to the set of outputs consumed from it.
    #[serde(default)]
    pub input_drvs: BTreeMap<String, BTreeSet<String>>,
    pub platform: String,
    #[serde(default)]
    pub builder: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

impl Derivation {
    /// Name of the first output, by convention the primary one.
    pub fn first_output(&self) -> Option<&str> {
        self.outputs.keys().next().map(String::as_str)
    }
}

/// Result of asking the store what is missing for a set of targets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MissingInfo {
    /// Derivations that must be built, in reverse-topological order.
    pub will_build: Vec<String>,
    /// Output paths fetchable from a substituter.
    pub will_substitute: Vec<String>,
    /// Paths whose status could not be determined.
    pub unknown: Vec<String>,
}

impl MissingInfo {
    pub fn nothing_to_do(&self) -> bool {
        self.will_build.is_empty() && self.unknown.is_empty() && self.will_substitute.is_empty()
    }

    pub fn only_substitutes(&self) -> bool {
        self.will_build.is_empty() && self.unknown.is_empty() && !self.will_substitute.is_empty()
    }
}

/// Store operations consumed by the worker and the aggregate pass.
pub trait Store: Send + Sync {
    /// Read a derivation by its store path.
    fn read_derivation(&self, drv_path: &str) -> Result<Derivation>;

    /// Write a derivation, returning its content-addressed store path.
    fn write_derivation(&self, drv: &Derivation) -> Result<String>;

    /// Compute a fresh output path for `output` of `drv`.
    fn make_output_path(&self, output: &str, drv: &Derivation) -> Result<String>;

    /// Determine what is missing to realize the closure of `drv_path`:
    /// derivations to build, outputs to substitute, paths of unknown status.
    fn query_missing(&self, drv_path: &str) -> Result<MissingInfo>;

    /// Register a permanent GC root at `root` pointing to `store_path`.
    fn add_perm_root(&self, store_path: &str, root: &Path) -> Result<()>;

    /// Whether roots can be registered (a local filesystem store).
    fn is_local(&self) -> bool;
}
