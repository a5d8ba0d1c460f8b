//! Directory-backed harness backend.
//!
//! A fixture directory holds `root.json` (the value tree) and a
//! [`DirStore`](crate::store::dir::DirStore) under `store/`. The tree is a
//! nested description of attribute sets, derivations, opaque values, and
//! nodes that fail evaluation, which is exactly the surface the traversal
//! distinguishes. Derivations are instantiated into the store on first
//! resolution so the aggregate pass can read them back like any other
//! store client.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::Path;

use super::{
    AggregateInfo, AttrsInfo, DrvInfo, EvalError, EvalOptions, EvalValue, Evaluator,
};
use crate::attr::AttrPath;
use crate::store::dir::DirStore;
use crate::store::{Derivation, Store};

/// One node of the fixture tree.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Node {
    Attrs {
        #[serde(default)]
        recurse: Option<bool>,
        #[serde(default)]
        entries: BTreeMap<String, Node>,
    },
    Drv(Box<DrvNode>),
    Error {
        message: String,
    },
    Opaque,
}

#[derive(Debug, Clone, Deserialize)]
struct DrvNode {
    name: String,
    system: String,
    /// Output name to explicit store path; `null` asks the store to derive
    /// one. Defaults to a single derived `out`.
    #[serde(default)]
    outputs: Option<BTreeMap<String, Option<String>>>,
    /// Content-addressed: output paths stay unknown until built.
    #[serde(default)]
    ca: bool,
    /// Content-addressed, but the evaluator has CA derivations disabled:
    /// the static-output-path query fails outright instead of falling back.
    #[serde(default)]
    ca_unsupported: bool,
    /// Dotted paths of other fixture derivations this one depends on.
    #[serde(default)]
    inputs: Vec<String>,
    #[serde(default)]
    meta: Option<serde_json::Value>,
    /// Surfaced as `extraValue` when `--apply` is in effect.
    #[serde(default)]
    extra: Option<serde_json::Value>,
    #[serde(default)]
    required_system_features: Option<Vec<String>>,
    #[serde(default)]
    aggregate: Option<AggregateNode>,
}

#[derive(Debug, Clone, Deserialize)]
struct AggregateNode {
    #[serde(default)]
    named: Vec<String>,
    #[serde(default)]
    constituents: Vec<String>,
    #[serde(default)]
    globs: bool,
}

pub struct FixtureEvaluator {
    root: Node,
    store: DirStore,
    opts: EvalOptions,
}

impl FixtureEvaluator {
    /// Load the tree under `dir` and apply `--select` if configured.
    pub fn open(dir: &Path, opts: EvalOptions) -> Result<Self, EvalError> {
        let bytes = std::fs::read(dir.join("root.json"))
            .map_err(|e| EvalError::new(format!("cannot read fixture root: {e}")))?;
        let mut root: Node = serde_json::from_slice(&bytes)
            .map_err(|e| EvalError::new(format!("invalid fixture root: {e}")))?;

        let store = DirStore::open(dir)
            .map_err(|e| EvalError::new(format!("cannot open fixture store: {e}")))?;

        if let Some(select) = &opts.select {
            let path = AttrPath::new(select.split('.').map(String::from).collect());
            root = lookup(&root, &path)?.clone();
            if !matches!(root, Node::Attrs { .. }) {
                return Err(EvalError::new(format!(
                    "select expression '{select}' did not produce an attribute set"
                )));
            }
        }

        Ok(Self { root, store, opts })
    }

    fn instantiate(&self, node: &DrvNode, path: &AttrPath) -> Result<Derivation, EvalError> {
        let mut drv = Derivation {
            name: node.name.clone(),
            platform: node.system.clone(),
            builder: "/bin/sh".into(),
            ..Default::default()
        };
        drv.environment.insert("name".into(), node.name.clone());
        drv.environment.insert("system".into(), node.system.clone());

        for input in &node.inputs {
            let input_path = AttrPath::new(input.split('.').map(String::from).collect());
            let input_node = lookup(&self.root, &input_path)?;
            let Node::Drv(input_drv) = input_node else {
                return Err(EvalError::new(format!(
                    "input '{input}' of derivation '{}' is not a derivation",
                    path.joined()
                )));
            };
            let input_drv = self.instantiate(input_drv, &input_path)?;
            let input_drv_path = self
                .store
                .write_derivation(&input_drv)
                .map_err(|e| EvalError::new(e.to_string()))?;
            let output = input_drv.first_output().unwrap_or("out").to_string();
            drv.input_drvs
                .insert(input_drv_path, BTreeSet::from([output]));
        }

        // CA outputs have no static path; the query is retried without
        // requiring instantiation. When CA derivations are disabled that
        // retry is unavailable and the failure surfaces.
        if node.ca && node.ca_unsupported {
            return Err(EvalError::new(format!(
                "derivation '{}' does not have valid outputs: \
                 content-addressed derivations are not enabled",
                path.joined()
            )));
        }

        let declared = node.outputs.clone().unwrap_or_else(|| {
            let mut outputs = BTreeMap::new();
            outputs.insert("out".to_string(), None);
            outputs
        });
        for name in declared.keys() {
            drv.outputs.insert(name.clone(), None);
        }
        for (name, explicit) in declared {
            let value = if node.ca {
                None
            } else {
                match explicit {
                    Some(path) => Some(path),
                    None => Some(
                        self.store
                            .make_output_path(&name, &drv)
                            .map_err(|e| EvalError::new(e.to_string()))?,
                    ),
                }
            };
            drv.outputs.insert(name, value);
        }
        Ok(drv)
    }

    fn drv_info(&self, node: &DrvNode, path: &AttrPath) -> Result<DrvInfo, EvalError> {
        let drv = self.instantiate(node, path)?;

        let drv_path = if self.opts.no_instantiate {
            None
        } else {
            Some(
                self.store
                    .write_derivation(&drv)
                    .map_err(|e| EvalError::new(e.to_string()))?,
            )
        };

        let input_drvs = (self.opts.show_input_drvs && !self.opts.no_instantiate)
            .then(|| drv.input_drvs.clone());

        let aggregate = match (&node.aggregate, self.opts.constituents) {
            (Some(agg), true) => Some(AggregateInfo {
                constituents: agg.constituents.clone(),
                named_constituents: agg.named.clone(),
                glob_constituents: agg.globs,
            }),
            _ => None,
        };

        Ok(DrvInfo {
            name: node.name.clone(),
            system: node.system.clone(),
            drv_path,
            outputs: drv.outputs,
            input_drvs,
            meta: self.opts.meta.then(|| node.meta.clone()).flatten(),
            required_system_features: node.required_system_features.clone(),
            aggregate,
            extra_value: self
                .opts
                .apply
                .is_some()
                .then(|| node.extra.clone())
                .flatten(),
        })
    }
}

/// Walk the tree by path components.
fn lookup<'a>(root: &'a Node, path: &AttrPath) -> Result<&'a Node, EvalError> {
    let mut node = root;
    for (depth, component) in path.components().iter().enumerate() {
        match node {
            Node::Attrs { entries, .. } => match entries.get(component) {
                Some(child) => node = child,
                None => {
                    return Err(EvalError::new(format!(
                        "attribute '{}' missing",
                        AttrPath::new(path.components()[..=depth].to_vec()).joined()
                    )))
                }
            },
            _ => {
                return Err(EvalError::new(format!(
                    "attribute '{}' is not an attribute set",
                    AttrPath::new(path.components()[..depth].to_vec()).joined()
                )))
            }
        }
    }
    Ok(node)
}

impl Evaluator for FixtureEvaluator {
    fn resolve(&mut self, path: &AttrPath) -> Result<EvalValue, EvalError> {
        match lookup(&self.root, path)? {
            Node::Attrs { recurse, entries } => Ok(EvalValue::Attrs(AttrsInfo {
                keys: entries.keys().cloned().collect(),
                recurse_marker: *recurse,
            })),
            Node::Drv(node) => {
                let node = node.clone();
                Ok(EvalValue::Derivation(Box::new(
                    self.drv_info(&node, path)?,
                )))
            }
            Node::Error { message } => Err(EvalError::new(message.clone())),
            Node::Opaque => Ok(EvalValue::Other),
        }
    }
}
