//! Post-traversal resolution of aggregate jobs.
//!
//! Records carrying `namedConstituents` reference other jobs by dotted-path
//! name (optionally as glob patterns). After all collectors join, the
//! references are resolved against the record map, the aggregates are
//! topologically sorted, and each one's derivation is rewritten to depend on
//! its constituents' derivations. Broken references turn into an `error`
//! field instead; a reference cycle fails every remaining aggregate.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use tracing::{debug, error, warn};

use crate::error::{NxjError, Result};
use crate::store::Store;
use crate::supervisor::output::OutputLock;

/// One aggregate with its resolved and broken references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateJob {
    pub name: String,
    /// Resolved constituent job names.
    pub dependencies: BTreeSet<String>,
    /// Reference to the reason it could not be resolved.
    pub broken: BTreeMap<String, String>,
}

type Jobs = BTreeMap<String, serde_json::Value>;

/// Resolve every record with a non-empty `namedConstituents` and sort the
/// result by dependency. A reference cycle is reported as
/// [`NxjError::DependencyCycle`].
pub fn resolve_named_constituents(jobs: &Jobs) -> Result<Vec<AggregateJob>> {
    let mut aggregates = Vec::new();

    for (job_name, job) in jobs {
        let Some(named) = job.get("namedConstituents").and_then(|v| v.as_array()) else {
            continue;
        };
        if named.is_empty() {
            continue;
        }
        let glob_constituents = job
            .get("globConstituents")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let mut dependencies = BTreeSet::new();
        let mut broken = BTreeMap::new();

        fn check_broken(
            broken: &mut BTreeMap<String, String>,
            job_name: &str,
            child_name: &str,
            child: &serde_json::Value,
        ) -> bool {
            if let Some(err) = child.get("error").and_then(|e| e.as_str()) {
                error!(
                    "aggregate job '{job_name}' references broken job '{child_name}': {err}"
                );
                broken.insert(child_name.to_string(), err.to_string());
                return true;
            }
            false
        }

        for child_name in named.iter().filter_map(|v| v.as_str()) {
            match jobs.get(child_name) {
                Some(child) => {
                    if !check_broken(&mut broken, job_name, child_name, child) {
                        dependencies.insert(child_name.to_string());
                    }
                }
                None if glob_constituents => {
                    let mut matched = false;
                    if let Ok(pattern) = glob::Pattern::new(child_name) {
                        for (candidate, job) in jobs {
                            // Never select the aggregate itself; trivial way
                            // to avoid the obvious cycle.
                            if candidate == job_name {
                                continue;
                            }
                            if pattern.matches(candidate)
                                && !check_broken(&mut broken, job_name, candidate, job)
                            {
                                dependencies.insert(candidate.clone());
                                matched = true;
                            }
                        }
                    }
                    if !matched {
                        warn!(
                            "aggregate job '{job_name}' references constituent glob \
                             pattern '{child_name}' with no matches"
                        );
                        broken.insert(
                            child_name.to_string(),
                            "constituent glob pattern had no matches".to_string(),
                        );
                    }
                }
                None => {
                    error!("aggregate job '{job_name}' references non-existent job '{child_name}'");
                    broken.insert(child_name.to_string(), "does not exist".to_string());
                }
            }
        }

        aggregates.push(AggregateJob {
            name: job_name.clone(),
            dependencies,
            broken,
        });
    }

    topo_sort(aggregates)
}

/// Depth-first topological sort over the aggregate set, dependencies first.
fn topo_sort(items: Vec<AggregateJob>) -> Result<Vec<AggregateJob>> {
    let mut by_name: HashMap<String, AggregateJob> = items
        .into_iter()
        .map(|item| (item.name.clone(), item))
        .collect();
    let names: Vec<String> = by_name.keys().cloned().collect();

    let mut sorted = Vec::new();
    let mut visited = BTreeSet::new();
    let mut parents = BTreeSet::new();

    fn visit(
        name: &str,
        parent: Option<&str>,
        by_name: &mut HashMap<String, AggregateJob>,
        sorted: &mut Vec<AggregateJob>,
        visited: &mut BTreeSet<String>,
        parents: &mut BTreeSet<String>,
    ) -> Result<()> {
        if parents.contains(name) {
            let parent = parent.unwrap_or_default().to_string();
            by_name.remove(name);
            by_name.remove(&parent);
            return Err(NxjError::DependencyCycle {
                a: name.to_string(),
                b: parent,
                remaining: by_name.keys().cloned().collect(),
            });
        }
        if !visited.insert(name.to_string()) {
            return Ok(());
        }
        parents.insert(name.to_string());

        let references = by_name
            .get(name)
            .map(|item| item.dependencies.clone())
            .unwrap_or_default();
        for reference in &references {
            // Only traverse into references that are themselves aggregates.
            if reference != name && by_name.contains_key(reference) {
                visit(reference, Some(name), by_name, sorted, visited, parents)?;
            }
        }

        if let Some(item) = by_name.get(name) {
            sorted.push(item.clone());
        }
        parents.remove(name);
        Ok(())
    }

    for name in names {
        visit(
            &name,
            None,
            &mut by_name,
            &mut sorted,
            &mut visited,
            &mut parents,
        )?;
    }
    Ok(sorted)
}

/// Rewrite each aggregate's derivation and emit its final record.
pub fn rewrite_aggregates(
    jobs: &mut Jobs,
    aggregates: Vec<AggregateJob>,
    store: &dyn Store,
    gc_roots_dir: Option<&Path>,
    out: &OutputLock,
) -> Result<()> {
    for aggregate in aggregates {
        let job = jobs
            .get_mut(&aggregate.name)
            .expect("aggregate resolved from the job map");

        if aggregate.broken.is_empty() {
            let drv_path = job
                .get("drvPath")
                .and_then(|p| p.as_str())
                .ok_or_else(|| {
                    NxjError::Store(format!(
                        "aggregate job '{}' has no derivation path",
                        aggregate.name
                    ))
                })?
                .to_string();
            let mut drv = store.read_derivation(&drv_path)?;

            // Wire every constituent in as an input derivation.
            let mut constituents = Vec::new();
            for child_name in &aggregate.dependencies {
                let child_drv_path = jobs_child_drv_path(jobs, child_name)?;
                let child_drv = store.read_derivation(&child_drv_path)?;
                constituents.push(child_drv_path.clone());
                let output = child_drv.first_output().unwrap_or("out").to_string();
                drv.input_drvs
                    .insert(child_drv_path, BTreeSet::from([output]));
            }

            let job = jobs
                .get_mut(&aggregate.name)
                .expect("aggregate resolved from the job map");
            let slot = job
                .as_object_mut()
                .expect("records are objects")
                .entry("constituents".to_string())
                .or_insert_with(|| serde_json::Value::Array(Vec::new()));
            if let Some(array) = slot.as_array_mut() {
                array.extend(constituents.iter().cloned().map(serde_json::Value::from));
            }

            // Re-derive the output path now that the inputs changed, and
            // write the rewritten derivation back.
            let out_path = store.make_output_path("out", &drv)?;
            drv.environment.insert("out".into(), out_path.clone());
            drv.outputs.insert("out".into(), Some(out_path.clone()));
            let new_drv_path = store.write_derivation(&drv)?;

            if let Some(dir) = gc_roots_dir {
                if let Some(base) = Path::new(&new_drv_path).file_name() {
                    store.add_perm_root(&new_drv_path, &dir.join(base))?;
                }
            }

            debug!("rewrote aggregate derivation {drv_path} -> {new_drv_path}");

            job["drvPath"] = serde_json::Value::from(new_drv_path);
            job["outputs"]["out"] = serde_json::Value::from(out_path);
        }

        let job = jobs
            .get_mut(&aggregate.name)
            .expect("aggregate resolved from the job map");
        job.as_object_mut()
            .expect("records are objects")
            .remove("namedConstituents");

        if !aggregate.broken.is_empty() {
            let mut message = String::new();
            for (child_name, reason) in &aggregate.broken {
                message.push_str(&format!("{child_name}: {reason}\n"));
            }
            job["error"] = serde_json::Value::from(message);
        }

        out.emit(job)?;
    }
    Ok(())
}

fn jobs_child_drv_path(jobs: &Jobs, child_name: &str) -> Result<String> {
    jobs.get(child_name)
        .and_then(|child| child.get("drvPath"))
        .and_then(|p| p.as_str())
        .map(String::from)
        .ok_or_else(|| {
            NxjError::Store(format!("constituent '{child_name}' has no derivation path"))
        })
}

/// Emit every aggregate with the cycle recorded as its error.
pub fn emit_cycle_errors(
    jobs: &mut Jobs,
    a: &str,
    b: &str,
    remaining: &BTreeSet<String>,
    out: &OutputLock,
) -> Result<()> {
    let message = format!("Dependency cycle: {a} <-> {b}");
    error!("{message}");
    let mut names: BTreeSet<String> = remaining.clone();
    names.insert(a.to_string());
    names.insert(b.to_string());
    for name in names {
        if let Some(job) = jobs.get_mut(&name) {
            job["error"] = serde_json::Value::from(message.clone());
            out.emit(job)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::dir::DirStore;
    use crate::store::Derivation;
    use std::io::Write;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn lines(&self) -> Vec<serde_json::Value> {
            let bytes = self.0.lock().unwrap().clone();
            String::from_utf8(bytes)
                .unwrap()
                .lines()
                .map(|l| serde_json::from_str(l).unwrap())
                .collect()
        }
    }

    fn leaf(attr: &str, drv_path: &str) -> serde_json::Value {
        serde_json::json!({
            "attr": attr, "attrPath": [attr], "name": attr,
            "system": "x86_64-linux", "drvPath": drv_path,
            "outputs": {"out": format!("/s/out-{attr}")},
        })
    }

    fn aggregate(attr: &str, drv_path: &str, named: &[&str]) -> serde_json::Value {
        let mut value = leaf(attr, drv_path);
        value["namedConstituents"] = serde_json::json!(named);
        value
    }

    #[test]
    fn test_resolve_exact_references() {
        let jobs = Jobs::from([
            ("a".to_string(), leaf("a", "/s/a.drv")),
            ("b".to_string(), leaf("b", "/s/b.drv")),
            ("agg".to_string(), aggregate("agg", "/s/agg.drv", &["a", "b"])),
        ]);

        let sorted = resolve_named_constituents(&jobs).unwrap();
        assert_eq!(sorted.len(), 1);
        assert_eq!(sorted[0].name, "agg");
        assert_eq!(
            sorted[0].dependencies,
            BTreeSet::from(["a".to_string(), "b".to_string()])
        );
        assert!(sorted[0].broken.is_empty());
    }

    #[test]
    fn test_resolve_missing_reference_is_broken() {
        let jobs = Jobs::from([(
            "agg".to_string(),
            aggregate("agg", "/s/agg.drv", &["ghost"]),
        )]);

        let sorted = resolve_named_constituents(&jobs).unwrap();
        assert_eq!(sorted[0].broken["ghost"], "does not exist");
    }

    #[test]
    fn test_resolve_broken_child_reference() {
        let mut broken_leaf = leaf("a", "/s/a.drv");
        broken_leaf["error"] = serde_json::json!("eval exploded");
        let jobs = Jobs::from([
            ("a".to_string(), broken_leaf),
            ("agg".to_string(), aggregate("agg", "/s/agg.drv", &["a"])),
        ]);

        let sorted = resolve_named_constituents(&jobs).unwrap();
        assert_eq!(sorted[0].broken["a"], "eval exploded");
        assert!(sorted[0].dependencies.is_empty());
    }

    #[test]
    fn test_resolve_glob_references() {
        let jobs = Jobs::from([
            ("pkgs.a".to_string(), leaf("pkgs.a", "/s/a.drv")),
            ("pkgs.b".to_string(), leaf("pkgs.b", "/s/b.drv")),
            ("other".to_string(), leaf("other", "/s/o.drv")),
            ("agg".to_string(), {
                let mut agg = aggregate("agg", "/s/agg.drv", &["pkgs.*"]);
                agg["globConstituents"] = serde_json::json!(true);
                agg
            }),
        ]);

        let sorted = resolve_named_constituents(&jobs).unwrap();
        assert_eq!(
            sorted[0].dependencies,
            BTreeSet::from(["pkgs.a".to_string(), "pkgs.b".to_string()])
        );
    }

    #[test]
    fn test_glob_with_no_matches_is_broken() {
        let jobs = Jobs::from([("agg".to_string(), {
            let mut agg = aggregate("agg", "/s/agg.drv", &["nothing.*"]);
            agg["globConstituents"] = serde_json::json!(true);
            agg
        })]);

        let sorted = resolve_named_constituents(&jobs).unwrap();
        assert_eq!(
            sorted[0].broken["nothing.*"],
            "constituent glob pattern had no matches"
        );
    }

    #[test]
    fn test_aggregates_sorted_by_dependency() {
        let jobs = Jobs::from([
            ("inner".to_string(), aggregate("inner", "/s/i.drv", &["leaf"])),
            ("leaf".to_string(), leaf("leaf", "/s/l.drv")),
            ("outer".to_string(), aggregate("outer", "/s/o.drv", &["inner"])),
        ]);

        let sorted = resolve_named_constituents(&jobs).unwrap();
        let names: Vec<_> = sorted.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, ["inner", "outer"]);
    }

    #[test]
    fn test_cycle_detected() {
        let jobs = Jobs::from([
            ("x".to_string(), aggregate("x", "/s/x.drv", &["y"])),
            ("y".to_string(), aggregate("y", "/s/y.drv", &["x"])),
            ("z".to_string(), aggregate("z", "/s/z.drv", &["x"])),
        ]);

        match resolve_named_constituents(&jobs) {
            Err(NxjError::DependencyCycle { a, b, remaining }) => {
                assert!(["x", "y"].contains(&a.as_str()));
                assert!(["x", "y"].contains(&b.as_str()));
                assert_ne!(a, b);
                assert_eq!(remaining, BTreeSet::from(["z".to_string()]));
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_rewrite_wires_constituents() {
        let dir = tempdir().unwrap();
        let store = DirStore::open(dir.path()).unwrap();

        let child_a = store
            .write_derivation(&Derivation {
                name: "a".into(),
                platform: "x86_64-linux".into(),
                outputs: BTreeMap::from([("out".to_string(), Some("/s/out-a".to_string()))]),
                ..Default::default()
            })
            .unwrap();
        let child_b = store
            .write_derivation(&Derivation {
                name: "b".into(),
                platform: "x86_64-linux".into(),
                outputs: BTreeMap::from([("out".to_string(), Some("/s/out-b".to_string()))]),
                ..Default::default()
            })
            .unwrap();
        let agg_drv_path = store
            .write_derivation(&Derivation {
                name: "agg".into(),
                platform: "x86_64-linux".into(),
                outputs: BTreeMap::from([("out".to_string(), None)]),
                ..Default::default()
            })
            .unwrap();

        let mut jobs = Jobs::from([
            ("a".to_string(), leaf("a", &child_a)),
            ("b".to_string(), leaf("b", &child_b)),
            ("agg".to_string(), aggregate("agg", &agg_drv_path, &["a", "b"])),
        ]);

        let sorted = resolve_named_constituents(&jobs).unwrap();
        let buf = SharedBuf::default();
        let out = OutputLock::new(buf.clone());
        rewrite_aggregates(&mut jobs, sorted, &store, None, &out).unwrap();

        let lines = buf.lines();
        assert_eq!(lines.len(), 1);
        let emitted = &lines[0];
        assert_eq!(emitted["attr"], "agg");
        assert!(emitted.get("namedConstituents").is_none());
        let constituents = emitted["constituents"].as_array().unwrap();
        assert_eq!(constituents.len(), 2);
        assert!(constituents.contains(&serde_json::Value::from(child_a.clone())));
        assert!(constituents.contains(&serde_json::Value::from(child_b.clone())));

        // The derivation was rewritten: fresh path, inputs added.
        let new_drv_path = emitted["drvPath"].as_str().unwrap();
        assert_ne!(new_drv_path, agg_drv_path);
        let rewritten = store.read_derivation(new_drv_path).unwrap();
        assert!(rewritten.input_drvs.contains_key(&child_a));
        assert!(rewritten.input_drvs.contains_key(&child_b));
        assert_eq!(
            rewritten.outputs["out"].as_deref(),
            emitted["outputs"]["out"].as_str()
        );
    }

    #[test]
    fn test_broken_aggregate_gets_error_not_rewrite() {
        let dir = tempdir().unwrap();
        let store = DirStore::open(dir.path()).unwrap();

        let mut jobs = Jobs::from([(
            "agg".to_string(),
            aggregate("agg", "/s/agg.drv", &["ghost"]),
        )]);

        let sorted = resolve_named_constituents(&jobs).unwrap();
        let buf = SharedBuf::default();
        let out = OutputLock::new(buf.clone());
        rewrite_aggregates(&mut jobs, sorted, &store, None, &out).unwrap();

        let lines = buf.lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["error"], "ghost: does not exist\n");
        assert!(lines[0].get("namedConstituents").is_none());
        // Untouched derivation path.
        assert_eq!(lines[0]["drvPath"], "/s/agg.drv");
    }

    #[test]
    fn test_cycle_errors_emitted_for_all() {
        let mut jobs = Jobs::from([
            ("x".to_string(), aggregate("x", "/s/x.drv", &["y"])),
            ("y".to_string(), aggregate("y", "/s/y.drv", &["x"])),
            ("z".to_string(), aggregate("z", "/s/z.drv", &["x"])),
        ]);

        let buf = SharedBuf::default();
        let out = OutputLock::new(buf.clone());
        emit_cycle_errors(&mut jobs, "x", "y", &BTreeSet::from(["z".to_string()]), &out).unwrap();

        let lines = buf.lines();
        assert_eq!(lines.len(), 3);
        for line in &lines {
            let err = line["error"].as_str().unwrap();
            assert!(err.contains("Dependency cycle: x <-> y"));
        }
    }
}
