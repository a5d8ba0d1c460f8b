//! Directory-backed store used by the harness backend.
//!
//! Derivations live as JSON files directly under `<root>/store`; the file
//! path doubles as the store path, so "is this path present" is a plain
//! filesystem check. Content addressing hashes the serialized derivation.
//! An optional `<root>/substitutable.json` array lists paths a substituter
//! could provide, which is what the cache-status classification consumes.

use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use super::{Derivation, MissingInfo, Store};
use crate::error::{NxjError, Result};

pub struct DirStore {
    store_dir: PathBuf,
    substitutable: BTreeSet<String>,
}

const DRV_EXTENSION: &str = ".drv";

fn content_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    // 16 bytes of hex is plenty for a harness store path.
    digest[..16].iter().map(|b| format!("{b:02x}")).collect()
}

impl DirStore {
    /// Open (creating if needed) the store under `root`.
    pub fn open(root: &Path) -> Result<Self> {
        let store_dir = root.join("store");
        std::fs::create_dir_all(&store_dir)?;

        let substitutable = match std::fs::read(root.join("substitutable.json")) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            store_dir,
            substitutable,
        })
    }

    fn serialize(drv: &Derivation) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(drv)?)
    }

    fn present(&self, path: &str) -> bool {
        Path::new(path).exists()
    }

    fn visit_missing(
        &self,
        drv_path: &str,
        seen: &mut BTreeSet<String>,
        info: &mut MissingInfo,
    ) -> Result<()> {
        if !seen.insert(drv_path.to_string()) {
            return Ok(());
        }
        let drv = match self.read_derivation(drv_path) {
            Ok(drv) => drv,
            Err(_) => {
                info.unknown.push(drv_path.to_string());
                return Ok(());
            }
        };

        let mut needs_build = false;
        for path in drv.outputs.values() {
            match path {
                Some(path) if self.present(path) => {}
                Some(path) if self.substitutable.contains(path) => {
                    info.will_substitute.push(path.clone());
                }
                Some(_) => needs_build = true,
                // CA output, path not known until built.
                None => info.unknown.push(drv_path.to_string()),
            }
        }

        if needs_build {
            // Dependencies first, so the build list comes out
            // reverse-topologically sorted.
            for input in drv.input_drvs.keys() {
                self.visit_missing(input, seen, info)?;
            }
            info.will_build.push(drv_path.to_string());
        }
        Ok(())
    }
}

impl Store for DirStore {
    fn read_derivation(&self, drv_path: &str) -> Result<Derivation> {
        let bytes = std::fs::read(drv_path)
            .map_err(|e| NxjError::Store(format!("cannot read derivation '{drv_path}': {e}")))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn write_derivation(&self, drv: &Derivation) -> Result<String> {
        let bytes = Self::serialize(drv)?;
        let path = self
            .store_dir
            .join(format!("{}-{}{DRV_EXTENSION}", content_hash(&bytes), drv.name));
        if !path.exists() {
            std::fs::write(&path, &bytes)?;
        }
        Ok(path.to_string_lossy().into_owned())
    }

    fn make_output_path(&self, output: &str, drv: &Derivation) -> Result<String> {
        // Hash the derivation with its output paths masked, the way a store
        // derives output paths from everything except the paths themselves.
        let mut masked = drv.clone();
        for path in masked.outputs.values_mut() {
            *path = None;
        }
        masked
            .environment
            .insert("outputName".into(), output.to_string());
        let bytes = Self::serialize(&masked)?;
        let suffix = if output == "out" {
            drv.name.clone()
        } else {
            format!("{}-{output}", drv.name)
        };
        Ok(self
            .store_dir
            .join(format!("{}-{suffix}", content_hash(&bytes)))
            .to_string_lossy()
            .into_owned())
    }

    fn query_missing(&self, drv_path: &str) -> Result<MissingInfo> {
        let mut info = MissingInfo::default();
        let mut seen = BTreeSet::new();
        self.visit_missing(drv_path, &mut seen, &mut info)?;
        info.will_substitute.sort();
        info.will_substitute.dedup();
        info.unknown.sort();
        info.unknown.dedup();
        Ok(info)
    }

    fn add_perm_root(&self, store_path: &str, root: &Path) -> Result<()> {
        // symlink_metadata so a dangling link still counts as registered
        if root.symlink_metadata().is_ok() {
            return Ok(());
        }
        if let Some(parent) = root.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::os::unix::fs::symlink(store_path, root)
            .map_err(|e| NxjError::Store(format!("cannot register root '{}': {e}", root.display())))
    }

    fn is_local(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn drv(name: &str) -> Derivation {
        Derivation {
            name: name.into(),
            platform: "x86_64-linux".into(),
            builder: "/bin/sh".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let dir = tempdir().unwrap();
        let store = DirStore::open(dir.path()).unwrap();

        let original = drv("hello");
        let path = store.write_derivation(&original).unwrap();
        assert!(path.ends_with(".drv"));
        assert!(path.contains("-hello"));

        let back = store.read_derivation(&path).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn test_write_is_content_addressed() {
        let dir = tempdir().unwrap();
        let store = DirStore::open(dir.path()).unwrap();

        let a = store.write_derivation(&drv("hello")).unwrap();
        let b = store.write_derivation(&drv("hello")).unwrap();
        assert_eq!(a, b);

        let mut changed = drv("hello");
        changed.environment.insert("x".into(), "1".into());
        let c = store.write_derivation(&changed).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_output_path_ignores_existing_output_paths() {
        let dir = tempdir().unwrap();
        let store = DirStore::open(dir.path()).unwrap();

        let mut a = drv("agg");
        a.outputs.insert("out".into(), None);
        let mut b = a.clone();
        b.outputs.insert("out".into(), Some("/elsewhere".into()));

        assert_eq!(
            store.make_output_path("out", &a).unwrap(),
            store.make_output_path("out", &b).unwrap()
        );
    }

    #[test]
    fn test_query_missing_classification() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("substitutable.json"), "[]").unwrap();
        let store = DirStore::open(dir.path()).unwrap();

        let mut hello = drv("hello");
        let out = dir.path().join("store").join("fake-hello-out");
        hello
            .outputs
            .insert("out".into(), Some(out.to_string_lossy().into_owned()));
        let drv_path = store.write_derivation(&hello).unwrap();

        // Output absent and not substitutable: the drv must be built.
        let info = store.query_missing(&drv_path).unwrap();
        assert_eq!(info.will_build, vec![drv_path.clone()]);

        // Once the output exists there is nothing to do.
        std::fs::write(&out, "").unwrap();
        let info = store.query_missing(&drv_path).unwrap();
        assert!(info.nothing_to_do());
    }

    #[test]
    fn test_query_missing_dependencies_come_first() {
        let dir = tempdir().unwrap();
        let store = DirStore::open(dir.path()).unwrap();

        let mut dep = drv("dep");
        dep.outputs.insert("out".into(), Some("/absent-dep".into()));
        let dep_path = store.write_derivation(&dep).unwrap();

        let mut top = drv("top");
        top.outputs.insert("out".into(), Some("/absent-top".into()));
        top.input_drvs
            .insert(dep_path.clone(), BTreeSet::from(["out".to_string()]));
        let top_path = store.write_derivation(&top).unwrap();

        let info = store.query_missing(&top_path).unwrap();
        assert_eq!(info.will_build, vec![dep_path, top_path]);
    }

    #[test]
    fn test_perm_root_symlink_idempotent() {
        let dir = tempdir().unwrap();
        let store = DirStore::open(dir.path()).unwrap();
        let drv_path = store.write_derivation(&drv("hello")).unwrap();

        let root = dir.path().join("roots").join("hello.drv");
        store.add_perm_root(&drv_path, &root).unwrap();
        assert!(root.is_symlink());
        // Registering again when the root exists is a no-op.
        store.add_perm_root(&drv_path, &root).unwrap();
    }
}
