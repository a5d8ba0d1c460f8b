//! Assembly of the job record for a value classified as a derivation.
//!
//! The evaluator hands over everything interpreter-side ([`DrvInfo`]); this
//! layers on the store-side concerns: cache status and GC-root registration.

use std::path::Path;

use crate::attr::AttrPath;
use crate::error::Result;
use crate::eval::DrvInfo;
use crate::record::{CacheStatus, JobRecord};
use crate::store::Store;

use super::WorkerContext;

/// Sort key for `neededSubstitutes`: derivation name first, full path as the
/// tie breaker. Store paths end in `<hash>-<name>`.
fn substitute_sort_key(path: &str) -> (String, String) {
    let base = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match base.split_once('-') {
        Some((_, name)) => name.to_string(),
        None => base,
    };
    (name, path.to_string())
}

/// Build the record for a derivation found at `path`.
pub fn assemble(
    path: &AttrPath,
    info: DrvInfo,
    store: &dyn Store,
    ctx: &WorkerContext,
) -> Result<JobRecord> {
    let mut record = JobRecord::at(path);
    record.name = Some(info.name);
    record.system = Some(info.system);
    record.drv_path = info.drv_path.clone();
    record.outputs = Some(info.outputs);
    record.input_drvs = info.input_drvs;
    record.meta = info.meta;
    record.required_system_features = info.required_system_features;
    record.extra_value = info.extra_value;

    if let Some(aggregate) = info.aggregate {
        record.constituents = Some(aggregate.constituents);
        record.named_constituents = Some(aggregate.named_constituents);
        if aggregate.glob_constituents {
            record.glob_constituents = Some(true);
        }
    }

    if ctx.check_cache_status {
        if let Some(drv_path) = &info.drv_path {
            let mut missing = store.query_missing(drv_path)?;
            let status = if missing.nothing_to_do() {
                CacheStatus::Local
            } else if missing.only_substitutes() {
                CacheStatus::Cached
            } else {
                CacheStatus::NotBuilt
            };
            record.set_cache_status(status);
            missing
                .will_substitute
                .sort_by_key(|path| substitute_sort_key(path));
            record.needed_builds = Some(missing.will_build);
            record.needed_substitutes = Some(missing.will_substitute);
            if !missing.unknown.is_empty() {
                record.unknown_paths = Some(missing.unknown);
            }
        }
    }

    register_gc_root(&record, store, ctx)?;

    Ok(record)
}

/// Register the derivation as a GC root. This may re-register roots for jobs
/// already done; registration is skipped only when the root already exists.
fn register_gc_root(record: &JobRecord, store: &dyn Store, ctx: &WorkerContext) -> Result<()> {
    if ctx.no_instantiate || !store.is_local() {
        return Ok(());
    }
    let (Some(dir), Some(drv_path)) = (&ctx.gc_roots_dir, &record.drv_path) else {
        return Ok(());
    };
    if drv_path.is_empty() {
        return Ok(());
    }
    let Some(base) = Path::new(drv_path).file_name() else {
        return Ok(());
    };
    store.add_perm_root(drv_path, &dir.join(base))
}
