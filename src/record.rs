//! JSON shapes emitted on stdout and exchanged with workers.
//!
//! A worker reply is one of:
//! - a job record: a leaf derivation was found at the path,
//! - a children reply: `attrs` enumerates the keys to recurse into,
//! - an error reply: `error` carries the rendered evaluation failure.
//!
//! The collector decides which case it has by field presence, so the reply
//! side is kept as plain JSON objects while the worker assembles records
//! through the typed [`JobRecord`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::attr::AttrPath;

/// Build/substitute status of a derivation's outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CacheStatus {
    /// Nothing to build, nothing to substitute.
    Local,
    /// Nothing to build, outputs fetchable from a substituter.
    Cached,
    /// Something must be built, or status is unknown.
    NotBuilt,
}

/// One emitted line of the output stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub attr: String,
    pub attr_path: AttrPath,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drv_path: Option<String>,
    /// Output name to store path. CA derivations have `null` paths.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<BTreeMap<String, Option<String>>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_drvs: Option<BTreeMap<String, BTreeSet<String>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_status: Option<CacheStatus>,
    /// Deprecated mirror of `cacheStatus`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_cached: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub needed_builds: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub needed_substitutes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unknown_paths: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_system_features: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub constituents: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub named_constituents: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub glob_constituents: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_value: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobRecord {
    /// An empty record addressed at `path`.
    pub fn at(path: &AttrPath) -> Self {
        Self {
            attr: path.joined(),
            attr_path: path.clone(),
            ..Default::default()
        }
    }

    pub fn set_cache_status(&mut self, status: CacheStatus) {
        self.is_cached = Some(matches!(status, CacheStatus::Cached | CacheStatus::Local));
        self.cache_status = Some(status);
    }
}

/// Reply enumerating the immediate children of an attribute set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildrenReply {
    pub attr: String,
    #[serde(rename = "attrPath")]
    pub attr_path: AttrPath,
    pub attrs: Vec<String>,
}

impl ChildrenReply {
    pub fn new(path: &AttrPath, attrs: Vec<String>) -> Self {
        Self {
            attr: path.joined(),
            attr_path: path.clone(),
            attrs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_skips_absent_fields() {
        let record = JobRecord::at(&AttrPath::from(vec!["a"]));
        let json = serde_json::to_value(&record).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), 2);
        assert_eq!(obj["attr"], "a");
        assert_eq!(obj["attrPath"], serde_json::json!(["a"]));
    }

    #[test]
    fn test_cache_status_names() {
        let mut record = JobRecord::at(&AttrPath::root());
        record.set_cache_status(CacheStatus::NotBuilt);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["cacheStatus"], "notBuilt");
        assert_eq!(json["isCached"], false);

        record.set_cache_status(CacheStatus::Local);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["cacheStatus"], "local");
        assert_eq!(json["isCached"], true);
    }

    #[test]
    fn test_children_reply_shape() {
        let reply = ChildrenReply::new(&AttrPath::from(vec!["a.b"]), vec!["x".into()]);
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["attr"], "\"a.b\"");
        assert_eq!(json["attrPath"], serde_json::json!(["a.b"]));
        assert_eq!(json["attrs"], serde_json::json!(["x"]));
    }
}
