//! Attribute paths into the nested evaluation root.
//!
//! A path is an ordered list of attribute names. On the wire it travels as a
//! JSON array; for the `attr` field of emitted records it is joined with dots,
//! quoting any component that itself contains a dot so the two forms stay
//! round-trippable.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An ordered sequence of attribute names. The empty path is the root.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttrPath(Vec<String>);

impl AttrPath {
    /// The root path.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn new(components: Vec<String>) -> Self {
        Self(components)
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn components(&self) -> &[String] {
        &self.0
    }

    /// Extend with one more component, returning the child path.
    pub fn child(&self, name: &str) -> Self {
        let mut components = self.0.clone();
        components.push(name.to_string());
        Self(components)
    }

    /// Dotted string form, quoting components that contain a dot.
    pub fn joined(&self) -> String {
        self.0
            .iter()
            .map(|c| {
                if c.contains('.') {
                    format!("\"{c}\"")
                } else {
                    c.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(".")
    }
}

impl fmt::Display for AttrPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.joined())
    }
}

impl From<Vec<&str>> for AttrPath {
    fn from(components: Vec<&str>) -> Self {
        Self(components.into_iter().map(String::from).collect())
    }
}
