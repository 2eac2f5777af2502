//! Metadata store for CFG, block and instruction annotations
//!
//! Every scope carries an ordered `key -> list<string>` map. Passes write
//! their results here (namespaced by pass ID) so the writer can persist
//! them as metadata comments, and typed accessors in the optimiser read
//! them back without re-parsing.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Ordered `key -> list<string>` annotation map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    entries: BTreeMap<String, Vec<String>>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.entries.get(key).map(|v| v.as_slice())
    }

    /// Replace the value list for a key.
    pub fn set<I, S>(&mut self, key: impl Into<String>, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entries
            .insert(key.into(), values.into_iter().map(Into::into).collect());
    }

    /// Extend the value list for a key, creating it if absent.
    pub fn append<I, S>(&mut self, key: impl Into<String>, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entries
            .entry(key.into())
            .or_default()
            .extend(values.into_iter().map(Into::into));
    }

    pub fn remove(&mut self, key: &str) -> Option<Vec<String>> {
        self.entries.remove(key)
    }

    /// Drop every key beginning with `prefix` (used when a pass clears the
    /// annotations it owns).
    pub fn remove_prefixed(&mut self, prefix: &str) {
        self.entries.retain(|k, _| !k.starts_with(prefix));
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_append() {
        let mut meta = Metadata::new();
        meta.set("live/in", ["%a", "%b"]);
        meta.append("live/in", ["%c"]);
        assert_eq!(meta.get("live/in").unwrap(), &["%a", "%b", "%c"]);

        meta.set("live/in", ["%d"]);
        assert_eq!(meta.get("live/in").unwrap(), &["%d"]);
    }

    #[test]
    fn test_remove_prefixed() {
        let mut meta = Metadata::new();
        meta.set("domtree/idom", ["@A"]);
        meta.set("domtree/children", ["@B"]);
        meta.set("live/in", ["%a"]);
        meta.remove_prefixed("domtree/");
        assert!(meta.get("domtree/idom").is_none());
        assert!(meta.get("live/in").is_some());
    }
}
