//! Latest watch values, keyed by name

use std::collections::BTreeMap;

use crate::protocol::WatchValue;

/// Last-write-wins table of watch values
#[derive(Debug, Default, Clone)]
pub struct WatchTable {
    values: BTreeMap<String, WatchValue>,
    version: u64,
}

impl WatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a batch of updates.
    ///
    /// Key replacement rule: an incoming value replaces whatever is stored
    /// under the same name, regardless of timestamps; within the batch the
    /// later update wins. Names absent from the batch are left as they are.
    pub fn merge(&mut self, updates: impl IntoIterator<Item = WatchValue>) {
        let mut changed = false;
        for watch in updates {
            self.values.insert(watch.name.clone(), watch);
            changed = true;
        }
        if changed {
            self.version += 1;
        }
    }

    pub fn clear(&mut self) {
        self.values.clear();
        self.version += 1;
    }

    pub fn get(&self, name: &str) -> Option<&WatchValue> {
        self.values.get(name)
    }

    /// Values sorted by name
    pub fn iter(&self) -> impl Iterator<Item = &WatchValue> {
        self.values.values()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn watch(name: &str, value: serde_json::Value) -> WatchValue {
        WatchValue {
            name: name.to_string(),
            value,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_merge_replaces_by_name() {
        let mut table = WatchTable::new();
        table.merge(vec![watch("fps", json!(60)), watch("users", json!(3))]);
        table.merge(vec![watch("fps", json!(58))]);

        assert_eq!(table.len(), 2);
        assert_eq!(table.get("fps").unwrap().value, json!(58));
        assert_eq!(table.get("users").unwrap().value, json!(3));
        assert_eq!(table.version(), 2);
    }

    #[test]
    fn test_merge_ignores_timestamps() {
        let mut table = WatchTable::new();
        let mut older = watch("fps", json!(1));
        older.timestamp = Utc::now() - Duration::seconds(60);

        table.merge(vec![watch("fps", json!(2))]);
        table.merge(vec![older]);

        assert_eq!(table.get("fps").unwrap().value, json!(1));
    }

    #[test]
    fn test_empty_merge_is_not_a_change() {
        let mut table = WatchTable::new();
        table.merge(Vec::new());
        assert_eq!(table.version(), 0);
    }
}
