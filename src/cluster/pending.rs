//! Per-peer accumulation of invalidations waiting to be sent.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

/// Invalidations queued for one peer.
///
/// Maps a table to the hint ids to drop. An empty set means the whole table,
/// which absorbs any row-level hint queued for it before or after.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingInvalidations {
    tables: BTreeMap<String, BTreeSet<i64>>,
}

impl PendingInvalidations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one row hint unless the whole table is already queued.
    pub fn add_hint(&mut self, table: &str, hint: i64) {
        self.add_hints(table, std::iter::once(hint));
    }

    /// Queue row hints unless the whole table is already queued.
    pub fn add_hints(&mut self, table: &str, hints: impl IntoIterator<Item = i64>) {
        match self.tables.entry(table.to_string()) {
            Entry::Occupied(entry) if entry.get().is_empty() => {}
            Entry::Occupied(mut entry) => entry.get_mut().extend(hints),
            Entry::Vacant(entry) => {
                let hints: BTreeSet<i64> = hints.into_iter().collect();
                // An empty hint list must not turn into the whole-table marker.
                if !hints.is_empty() {
                    entry.insert(hints);
                }
            }
        }
    }

    /// Queue the whole table, discarding its queued row hints.
    pub fn add_table(&mut self, table: &str) {
        self.tables.insert(table.to_string(), BTreeSet::new());
    }

    /// Put back an entry taken by [`take`](Self::take): an empty set is a
    /// whole-table invalidation, anything else a set of row hints.
    pub fn merge(&mut self, table: &str, hints: BTreeSet<i64>) {
        if hints.is_empty() {
            self.add_table(table);
        } else {
            self.add_hints(table, hints);
        }
    }

    /// Swap the queued invalidations for an empty set.
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    /// Queued hints for a table. `Some` of an empty set means the whole table.
    pub fn get(&self, table: &str) -> Option<&BTreeSet<i64>> {
        self.tables.get(table)
    }

    pub fn is_table_pending(&self, table: &str) -> bool {
        self.get(table).map(BTreeSet::is_empty).unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Number of queued tables.
    pub fn len(&self) -> usize {
        self.tables.len()
    }
}

impl IntoIterator for PendingInvalidations {
    type Item = (String, BTreeSet<i64>);
    type IntoIter = std::collections::btree_map::IntoIter<String, BTreeSet<i64>>;

    fn into_iter(self) -> Self::IntoIter {
        self.tables.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hints_accumulate() {
        let mut pending = PendingInvalidations::new();
        pending.add_hint("users", 1);
        pending.add_hint("users", 2);
        pending.add_hint("users", 1);
        pending.add_hint("orders", 9);

        assert_eq!(pending.len(), 2);
        assert_eq!(pending.get("users"), Some(&BTreeSet::from([1, 2])));
        assert!(!pending.is_table_pending("users"));
    }

    #[test]
    fn test_table_sentinel_subsumes_hints() {
        let mut pending = PendingInvalidations::new();
        pending.add_hint("users", 1);
        pending.add_table("users");
        assert!(pending.is_table_pending("users"));

        pending.add_hint("users", 3);
        assert!(pending.is_table_pending("users"));
        assert_eq!(pending.get("users"), Some(&BTreeSet::new()));
    }

    #[test]
    fn test_empty_hint_list_is_not_a_table_invalidation() {
        let mut pending = PendingInvalidations::new();
        pending.add_hints("users", Vec::new());
        assert!(pending.is_empty());
    }

    #[test]
    fn test_take_and_merge() {
        let mut pending = PendingInvalidations::new();
        pending.add_hint("users", 1);
        pending.add_table("orders");

        let taken = pending.take();
        assert!(pending.is_empty());

        pending.add_hint("users", 5);
        for (table, hints) in taken {
            pending.merge(&table, hints);
        }

        assert_eq!(pending.get("users"), Some(&BTreeSet::from([1, 5])));
        assert!(pending.is_table_pending("orders"));
    }
}
