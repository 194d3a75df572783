//! Bounded row store with least-recently-used eviction.
//!
//! Entries live in a slab and are linked into a single recency list
//! (head = least recently used, tail = most recently used). Every entry is
//! also registered in exactly one per-table index so that dropping a table
//! touches only that table's rows.
//!
//! Handles ([`EntryId`]) carry a generation number: a handle to a removed
//! entry never aliases a newer entry that reused the same slot.
//!
//! The store does no locking; the owner serializes access.

use crate::types::CacheKey;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Stable handle to a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId {
    slot: u32,
    generation: u32,
}

/// A cached row: field values in the owning schema's column order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedRow {
    values: Vec<String>,
}

impl CachedRow {
    pub fn new(values: Vec<String>) -> Self {
        Self { values }
    }

    /// Value at a physical column index.
    pub fn get(&self, index: usize) -> Option<&str> {
        self.values.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Values at the given indexes, in the given order. Indexes past the end
    /// of the row yield empty strings.
    pub fn project(&self, indexes: &[usize]) -> Vec<String> {
        indexes
            .iter()
            .map(|&i| self.values.get(i).cloned().unwrap_or_default())
            .collect()
    }
}

struct Node {
    key: CacheKey,
    row: CachedRow,
    prev: Option<u32>,
    next: Option<u32>,
}

struct Slot {
    generation: u32,
    node: Option<Node>,
}

/// Fixed-capacity row cache keyed by `(table, hint)`.
pub struct RowCache {
    capacity: usize,
    slots: Vec<Slot>,
    free: Vec<u32>,
    head: Option<u32>,
    tail: Option<u32>,
    keys: HashMap<CacheKey, EntryId>,
    tables: HashMap<String, HashSet<EntryId>>,
}

impl RowCache {
    /// Create a cache holding at most `capacity` rows (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, u32::MAX as usize);
        Self {
            capacity,
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            keys: HashMap::new(),
            tables: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of cached rows.
    pub fn count(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Look up an entry without touching its recency.
    pub fn find(&self, key: &CacheKey) -> Option<EntryId> {
        self.keys.get(key).copied()
    }

    /// Row behind a handle, if the entry still exists.
    pub fn get(&self, id: EntryId) -> Option<&CachedRow> {
        self.node(id).map(|n| &n.row)
    }

    /// Find an entry, mark it most recently used and return its row.
    pub fn lookup(&mut self, key: &CacheKey) -> Option<&CachedRow> {
        let id = self.find(key)?;
        self.promote(id);
        self.get(id)
    }

    /// Insert a row. Returns `None` without touching anything if the key is
    /// already cached: the first writer wins.
    ///
    /// When the cache is full the least recently used entry is evicted first.
    pub fn insert(&mut self, key: CacheKey, row: CachedRow) -> Option<EntryId> {
        if self.keys.contains_key(&key) {
            return None;
        }

        while self.keys.len() >= self.capacity {
            match self.head {
                Some(lru) => {
                    let id = EntryId {
                        slot: lru,
                        generation: self.slots[lru as usize].generation,
                    };
                    self.remove(id);
                }
                None => break,
            }
        }

        let id = self.alloc(Node {
            key: key.clone(),
            row,
            prev: None,
            next: None,
        });
        self.link_back(id.slot);

        self.tables.entry(key.table.clone()).or_default().insert(id);
        self.keys.insert(key, id);
        Some(id)
    }

    /// Mark an entry as most recently used. Returns false for stale handles.
    pub fn promote(&mut self, id: EntryId) -> bool {
        if self.node(id).is_none() {
            return false;
        }
        if self.tail != Some(id.slot) {
            self.unlink(id.slot);
            self.link_back(id.slot);
        }
        true
    }

    /// Remove an entry by handle, returning its key and row.
    pub fn remove(&mut self, id: EntryId) -> Option<(CacheKey, CachedRow)> {
        self.node(id)?;
        self.unlink(id.slot);

        let slot = &mut self.slots[id.slot as usize];
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.slot);

        self.keys.remove(&node.key);
        if let Some(entries) = self.tables.get_mut(&node.key.table) {
            entries.remove(&id);
            if entries.is_empty() {
                self.tables.remove(&node.key.table);
            }
        }

        Some((node.key, node.row))
    }

    /// Remove an entry by key.
    pub fn remove_key(&mut self, key: &CacheKey) -> Option<CachedRow> {
        let id = self.find(key)?;
        self.remove(id).map(|(_, row)| row)
    }

    /// Remove every row of a table. Returns the number of rows removed.
    pub fn remove_table(&mut self, table: &str) -> usize {
        let entries = match self.tables.remove(table) {
            Some(entries) => entries,
            None => return 0,
        };

        let mut removed = 0;
        for id in entries {
            if self.remove(id).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Handles of all rows cached for a table.
    pub fn table_entries(&self, table: &str) -> Vec<EntryId> {
        self.tables
            .get(table)
            .map(|entries| entries.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of rows cached for a table.
    pub fn table_count(&self, table: &str) -> usize {
        self.tables.get(table).map(HashSet::len).unwrap_or(0)
    }

    /// Row counts of every table with cached rows.
    pub fn table_counts(&self) -> BTreeMap<String, u64> {
        self.tables
            .iter()
            .map(|(table, entries)| (table.clone(), entries.len() as u64))
            .collect()
    }

    // -- slab helpers --

    fn node(&self, id: EntryId) -> Option<&Node> {
        let slot = self.slots.get(id.slot as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_ref()
    }

    fn node_mut(&mut self, slot: u32) -> &mut Node {
        self.slots[slot as usize]
            .node
            .as_mut()
            .expect("linked slot must be occupied")
    }

    fn alloc(&mut self, node: Node) -> EntryId {
        if let Some(slot) = self.free.pop() {
            let entry = &mut self.slots[slot as usize];
            entry.node = Some(node);
            EntryId {
                slot,
                generation: entry.generation,
            }
        } else {
            // Bounded by capacity, which is clamped to u32::MAX.
            let slot = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                node: Some(node),
            });
            EntryId {
                slot,
                generation: 0,
            }
        }
    }

    fn unlink(&mut self, slot: u32) {
        let (prev, next) = {
            let node = self.node_mut(slot);
            let links = (node.prev, node.next);
            node.prev = None;
            node.next = None;
            links
        };

        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev = prev,
            None => self.tail = prev,
        }
    }

    fn link_back(&mut self, slot: u32) {
        let old_tail = self.tail;
        {
            let node = self.node_mut(slot);
            node.prev = old_tail;
            node.next = None;
        }
        match old_tail {
            Some(t) => self.node_mut(t).next = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
    }
}

impl std::fmt::Debug for RowCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowCache")
            .field("capacity", &self.capacity)
            .field("count", &self.count())
            .field("tables", &self.tables.len())
            .finish()
    }
}
