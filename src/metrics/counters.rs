//! Monotonic counters.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    value: AtomicU64,
}

impl Counter {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            value: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A counter split by one label value, e.g. per peer endpoint.
#[derive(Debug)]
pub struct LabeledCounter {
    name: &'static str,
    label: &'static str,
    values: RwLock<HashMap<String, AtomicU64>>,
}

impl LabeledCounter {
    pub fn new(name: &'static str, label: &'static str) -> Self {
        Self {
            name,
            label,
            values: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Name of the label the counter is split by.
    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn inc_by(&self, value: &str, n: u64) {
        if let Some(counter) = self.values.read().get(value) {
            counter.fetch_add(n, Ordering::Relaxed);
            return;
        }

        self.values
            .write()
            .entry(value.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, value: &str) -> u64 {
        self.values
            .read()
            .get(value)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Forget a label value, e.g. when a peer leaves the roster.
    pub fn remove(&self, value: &str) {
        self.values.write().remove(value);
    }

    pub fn get_all(&self) -> Vec<(String, u64)> {
        let mut all: Vec<_> = self
            .values
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();
        all.sort();
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new("fetch_total");
        assert_eq!(counter.get(), 0);

        counter.inc();
        counter.inc_by(4);
        assert_eq!(counter.get(), 5);
        assert_eq!(counter.name(), "fetch_total");
    }

    #[test]
    fn test_labeled_counter() {
        let counter = LabeledCounter::new("requeued_total", "peer");

        counter.inc_by("10.0.0.2:13799", 2);
        counter.inc_by("10.0.0.2:13799", 1);
        counter.inc_by("10.0.0.3:13799", 1);

        assert_eq!(counter.get("10.0.0.2:13799"), 3);
        assert_eq!(counter.get("10.0.0.9:13799"), 0);
        assert_eq!(
            counter.get_all(),
            vec![
                ("10.0.0.2:13799".to_string(), 3),
                ("10.0.0.3:13799".to_string(), 1)
            ]
        );

        counter.remove("10.0.0.2:13799");
        assert_eq!(counter.get_all().len(), 1);
    }
}
