//! Per-run and corpus-wide execution counters.

use std::collections::BTreeMap;

use log::warn;
use serde::Serialize;

use crate::table::FormatTable;
use crate::Observation;

/// Which keys a store accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Universe {
    /// Only the keys the store was seeded with
    Closed,
    /// Any key, inserted on first sight
    Open,
}

/// Result of applying one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The count was added
    Counted,
    /// Closed universe and the key is not part of it; nothing changed
    Unknown,
}

/// Key -> execution count, iterated in key order.
///
/// A run store and the global store are both `CounterStore`s; after every
/// completed run is merged, each global count is the sum of the run counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterStore {
    universe: Universe,
    counts: BTreeMap<String, u64>,
    contexts: BTreeMap<String, String>,
}

impl CounterStore {
    /// Empty store with an open key universe
    pub fn open() -> Self {
        Self {
            universe: Universe::Open,
            counts: BTreeMap::new(),
            contexts: BTreeMap::new(),
        }
    }

    /// Closed store holding every IFORM of the table at its seed count
    pub fn seeded(table: &FormatTable) -> Self {
        Self {
            universe: Universe::Closed,
            counts: table.iter().map(|e| (e.iform.clone(), e.count)).collect(),
            contexts: BTreeMap::new(),
        }
    }

    pub fn universe(&self) -> Universe {
        self.universe
    }

    /// Count for `key`, zero when absent
    pub fn get(&self, key: &str) -> u64 {
        self.counts.get(key).copied().unwrap_or(0)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.counts.contains_key(key)
    }

    /// Context text recorded with the first sighting of `key`
    pub fn context(&self, key: &str) -> Option<&str> {
        self.contexts.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// `(key, count)` pairs sorted by key
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.counts.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Add the observation's count to its key.
    pub fn apply(&mut self, obs: &Observation) -> Applied {
        let slot = match self.universe {
            Universe::Closed => match self.counts.get_mut(&obs.key) {
                Some(slot) => slot,
                None => {
                    warn!("{} is not a known iform, dropping count {}", obs.key, obs.count);
                    return Applied::Unknown;
                }
            },
            Universe::Open => self.counts.entry(obs.key.clone()).or_insert(0),
        };
        *slot = slot.saturating_add(obs.count);

        if let Some(context) = &obs.context {
            if !self.contexts.contains_key(&obs.key) {
                self.contexts.insert(obs.key.clone(), context.clone());
            }
        }
        Applied::Counted
    }

    /// Fold a completed run into this store.
    ///
    /// Keys missing here are inserted regardless of universe, so a closed
    /// global store must be seeded from the same table as its runs.
    pub fn merge(&mut self, run: &CounterStore) {
        for (key, count) in &run.counts {
            let slot = self.counts.entry(key.clone()).or_insert(0);
            *slot = slot.saturating_add(*count);
        }
        for (key, context) in &run.contexts {
            self.contexts
                .entry(key.clone())
                .or_insert_with(|| context.clone());
        }
    }

    /// Sum of every count
    pub fn total(&self) -> u64 {
        self.counts.values().fold(0u64, |acc, v| acc.saturating_add(*v))
    }

    /// The `n` most executed keys, by count descending then key.
    ///
    /// Keys with a zero count are never listed.
    pub fn most_common(&self, n: usize) -> Vec<(&str, u64)> {
        let mut ranked: Vec<(&str, u64)> = self.iter().filter(|(_, count)| *count > 0).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        ranked.truncate(n);
        ranked
    }

    /// Covered/total key statistics
    pub fn summary(&self) -> CoverageSummary {
        let covered = self.counts.values().filter(|c| **c > 0).count();
        CoverageSummary::new(self.counts.len(), covered, self.total())
    }
}

/// How many keys of a store were exercised.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CoverageSummary {
    /// Number of keys in the store
    pub total: usize,
    /// Keys with a non-zero count
    pub covered: usize,
    /// `covered / total` as a percentage (0 for an empty store)
    pub percent: f64,
    /// Sum of all execution counts
    pub executions: u64,
}

impl CoverageSummary {
    fn new(total: usize, covered: usize, executions: u64) -> Self {
        let percent = if total == 0 {
            0.0
        } else {
            covered as f64 * 100.0 / total as f64
        };
        Self {
            total,
            covered,
            percent,
            executions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ObservationKind;
    use std::io::Cursor;

    fn table() -> FormatTable {
        let spec = "#iclass extension category iform_name\nNOP BASE NOP NOP\nADD BASE BINARY ADD\nJMP BASE BR JMP\n";
        FormatTable::parse(Cursor::new(spec)).unwrap()
    }

    fn iform(key: &str, count: u64) -> Observation {
        Observation::new(ObservationKind::Iform, key, count)
    }

    #[test]
    fn test_seeded_store_has_every_iform() {
        let store = CounterStore::seeded(&table());
        assert_eq!(store.universe(), Universe::Closed);
        assert_eq!(store.len(), 3);
        assert!(store.iter().all(|(_, count)| count == 0));
    }

    #[test]
    fn test_closed_store_drops_unknown_keys() {
        let mut store = CounterStore::seeded(&table());

        assert_eq!(store.apply(&iform("NOP", 5)), Applied::Counted);
        assert_eq!(store.apply(&iform("MOV", 3)), Applied::Unknown);

        assert_eq!(store.get("NOP"), 5);
        assert!(!store.contains("MOV"));
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_deltas_accumulate() {
        let mut store = CounterStore::seeded(&table());
        store.apply(&iform("NOP", 5));
        store.apply(&iform("NOP", 2));
        assert_eq!(store.get("NOP"), 7);
    }

    #[test]
    fn test_open_store_inserts_on_first_sight() {
        let mut store = CounterStore::open();
        let obs = Observation::new(ObservationKind::Instruction, "90", 0).with_context("nop");

        assert_eq!(store.apply(&obs), Applied::Counted);
        assert!(store.contains("90"));
        assert_eq!(store.get("90"), 0);
        assert_eq!(store.context("90"), Some("nop"));
    }

    #[test]
    fn test_first_context_wins() {
        let mut store = CounterStore::open();
        store.apply(&Observation::new(ObservationKind::Instruction, "E8", 1).with_context("call 0x10"));
        store.apply(&Observation::new(ObservationKind::Instruction, "E8", 1).with_context("call 0x20"));
        assert_eq!(store.context("E8"), Some("call 0x10"));
    }

    #[test]
    fn test_merge_preserves_sum() {
        let table = table();
        let mut global = CounterStore::seeded(&table);

        let mut first = CounterStore::seeded(&table);
        first.apply(&iform("NOP", 7));
        let mut second = CounterStore::seeded(&table);
        second.apply(&iform("NOP", 1));
        second.apply(&iform("ADD", 4));

        global.merge(&first);
        global.merge(&second);

        for (key, count) in global.iter() {
            assert_eq!(count, first.get(key) + second.get(key), "key {key}");
        }
        assert_eq!(global.get("NOP"), 8);
        assert_eq!(global.get("ADD"), 4);
        assert_eq!(global.get("JMP"), 0);
    }

    #[test]
    fn test_merge_into_open_store() {
        let mut global = CounterStore::open();
        let mut run = CounterStore::open();
        run.apply(&Observation::new(ObservationKind::Branch, "C3", 2).with_context("ret"));

        global.merge(&run);
        global.merge(&run);

        assert_eq!(global.get("C3"), 4);
        assert_eq!(global.context("C3"), Some("ret"));
    }

    #[test]
    fn test_summary() {
        let mut store = CounterStore::seeded(&table());
        store.apply(&iform("NOP", 7));
        store.apply(&iform("ADD", 3));

        let summary = store.summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.covered, 2);
        assert_eq!(summary.executions, 10);
        assert!((summary.percent - 66.666).abs() < 0.01);

        assert_eq!(CounterStore::open().summary().percent, 0.0);
    }

    #[test]
    fn test_most_common_breaks_ties_by_key() {
        let mut store = CounterStore::open();
        for (key, count) in [("C3", 4), ("90", 9), ("E8", 4), ("74", 1), ("EB", 4)] {
            store.apply(&Observation::new(ObservationKind::Instruction, key, count));
        }

        assert_eq!(store.most_common(3), vec![("90", 9), ("C3", 4), ("E8", 4)]);
        assert_eq!(store.most_common(10).len(), 5);
        assert!(store.most_common(0).is_empty());
    }

    #[test]
    fn test_most_common_skips_unexecuted_keys() {
        let mut store = CounterStore::seeded(&table());
        store.apply(&iform("ADD", 2));
        assert_eq!(store.most_common(10), vec![("ADD", 2)]);
    }
}
