//! Byte-accounted LRU cache over hot records.

use std::collections::{BTreeMap, HashMap};

use crate::record::VectorRecord;

struct Entry {
    record: VectorRecord,
    size: usize,
    tick: u64,
}

/// Size-bounded LRU mapping `id → VectorRecord`.
///
/// Recency is tracked with a monotonically increasing tick per touch; the
/// lowest tick is the eviction victim. A single record larger than the
/// whole budget is never cached.
pub struct VectorCache {
    max_bytes: usize,
    current_bytes: usize,
    tick: u64,
    entries: HashMap<String, Entry>,
    recency: BTreeMap<u64, String>,
}

impl VectorCache {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            current_bytes: 0,
            tick: 0,
            entries: HashMap::new(),
            recency: BTreeMap::new(),
        }
    }

    /// Estimated resident size of a record:
    /// `vector bytes + 2 × serialized metadata + fixed overhead`.
    pub fn estimate_size(record: &VectorRecord) -> usize {
        let metadata_len = serde_json::to_string(&record.metadata)
            .map(|s| s.len())
            .unwrap_or(0);
        record.vector.len() * 4 + 2 * metadata_len + 100
    }

    pub fn get(&mut self, id: &str) -> Option<VectorRecord> {
        let next_tick = self.next_tick();
        let entry = self.entries.get_mut(id)?;
        self.recency.remove(&entry.tick);
        entry.tick = next_tick;
        self.recency.insert(next_tick, id.to_string());
        Some(entry.record.clone())
    }

    pub fn set(&mut self, id: &str, record: VectorRecord, size: usize) {
        if size > self.max_bytes {
            // Would evict everything and still not fit.
            self.delete(id);
            return;
        }
        self.delete(id);
        while self.current_bytes + size > self.max_bytes {
            if !self.evict_lru() {
                break;
            }
        }
        let tick = self.next_tick();
        self.entries.insert(
            id.to_string(),
            Entry {
                record,
                size,
                tick,
            },
        );
        self.recency.insert(tick, id.to_string());
        self.current_bytes += size;
    }

    pub fn delete(&mut self, id: &str) {
        if let Some(entry) = self.entries.remove(id) {
            self.recency.remove(&entry.tick);
            self.current_bytes -= entry.size;
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
        self.current_bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn current_bytes(&self) -> usize {
        self.current_bytes
    }

    fn evict_lru(&mut self) -> bool {
        let Some((&tick, _)) = self.recency.iter().next() else {
            return false;
        };
        let id = self.recency.remove(&tick).expect("tick present");
        if let Some(entry) = self.entries.remove(&id) {
            self.current_bytes -= entry.size;
        }
        true
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}
