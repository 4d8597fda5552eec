//! Approximate-nearest-neighbor index capability.
//!
//! Any backend implementing [`AnnIndex`] plugs into the coordinator; the
//! shipped backend wraps the HNSW graph from `quiver-core`.
//!
//! # Serialized form
//!
//! ```text
//! Offset  Size  Description
//! ─────────────────────────────────────────────
//! 0x00    8     Magic: "QVIX0001"
//! 0x08    1     u8      Metric tag
//! 0x09    4     u32 LE  Dimensions
//! 0x0D    4     u32 LE  Entry count
//! 0x11    …     Entries
//! ```
//!
//! Each entry: `[id_len: u16][id][vector: dim × f32][meta_len: u32]
//! [metadata JSON][timestamp: i64]`, all little-endian. The format captures
//! membership, not graph edges — deserialization rebuilds the graph, which
//! keeps restore equivalent to a rebuild and the format insensitive to
//! graph internals.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde_json::{Map, Value};

use quiver_core::{HnswGraph, Metric};

use crate::error::IndexError;
use crate::filter::QueryFilter;
use crate::record::{now_millis, VectorRecord};

const MAGIC: [u8; 8] = *b"QVIX0001";

/// Over-fetch multiplier applied before filter evaluation.
const FILTER_OVERFETCH: usize = 4;

/// One search result from the index.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexStats {
    pub vector_count: usize,
    pub dimensions: usize,
    pub memory_usage: usize,
    pub last_updated: i64,
}

pub trait AnnIndex: Send + Sync {
    /// Bulk construction, discarding prior state. Empty input yields an
    /// empty index.
    fn build(&mut self, records: &[VectorRecord]) -> Result<(), IndexError>;

    /// Incremental insertion; observable immediately.
    fn add(&mut self, record: &VectorRecord) -> Result<(), IndexError>;

    fn add_batch(&mut self, records: &[VectorRecord]) -> Result<(), IndexError> {
        for record in records {
            self.add(record)?;
        }
        Ok(())
    }

    /// Returns whether the id was a member. Removing an absent id is a
    /// no-op.
    fn remove(&mut self, id: &str) -> bool;

    /// Top-k search. Results are sorted by score (descending for
    /// cosine/dot, ascending for l2), ties broken by id ascending; when a
    /// filter is given, non-matching candidates are dropped before
    /// truncation to `k`.
    fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&QueryFilter>,
    ) -> Result<Vec<SearchHit>, IndexError>;

    /// Opaque byte string capturing membership and dimensions.
    fn serialize(&self) -> Vec<u8>;

    /// Restore from [`AnnIndex::serialize`] output. On failure the index is
    /// left unchanged.
    fn deserialize(&mut self, bytes: &[u8]) -> Result<(), IndexError>;

    fn stats(&self) -> IndexStats;

    fn clear(&mut self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct SlotEntry {
    id: String,
    metadata: Map<String, Value>,
    timestamp: i64,
}

/// HNSW-backed index.
pub struct HnswIndex {
    metric: Metric,
    dim: usize,
    m: usize,
    ef_construction: usize,
    ef_search: usize,
    graph: HnswGraph,
    slots: HashMap<usize, SlotEntry>,
    ids: HashMap<String, usize>,
    next_slot: usize,
    last_updated: i64,
}

impl HnswIndex {
    pub fn new(metric: Metric, dim: usize, m: usize, ef_construction: usize, ef_search: usize) -> Self {
        Self {
            metric,
            dim,
            m,
            ef_construction,
            ef_search,
            graph: HnswGraph::new(metric, dim, m, ef_construction),
            slots: HashMap::new(),
            ids: HashMap::new(),
            next_slot: 0,
            last_updated: now_millis(),
        }
    }

    fn check_dim(&self, vector: &[f32]) -> Result<(), IndexError> {
        if vector.len() != self.dim {
            return Err(IndexError::DimensionMismatch {
                expected: self.dim,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    fn insert_entry(&mut self, record: &VectorRecord) {
        if let Some(slot) = self.ids.remove(&record.id) {
            self.graph.remove(slot);
            self.slots.remove(&slot);
        }
        let slot = self.next_slot;
        self.next_slot += 1;
        self.graph.insert(slot, &record.vector);
        self.slots.insert(
            slot,
            SlotEntry {
                id: record.id.clone(),
                metadata: record.metadata.clone(),
                timestamp: record.timestamp,
            },
        );
        self.ids.insert(record.id.clone(), slot);
    }

    /// One search pass over the graph: fetch, map to hits, filter.
    fn search_pass(
        &self,
        query: &[f32],
        fetch_k: usize,
        filter: Option<&QueryFilter>,
    ) -> Vec<SearchHit> {
        let ef = self.ef_search.max(fetch_k);
        self.graph
            .search(query, fetch_k, ef)
            .into_iter()
            .filter_map(|(slot, distance)| {
                let entry = self.slots.get(&slot)?;
                if let Some(f) = filter {
                    if !f.matches(&entry.metadata) {
                        return None;
                    }
                }
                Some(SearchHit {
                    id: entry.id.clone(),
                    score: self.metric.score(distance),
                    metadata: entry.metadata.clone(),
                })
            })
            .collect()
    }
}

impl AnnIndex for HnswIndex {
    fn build(&mut self, records: &[VectorRecord]) -> Result<(), IndexError> {
        for record in records {
            self.check_dim(&record.vector)?;
        }
        self.clear();
        for record in records {
            self.insert_entry(record);
        }
        self.last_updated = now_millis();
        Ok(())
    }

    fn add(&mut self, record: &VectorRecord) -> Result<(), IndexError> {
        self.check_dim(&record.vector)?;
        self.insert_entry(record);
        self.last_updated = now_millis();
        Ok(())
    }

    fn add_batch(&mut self, records: &[VectorRecord]) -> Result<(), IndexError> {
        // Validate everything up front so a bad record leaves the index
        // unchanged.
        for record in records {
            self.check_dim(&record.vector)?;
        }
        for record in records {
            self.insert_entry(record);
        }
        self.last_updated = now_millis();
        Ok(())
    }

    fn remove(&mut self, id: &str) -> bool {
        let Some(slot) = self.ids.remove(id) else {
            return false;
        };
        self.graph.remove(slot);
        self.slots.remove(&slot);
        self.last_updated = now_millis();
        true
    }

    fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&QueryFilter>,
    ) -> Result<Vec<SearchHit>, IndexError> {
        self.check_dim(query)?;
        if k == 0 || self.ids.is_empty() {
            return Ok(Vec::new());
        }

        let live = self.graph.len();
        let fetch_k = if filter.is_some() {
            k.saturating_mul(FILTER_OVERFETCH).min(live)
        } else {
            k.min(live)
        };

        let mut hits = self.search_pass(query, fetch_k, filter);

        // Filter selectivity starved the result set; retry over the whole
        // live set before giving up on k.
        if filter.is_some() && hits.len() < k && fetch_k < live {
            hits = self.search_pass(query, live, filter);
        }

        let descending = self.metric.descending();
        hits.sort_by(|a, b| {
            let by_score = if descending {
                b.score.partial_cmp(&a.score)
            } else {
                a.score.partial_cmp(&b.score)
            };
            by_score
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    fn serialize(&self) -> Vec<u8> {
        let mut slots: Vec<usize> = self.graph.live_slots().collect();
        slots.sort_unstable();

        let mut out = Vec::with_capacity(64 + slots.len() * (self.dim * 4 + 64));
        out.extend_from_slice(&MAGIC);
        out.push(self.metric.tag());
        out.extend_from_slice(&(self.dim as u32).to_le_bytes());
        out.extend_from_slice(&(slots.len() as u32).to_le_bytes());

        for slot in slots {
            let entry = &self.slots[&slot];
            let vector = self.graph.vector(slot).expect("live slot has a vector");
            let meta = serde_json::to_vec(&entry.metadata).unwrap_or_else(|_| b"{}".to_vec());

            out.extend_from_slice(&(entry.id.len() as u16).to_le_bytes());
            out.extend_from_slice(entry.id.as_bytes());
            for value in vector {
                out.extend_from_slice(&value.to_le_bytes());
            }
            out.extend_from_slice(&(meta.len() as u32).to_le_bytes());
            out.extend_from_slice(&meta);
            out.extend_from_slice(&entry.timestamp.to_le_bytes());
        }
        out
    }

    fn deserialize(&mut self, bytes: &[u8]) -> Result<(), IndexError> {
        let mut reader = ByteReader::new(bytes);

        let magic = reader.take(8)?;
        if magic != MAGIC {
            return Err(IndexError::Corrupted("bad magic bytes".into()));
        }
        // The tag must parse, but restore always runs under the configured
        // metric: membership is metric-agnostic.
        Metric::from_tag(reader.u8()?)
            .ok_or_else(|| IndexError::Corrupted("unknown metric tag".into()))?;
        let dim = reader.u32()? as usize;
        if dim != self.dim {
            return Err(IndexError::DimensionMismatch {
                expected: self.dim,
                actual: dim,
            });
        }
        let count = reader.u32()? as usize;

        // Decode everything before touching live state so corrupt input
        // leaves the index unchanged. The count field is untrusted, so the
        // pre-allocation is capped.
        let mut records = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            let id_len = reader.u16()? as usize;
            let id = String::from_utf8(reader.take(id_len)?.to_vec())
                .map_err(|_| IndexError::Corrupted("id is not UTF-8".into()))?;
            let mut vector = Vec::with_capacity(dim);
            for _ in 0..dim {
                vector.push(reader.f32()?);
            }
            let meta_len = reader.u32()? as usize;
            let metadata: Map<String, Value> = serde_json::from_slice(reader.take(meta_len)?)
                .map_err(|err| IndexError::Corrupted(format!("metadata: {err}")))?;
            let timestamp = reader.i64()?;
            records.push(VectorRecord {
                id,
                vector,
                metadata,
                timestamp,
            });
        }
        if !reader.is_empty() {
            return Err(IndexError::Corrupted("trailing bytes".into()));
        }

        self.clear();
        self.graph = HnswGraph::new(self.metric, dim, self.m, self.ef_construction);
        for record in &records {
            self.insert_entry(record);
        }
        self.last_updated = now_millis();
        Ok(())
    }

    fn stats(&self) -> IndexStats {
        let meta_bytes: usize = self
            .slots
            .values()
            .map(|s| s.id.len() + 64 + s.metadata.len() * 48)
            .sum();
        IndexStats {
            vector_count: self.ids.len(),
            dimensions: self.dim,
            memory_usage: self.graph.memory_bytes() + meta_bytes,
            last_updated: self.last_updated,
        }
    }

    fn clear(&mut self) {
        self.graph.clear();
        self.slots.clear();
        self.ids.clear();
        self.next_slot = 0;
        self.last_updated = now_millis();
    }

    fn len(&self) -> usize {
        self.ids.len()
    }
}

/// Bounds-checked little-endian reader over the serialized form.
struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], IndexError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| IndexError::Corrupted("unexpected end of data".into()))?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, IndexError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, IndexError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().expect("fixed")))
    }

    fn u32(&mut self) -> Result<u32, IndexError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("fixed")))
    }

    fn f32(&mut self) -> Result<f32, IndexError> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().expect("fixed")))
    }

    fn i64(&mut self) -> Result<i64, IndexError> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().expect("fixed")))
    }

    fn is_empty(&self) -> bool {
        self.pos == self.bytes.len()
    }
}
