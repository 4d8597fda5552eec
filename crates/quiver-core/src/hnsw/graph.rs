//! The HNSW graph: layered insert, beam search, tombstoned removal.
//!
//! **Insert**: assign a random layer L (exponential distribution), greedy
//! descent from the entry point down to L+1, then wire neighbors on every
//! layer from L down to 0 using a diversity-preserving selection heuristic.
//!
//! **Search**: greedy descent to layer 0, then beam search with `ef`
//! candidates.
//!
//! **Removal**: tombstones. A removed slot stays routable so the graph does
//! not tear, but never appears in results. Once tombstones outnumber live
//! nodes past a floor the graph rebuilds itself from the live set.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::node::Node;
use super::visited::VisitedSet;
use crate::metric::Metric;

/// Rebuild is considered once at least this many tombstones accumulate.
const TOMBSTONE_REBUILD_FLOOR: usize = 64;

/// Candidate for expansion (min-heap by distance).
#[derive(Clone, Copy)]
struct Candidate {
    slot: usize,
    distance: f32,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance
    }
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: smaller distance pops first.
        other
            .distance
            .partial_cmp(&self.distance)
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Found neighbor (max-heap so the worst result is on top).
#[derive(Clone, Copy)]
struct Found {
    slot: usize,
    distance: f32,
}

impl PartialEq for Found {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance
    }
}

impl Eq for Found {}

impl Ord for Found {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .partial_cmp(&other.distance)
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for Found {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Hierarchical navigable small world graph over caller-assigned slots.
pub struct HnswGraph {
    metric: Metric,
    dim: usize,
    nodes: Vec<Node>,
    slot_to_index: HashMap<usize, usize>,
    vectors: HashMap<usize, Vec<f32>>,
    removed: HashSet<usize>,
    entry_point: Option<usize>,
    max_layer: usize,
    m: usize,
    m0: usize,
    ml: f64,
    ef_construction: usize,
    rng: StdRng,
}

impl HnswGraph {
    pub fn new(metric: Metric, dim: usize, m: usize, ef_construction: usize) -> Self {
        Self::with_seed(metric, dim, m, ef_construction, rand::random())
    }

    /// Deterministic construction for tests and benches.
    pub fn with_seed(metric: Metric, dim: usize, m: usize, ef_construction: usize, seed: u64) -> Self {
        let m = m.max(2);
        Self {
            metric,
            dim,
            nodes: Vec::new(),
            slot_to_index: HashMap::new(),
            vectors: HashMap::new(),
            removed: HashSet::new(),
            entry_point: None,
            max_layer: 0,
            m,
            m0: m * 2,
            ml: 1.0 / (m as f64).ln(),
            ef_construction,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of live (non-tombstoned) slots.
    pub fn len(&self) -> usize {
        self.nodes.len() - self.removed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, slot: usize) -> bool {
        self.slot_to_index.contains_key(&slot) && !self.removed.contains(&slot)
    }

    /// Stored (possibly normalized) vector for a live slot.
    pub fn vector(&self, slot: usize) -> Option<&[f32]> {
        if self.removed.contains(&slot) {
            return None;
        }
        self.vectors.get(&slot).map(|v| v.as_slice())
    }

    /// Live slots in unspecified order.
    pub fn live_slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.nodes
            .iter()
            .map(|n| n.slot)
            .filter(move |slot| !self.removed.contains(slot))
    }

    /// Approximate heap footprint of the graph structure and vectors.
    pub fn memory_bytes(&self) -> usize {
        let vector_bytes = self.vectors.len() * (self.dim * 4 + 48);
        let edge_bytes: usize = self
            .nodes
            .iter()
            .map(|n| n.layers.iter().map(|l| l.len() * 8 + 24).sum::<usize>())
            .sum();
        vector_bytes + edge_bytes
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.slot_to_index.clear();
        self.vectors.clear();
        self.removed.clear();
        self.entry_point = None;
        self.max_layer = 0;
    }

    /// Insert a vector under a fresh slot. The caller guarantees the slot is
    /// not already present; the vector is normalized here when the metric
    /// calls for it.
    pub fn insert(&mut self, slot: usize, vector: &[f32]) {
        debug_assert_eq!(vector.len(), self.dim, "vector length mismatch");
        let stored = if self.metric.normalizes() {
            crate::metric::l2_normalized(vector)
        } else {
            vector.to_vec()
        };
        self.insert_prepared(slot, stored);
    }

    fn insert_prepared(&mut self, slot: usize, stored: Vec<f32>) {
        let node_layer = self.random_layer();
        let mut node = Node::new(slot, node_layer);
        self.vectors.insert(slot, stored);

        // First node becomes the entry point.
        let Some(entry) = self.entry_point else {
            self.entry_point = Some(slot);
            self.max_layer = node_layer;
            self.slot_to_index.insert(slot, self.nodes.len());
            self.nodes.push(node);
            return;
        };

        let query = self.vectors[&slot].clone();
        let mut current = entry;

        // Phase 1: zoom in from the top layer down to node_layer + 1.
        for layer in (node_layer + 1..=self.max_layer).rev() {
            if let Some(&(nearest, _)) = self.search_layer(&query, &[current], 1, layer).first() {
                current = nearest;
            }
        }

        // Phase 2: wire connections from min(node_layer, max_layer) down to 0.
        let start_layer = node_layer.min(self.max_layer);
        for layer in (0..=start_layer).rev() {
            let m_layer = if layer == 0 { self.m0 } else { self.m };
            let candidates = self.search_layer(&query, &[current], self.ef_construction, layer);
            let neighbors = self.select_neighbors(&candidates, m_layer);

            for &(neighbor, _) in &neighbors {
                node.add_neighbor(layer, neighbor);
                self.link_back(neighbor, layer, slot, m_layer);
            }

            if let Some(&(first, _)) = candidates.first() {
                current = first;
            }
        }

        if node_layer > self.max_layer {
            self.max_layer = node_layer;
            self.entry_point = Some(slot);
        }

        self.slot_to_index.insert(slot, self.nodes.len());
        self.nodes.push(node);
    }

    /// Add the reverse edge `neighbor -> new_slot`, pruning the neighbor's
    /// list with the selection heuristic when it overflows.
    fn link_back(&mut self, neighbor: usize, layer: usize, new_slot: usize, m_layer: usize) {
        let Some(&idx) = self.slot_to_index.get(&neighbor) else {
            return;
        };
        let mut updated = self.nodes[idx].neighbors(layer).to_vec();
        if updated.contains(&new_slot) {
            return;
        }
        updated.push(new_slot);

        if updated.len() > m_layer {
            let base = self.vectors[&neighbor].clone();
            let candidates: Vec<(usize, f32)> = updated
                .iter()
                .map(|&s| (s, self.metric.distance(&base, &self.vectors[&s])))
                .collect();
            updated = self
                .select_neighbors(&candidates, m_layer)
                .into_iter()
                .map(|(s, _)| s)
                .collect();
        }

        if let Some(list) = self.nodes[idx].neighbors_mut(layer) {
            *list = updated;
        }
    }

    /// Tombstone a slot. Returns whether it was live. The node stays in the
    /// graph for routing; a rebuild reclaims it later.
    pub fn remove(&mut self, slot: usize) -> bool {
        if !self.slot_to_index.contains_key(&slot) || !self.removed.insert(slot) {
            return false;
        }
        if self.len() == 0 {
            self.clear();
            return true;
        }
        if self.removed.len() >= TOMBSTONE_REBUILD_FLOOR && self.removed.len() > self.len() {
            self.rebuild();
        }
        true
    }

    /// Rebuild the graph from the live set, dropping tombstones.
    fn rebuild(&mut self) {
        let mut live: Vec<(usize, Vec<f32>)> = self
            .nodes
            .iter()
            .filter(|n| !self.removed.contains(&n.slot))
            .map(|n| (n.slot, self.vectors[&n.slot].clone()))
            .collect();
        live.sort_by_key(|(slot, _)| *slot);

        self.clear();
        for (slot, stored) in live {
            self.insert_prepared(slot, stored);
        }
    }

    /// Top-k beam search. Returns live slots with their internal distances,
    /// ascending (closest first).
    pub fn search(&self, query: &[f32], k: usize, ef: usize) -> Vec<(usize, f32)> {
        debug_assert_eq!(query.len(), self.dim, "query length mismatch");
        let Some(entry) = self.entry_point else {
            return Vec::new();
        };
        if k == 0 || self.is_empty() {
            return Vec::new();
        }

        let owned;
        let query = if self.metric.normalizes() {
            owned = crate::metric::l2_normalized(query);
            owned.as_slice()
        } else {
            query
        };

        let mut current = entry;
        for layer in (1..=self.max_layer).rev() {
            if let Some(&(nearest, _)) = self.search_layer(query, &[current], 1, layer).first() {
                current = nearest;
            }
        }

        let ef = ef.max(k);
        let mut results = self.search_layer(query, &[current], ef, 0);
        results.truncate(k);
        results
    }

    /// Beam search on a single layer. Tombstoned nodes are traversed but
    /// excluded from results.
    fn search_layer(
        &self,
        query: &[f32],
        entry_points: &[usize],
        ef: usize,
        layer: usize,
    ) -> Vec<(usize, f32)> {
        let mut visited = VisitedSet::with_capacity(self.nodes.len().max(64));
        let mut candidates: BinaryHeap<Candidate> = BinaryHeap::with_capacity(ef);
        let mut results: BinaryHeap<Found> = BinaryHeap::with_capacity(ef + 1);

        for &ep in entry_points {
            if visited.is_visited(ep) {
                continue;
            }
            visited.visit(ep);
            let dist = self.metric.distance(query, &self.vectors[&ep]);
            candidates.push(Candidate { slot: ep, distance: dist });
            if !self.removed.contains(&ep) {
                results.push(Found { slot: ep, distance: dist });
            }
        }

        while let Some(current) = candidates.pop() {
            if let Some(worst) = results.peek() {
                if current.distance > worst.distance && results.len() >= ef {
                    break;
                }
            }

            let Some(&idx) = self.slot_to_index.get(&current.slot) else {
                continue;
            };
            for &neighbor in self.nodes[idx].neighbors(layer) {
                if visited.is_visited(neighbor) {
                    continue;
                }
                visited.visit(neighbor);
                let dist = self.metric.distance(query, &self.vectors[&neighbor]);

                let should_add = results.len() < ef
                    || results.peek().map(|w| dist < w.distance).unwrap_or(true);
                if should_add {
                    candidates.push(Candidate { slot: neighbor, distance: dist });
                    if !self.removed.contains(&neighbor) {
                        results.push(Found { slot: neighbor, distance: dist });
                        if results.len() > ef {
                            results.pop();
                        }
                    }
                }
            }
        }

        let mut out: Vec<(usize, f32)> = results
            .into_iter()
            .map(|f| (f.slot, f.distance))
            .collect();
        out.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        out
    }

    /// Diversity-preserving neighbor selection: a candidate is kept only if
    /// it is closer to the query than to every already-selected neighbor,
    /// then remaining slots are filled nearest-first.
    fn select_neighbors(&self, candidates: &[(usize, f32)], m: usize) -> Vec<(usize, f32)> {
        if candidates.len() <= m {
            return candidates.to_vec();
        }

        let mut sorted = candidates.to_vec();
        sorted.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));

        let mut selected: Vec<(usize, f32)> = Vec::with_capacity(m);
        let mut spilled: Vec<(usize, f32)> = Vec::new();

        for &(slot, dist) in &sorted {
            if selected.len() >= m {
                break;
            }
            let diverse = selected.iter().all(|&(kept, _)| {
                let between = self
                    .metric
                    .distance(&self.vectors[&slot], &self.vectors[&kept]);
                dist < between
            });
            if diverse {
                selected.push((slot, dist));
            } else {
                spilled.push((slot, dist));
            }
        }

        for &(slot, dist) in &spilled {
            if selected.len() >= m {
                break;
            }
            selected.push((slot, dist));
        }

        selected
    }

    fn random_layer(&mut self) -> usize {
        let r: f64 = self.rng.gen();
        (-r.ln() * self.ml).floor() as usize
    }
}
