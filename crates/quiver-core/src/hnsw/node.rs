//! Node representation in the HNSW graph.

/// A node in the graph. Each node exists on layers `0..=max_layer`; layer 0
/// contains all nodes, higher layers progressively fewer.
#[derive(Debug, Clone)]
pub struct Node {
    /// Slot id assigned by the owning index.
    pub slot: usize,
    /// Neighbor slots at each layer; `layers[0]` is the base layer.
    pub layers: Vec<Vec<usize>>,
}

impl Node {
    pub fn new(slot: usize, max_layer: usize) -> Self {
        Self {
            slot,
            layers: vec![Vec::new(); max_layer + 1],
        }
    }

    pub fn max_layer(&self) -> usize {
        self.layers.len().saturating_sub(1)
    }

    pub fn neighbors(&self, layer: usize) -> &[usize] {
        self.layers.get(layer).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn neighbors_mut(&mut self, layer: usize) -> Option<&mut Vec<usize>> {
        self.layers.get_mut(layer)
    }

    pub fn add_neighbor(&mut self, layer: usize, neighbor: usize) {
        if let Some(neighbors) = self.layers.get_mut(layer) {
            if !neighbors.contains(&neighbor) {
                neighbors.push(neighbor);
            }
        }
    }
}
