//! Shared test fixtures.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use quiver_db::{EmbeddingError, EmbeddingGenerator};

/// Deterministic embedder: hashes the text into an L2-normalized vector.
/// Counts calls so tests can observe cache hits.
pub struct StubEmbedder {
    dims: usize,
    /// `initialize` fails this many times before succeeding.
    pub load_failures: AtomicU32,
    pub embed_calls: AtomicU32,
}

impl StubEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            load_failures: AtomicU32::new(0),
            embed_calls: AtomicU32::new(0),
        }
    }

    pub fn failing(dims: usize, failures: u32) -> Self {
        Self {
            dims,
            load_failures: AtomicU32::new(failures),
            embed_calls: AtomicU32::new(0),
        }
    }

    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut state = text
            .bytes()
            .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64))
            | 1;
        let mut v: Vec<f32> = (0..self.dims)
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                ((state >> 40) as f32 / (1u64 << 23) as f32) - 1.0
            })
            .collect();
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl EmbeddingGenerator for StubEmbedder {
    async fn initialize(&self) -> Result<(), EmbeddingError> {
        if self
            .load_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            Err(EmbeddingError::ModelLoad("stub failure".into()))
        } else {
            Ok(())
        }
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.vector_for(text))
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}
