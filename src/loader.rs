//! Streaming helpers over storage: progressive scans and chunked imports.

use std::future::Future;

use crate::error::StorageError;
use crate::record::VectorRecord;
use crate::storage::Storage;

/// Drives cursor scans and chunked imports. Receives storage as an
/// argument per call; holds no reference.
#[derive(Debug, Clone, Copy)]
pub struct ProgressiveLoader {
    chunk_size: usize,
}

impl ProgressiveLoader {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Stream every record through `visit`, awaiting the visitor between
    /// items so back-pressure propagates. Returns the record count.
    pub async fn stream_process<F, Fut>(
        &self,
        storage: &dyn Storage,
        mut visit: F,
    ) -> Result<usize, StorageError>
    where
        F: FnMut(VectorRecord) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut after: Option<String> = None;
        let mut count = 0usize;
        loop {
            let page = storage.scan_page(after.as_deref(), self.chunk_size).await?;
            if page.is_empty() {
                return Ok(count);
            }
            after = page.last().map(|r| r.id.clone());
            for record in page {
                visit(record).await;
                count += 1;
            }
        }
    }

    /// Write `records` in chunks, reporting `(loaded, total)` after each
    /// chunk and once more at completion.
    pub async fn import_in_batches<F>(
        &self,
        storage: &dyn Storage,
        records: &[VectorRecord],
        mut on_progress: F,
    ) -> Result<(), StorageError>
    where
        F: FnMut(usize, usize),
    {
        let total = records.len();
        let mut loaded = 0usize;
        for chunk in records.chunks(self.chunk_size) {
            storage.put_batch(chunk).await?;
            loaded += chunk.len();
            on_progress(loaded, total);
        }
        on_progress(loaded, total);
        Ok(())
    }
}

impl Default for ProgressiveLoader {
    fn default() -> Self {
        Self::new(100)
    }
}
