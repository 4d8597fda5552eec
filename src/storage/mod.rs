//! Durable keyed persistence of vector records.
//!
//! The capability is async and object-safe so backends plug in behind
//! `Arc<dyn Storage>`. Scanning is cursor-driven: callers pull pages in
//! ascending id order via [`Storage::scan_page`], which lets streaming
//! consumers (export, progressive load) drive the traversal from the
//! outside.

mod file;
mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::record::VectorRecord;

#[async_trait]
pub trait Storage: Send + Sync {
    /// Idempotent upsert of a single record.
    async fn put(&self, record: &VectorRecord) -> Result<(), StorageError>;

    /// Atomic upsert of a batch: either every record lands or none do.
    async fn put_batch(&self, records: &[VectorRecord]) -> Result<(), StorageError>;

    async fn get(&self, id: &str) -> Result<Option<VectorRecord>, StorageError>;

    /// Returns whether the id existed.
    async fn delete(&self, id: &str) -> Result<bool, StorageError>;

    async fn get_all(&self) -> Result<Vec<VectorRecord>, StorageError>;

    async fn count(&self) -> Result<usize, StorageError>;

    async fn clear(&self) -> Result<(), StorageError>;

    /// Up to `limit` records with ids strictly greater than `after`, in
    /// ascending id order. An empty page means the scan is complete.
    async fn scan_page(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<VectorRecord>, StorageError>;

    /// Release the backing handle. Further operations fail with
    /// `StorageError::Unavailable`.
    async fn close(&self) -> Result<(), StorageError>;
}
