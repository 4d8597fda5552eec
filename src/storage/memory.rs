//! In-memory storage backend.
//!
//! Selected when the configuration gives no data directory; also the
//! workhorse of the test suite.

use std::collections::BTreeMap;
use std::ops::Bound;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::Storage;
use crate::error::StorageError;
use crate::record::VectorRecord;

#[derive(Default)]
struct Inner {
    records: BTreeMap<String, VectorRecord>,
    closed: bool,
}

#[derive(Default)]
pub struct MemoryStorage {
    inner: RwLock<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn ensure_open(inner: &Inner) -> Result<(), StorageError> {
    if inner.closed {
        Err(StorageError::Unavailable("storage handle closed".into()))
    } else {
        Ok(())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn put(&self, record: &VectorRecord) -> Result<(), StorageError> {
        let mut inner = self.inner.write();
        ensure_open(&inner)?;
        inner.records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn put_batch(&self, records: &[VectorRecord]) -> Result<(), StorageError> {
        let mut inner = self.inner.write();
        ensure_open(&inner)?;
        for record in records {
            inner.records.insert(record.id.clone(), record.clone());
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<VectorRecord>, StorageError> {
        let inner = self.inner.read();
        ensure_open(&inner)?;
        Ok(inner.records.get(id).cloned())
    }

    async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        let mut inner = self.inner.write();
        ensure_open(&inner)?;
        Ok(inner.records.remove(id).is_some())
    }

    async fn get_all(&self) -> Result<Vec<VectorRecord>, StorageError> {
        let inner = self.inner.read();
        ensure_open(&inner)?;
        Ok(inner.records.values().cloned().collect())
    }

    async fn count(&self) -> Result<usize, StorageError> {
        let inner = self.inner.read();
        ensure_open(&inner)?;
        Ok(inner.records.len())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.write();
        ensure_open(&inner)?;
        inner.records.clear();
        Ok(())
    }

    async fn scan_page(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<VectorRecord>, StorageError> {
        let inner = self.inner.read();
        ensure_open(&inner)?;
        let lower = match after {
            Some(id) => Bound::Excluded(id.to_string()),
            None => Bound::Unbounded,
        };
        Ok(inner
            .records
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.inner.write().closed = true;
        Ok(())
    }
}
