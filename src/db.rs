//! The `VectorDb` façade: write ordering across storage, index, caches and
//! the coalescer, plus lifecycle, validation, import/export, and rebuild.
//!
//! # Write path
//!
//! ```text
//! insert ─ validate ─ prepare vector ─ assign id ─ coalescer.put (enqueue)
//!        └─ index.add ─ cache.set ─ return id        └─ … put_batch later
//! ```
//!
//! The index and cache are updated at caller-visible completion of an
//! insert while the durable write may trail by at most the flush interval;
//! a crash inside that window loses the record, and the index regains
//! agreement with storage at the next `initialize` (full load + build).
//!
//! # Concurrency contract
//!
//! One logical writer per instance: callers must not overlap mutating
//! operations. Concurrent reads (`search`, `size`, `export`) against a
//! quiescent writer are safe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};

use crate::cache::VectorCache;
use crate::coalescer::BatchCoalescer;
use crate::config::DbConfig;
use crate::embedding::{initialize_with_retry, EmbeddingCache, EmbeddingGenerator};
use crate::envelope::{EnvelopeMetadata, ExportChunk, ExportEnvelope, ENVELOPE_VERSION};
use crate::error::DbError;
use crate::filter::QueryFilter;
use crate::index::{AnnIndex, HnswIndex, IndexStats};
use crate::loader::ProgressiveLoader;
use crate::record::{
    now_millis, sanitize_metadata, IdGenerator, VectorRecord, META_CONTENT, META_TIMESTAMP,
};
use crate::storage::{FileStorage, MemoryStorage, Storage};

/// Input to [`VectorDb::insert`] and [`VectorDb::insert_batch`].
#[derive(Debug, Clone, Default)]
pub struct InsertData {
    pub vector: Option<Vec<f32>>,
    pub text: Option<String>,
    pub metadata: Option<Map<String, Value>>,
}

impl InsertData {
    pub fn from_vector(vector: Vec<f32>) -> Self {
        Self {
            vector: Some(vector),
            ..Self::default()
        }
    }

    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Partial update applied by [`VectorDb::update`].
#[derive(Debug, Clone, Default)]
pub struct UpdatePatch {
    pub vector: Option<Vec<f32>>,
    pub text: Option<String>,
    pub metadata: Option<Map<String, Value>>,
}

/// A search request: exactly one of `vector` or `text` must be present.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub vector: Option<Vec<f32>>,
    pub text: Option<String>,
    pub k: usize,
    pub filter: Option<QueryFilter>,
    /// Hydrate full vectors into the results via cache → storage.
    pub include_vectors: bool,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            vector: None,
            text: None,
            k: 10,
            filter: None,
            include_vectors: false,
        }
    }
}

impl SearchQuery {
    pub fn from_vector(vector: Vec<f32>) -> Self {
        Self {
            vector: Some(vector),
            ..Self::default()
        }
    }

    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    pub fn with_filter(mut self, filter: QueryFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_vectors(mut self) -> Self {
        self.include_vectors = true;
        self
    }
}

/// One search result.
#[derive(Debug, Clone)]
pub struct SearchMatch {
    pub id: String,
    pub score: f32,
    pub metadata: Map<String, Value>,
    pub vector: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Copy)]
pub struct ExportOptions {
    pub include_index: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            include_index: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ImportOptions {
    pub clear_existing: bool,
}

/// The embeddable vector database.
pub struct VectorDb {
    config: DbConfig,
    loader: ProgressiveLoader,
    id_gen: IdGenerator,
    embedder: Option<Arc<dyn EmbeddingGenerator>>,
    embedder_ready: AtomicBool,
    initialized: AtomicBool,
    storage: RwLock<Option<Arc<dyn Storage>>>,
    coalescer: RwLock<Option<Arc<BatchCoalescer>>>,
    index: RwLock<Box<dyn AnnIndex>>,
    vector_cache: Mutex<VectorCache>,
    embedding_cache: Mutex<EmbeddingCache>,
}

fn build_index(config: &DbConfig) -> Box<dyn AnnIndex> {
    Box::new(HnswIndex::new(
        config.index.metric.into(),
        config.index.dimensions,
        config.index.hnsw_m,
        config.index.hnsw_ef_construction,
        config.index.hnsw_ef_search,
    ))
}

impl VectorDb {
    /// Create a database without an embedding generator; text operations
    /// will fail with [`DbError::ModelLoad`].
    pub fn new(config: DbConfig) -> Result<Self, DbError> {
        Self::build(config, None)
    }

    /// Create a database with an embedding generator for text operations.
    pub fn with_embedder(
        config: DbConfig,
        embedder: Arc<dyn EmbeddingGenerator>,
    ) -> Result<Self, DbError> {
        Self::build(config, Some(embedder))
    }

    fn build(
        config: DbConfig,
        embedder: Option<Arc<dyn EmbeddingGenerator>>,
    ) -> Result<Self, DbError> {
        config.validate()?;
        let ttl = config
            .performance
            .embedding_cache_ttl_ms
            .map(Duration::from_millis);
        Ok(Self {
            loader: ProgressiveLoader::new(config.performance.chunk_size),
            id_gen: IdGenerator::new(),
            embedder,
            embedder_ready: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            storage: RwLock::new(None),
            coalescer: RwLock::new(None),
            index: RwLock::new(build_index(&config)),
            vector_cache: Mutex::new(VectorCache::new(config.performance.cache_bytes)),
            embedding_cache: Mutex::new(EmbeddingCache::new(
                config.performance.embedding_cache_entries,
                ttl,
            )),
            config,
        })
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    fn dimensions(&self) -> usize {
        self.config.index.dimensions
    }

    /// Open storage, build the index from it, and (unless lazy) load the
    /// embedding model. Idempotent; failures run cleanup and surface as
    /// [`DbError::Init`].
    pub async fn initialize(&self) -> Result<(), DbError> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(err) = self.initialize_inner().await {
            self.cleanup().await;
            return Err(DbError::Init(Box::new(err)));
        }
        Ok(())
    }

    async fn initialize_inner(&self) -> Result<(), DbError> {
        let storage: Arc<dyn Storage> = match &self.config.storage.dir {
            Some(dir) => {
                let path = dir.join(format!("{}.qdb", self.config.storage.db_name));
                Arc::new(FileStorage::open(path, self.config.storage.max_bytes)?)
            }
            None => Arc::new(MemoryStorage::new()),
        };

        let records = storage.get_all().await?;
        {
            let mut index = self.index.write();
            *index = build_index(&self.config);
            index.build(&records)?;
        }

        let coalescer = BatchCoalescer::new(
            storage.clone(),
            self.config.performance.batch_max_size,
            Duration::from_millis(self.config.performance.batch_flush_ms),
        );

        *self.storage.write() = Some(storage);
        *self.coalescer.write() = Some(coalescer);

        if self.embedder.is_some() && !self.config.performance.lazy_load_models {
            self.ensure_embedder().await?;
        }

        self.initialized.store(true, Ordering::SeqCst);
        tracing::debug!(
            records = records.len(),
            dimensions = self.dimensions(),
            "database initialized"
        );
        Ok(())
    }

    async fn cleanup(&self) {
        // Take the handles out first; lock guards must not live across the
        // awaits below.
        let coalescer = self.coalescer.write().take();
        if let Some(coalescer) = coalescer {
            let _ = coalescer.flush().await;
        }
        let storage = self.storage.write().take();
        if let Some(storage) = storage {
            let _ = storage.close().await;
        }
        self.index.write().clear();
        self.vector_cache.lock().clear();
        self.embedding_cache.lock().clear();
        self.initialized.store(false, Ordering::SeqCst);
    }

    fn ensure_initialized(&self) -> Result<(), DbError> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DbError::NotInitialized)
        }
    }

    fn storage_handle(&self) -> Result<Arc<dyn Storage>, DbError> {
        self.storage
            .read()
            .clone()
            .ok_or(DbError::NotInitialized)
    }

    fn coalescer_handle(&self) -> Result<Arc<BatchCoalescer>, DbError> {
        self.coalescer
            .read()
            .clone()
            .ok_or(DbError::NotInitialized)
    }

    /// Load the embedding model on first use, retrying with exponential
    /// backoff, and verify its dimensionality against the configuration.
    async fn ensure_embedder(&self) -> Result<Arc<dyn EmbeddingGenerator>, DbError> {
        let generator = self
            .embedder
            .clone()
            .ok_or_else(|| DbError::ModelLoad("no embedding generator configured".into()))?;
        if self.embedder_ready.load(Ordering::SeqCst) {
            return Ok(generator);
        }
        initialize_with_retry(
            generator.as_ref(),
            self.config.embedding.max_retries,
            Duration::from_millis(self.config.embedding.retry_delay_ms),
        )
        .await?;
        let dims = generator.dimensions();
        if dims != self.dimensions() {
            return Err(DbError::DimensionMismatch {
                expected: self.dimensions(),
                actual: dims,
            });
        }
        self.embedder_ready.store(true, Ordering::SeqCst);
        Ok(generator)
    }

    fn check_dim(&self, vector: &[f32]) -> Result<(), DbError> {
        if vector.len() != self.dimensions() {
            return Err(DbError::DimensionMismatch {
                expected: self.dimensions(),
                actual: vector.len(),
            });
        }
        Ok(())
    }

    /// Resolve text to a vector through the embedding cache.
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>, DbError> {
        if self.config.embedding.cache {
            if let Some(vector) = self.embedding_cache.lock().get(text) {
                return Ok(vector);
            }
        }
        let generator = self.ensure_embedder().await?;
        let vector = generator.embed(text).await?;
        self.check_dim(&vector)?;
        if self.config.embedding.cache {
            self.embedding_cache.lock().put(text, vector.clone());
        }
        Ok(vector)
    }

    async fn prepare_vector(
        &self,
        vector: Option<Vec<f32>>,
        text: Option<&str>,
    ) -> Result<Vec<f32>, DbError> {
        match (vector, text) {
            (Some(vector), _) => {
                self.check_dim(&vector)?;
                Ok(vector)
            }
            (None, Some(text)) => self.embed_text(text).await,
            (None, None) => unreachable!("callers validate presence"),
        }
    }

    fn cache_record(&self, record: &VectorRecord) {
        let size = VectorCache::estimate_size(record);
        self.vector_cache.lock().set(&record.id, record.clone(), size);
    }

    /// Insert one record, returning its id.
    pub async fn insert(&self, data: InsertData) -> Result<String, DbError> {
        self.ensure_initialized()?;
        if data.vector.is_none() && data.text.is_none() {
            return Err(DbError::InvalidInsertData(
                "either vector or text is required".into(),
            ));
        }

        let vector = self
            .prepare_vector(data.vector, data.text.as_deref())
            .await?;
        let timestamp = now_millis();
        let metadata = sanitize_metadata(data.metadata, data.text.as_deref(), timestamp);
        let record = VectorRecord {
            id: self.id_gen.next(),
            vector,
            metadata,
            timestamp,
        };

        // Enqueue the durable write first; the ticket is intentionally not
        // awaited (see the module docs on the crash window).
        let coalescer = self.coalescer_handle()?;
        let _ticket = coalescer.put(record.clone()).await;

        self.index.write().add(&record)?;
        self.cache_record(&record);
        Ok(record.id)
    }

    /// Insert many records with one storage batch and one index batch,
    /// bypassing the coalescer (the input is already a batch). Returns ids
    /// in input order.
    pub async fn insert_batch(&self, items: Vec<InsertData>) -> Result<Vec<String>, DbError> {
        self.ensure_initialized()?;
        for (i, item) in items.iter().enumerate() {
            if item.vector.is_none() && item.text.is_none() {
                return Err(DbError::InvalidInsertData(format!(
                    "item {i}: either vector or text is required"
                )));
            }
        }

        let mut records = Vec::with_capacity(items.len());
        for item in items {
            let vector = self
                .prepare_vector(item.vector, item.text.as_deref())
                .await?;
            let timestamp = now_millis();
            let metadata = sanitize_metadata(item.metadata, item.text.as_deref(), timestamp);
            records.push(VectorRecord {
                id: self.id_gen.next(),
                vector,
                metadata,
                timestamp,
            });
        }

        self.storage_handle()?.put_batch(&records).await?;
        self.index.write().add_batch(&records)?;
        for record in &records {
            self.cache_record(record);
        }
        Ok(records.into_iter().map(|r| r.id).collect())
    }

    /// Top-k similarity search.
    pub async fn search(&self, query: SearchQuery) -> Result<Vec<SearchMatch>, DbError> {
        self.ensure_initialized()?;
        let vector = match (query.vector, query.text.as_deref()) {
            (Some(vector), _) => {
                self.check_dim(&vector)?;
                vector
            }
            (None, Some(text)) => self.embed_text(text).await?,
            (None, None) => {
                return Err(DbError::InvalidQuery(
                    "either vector or text is required".into(),
                ))
            }
        };

        let hits = self
            .index
            .read()
            .search(&vector, query.k, query.filter.as_ref())?;

        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            let vector = if query.include_vectors {
                Some(self.hydrate_vector(&hit.id).await?)
            } else {
                None
            };
            results.push(SearchMatch {
                id: hit.id,
                score: hit.score,
                metadata: hit.metadata,
                vector,
            });
        }
        Ok(results)
    }

    /// Full vector for a result id, through the cache with a storage
    /// fallback and cache fill.
    async fn hydrate_vector(&self, id: &str) -> Result<Vec<f32>, DbError> {
        if let Some(record) = self.vector_cache.lock().get(id) {
            return Ok(record.vector);
        }
        let storage = self.storage_handle()?;
        let record = match storage.get(id).await? {
            Some(record) => record,
            None => {
                // The put may still be riding in the coalescer; settle it
                // and look once more before declaring disagreement.
                self.coalescer_handle()?.flush().await?;
                storage.get(id).await?.ok_or_else(|| {
                    DbError::IndexCorrupted(format!("record '{id}' is indexed but not stored"))
                })?
            }
        };
        self.cache_record(&record);
        Ok(record.vector)
    }

    /// Delete by id. Returns whether the record existed.
    pub async fn delete(&self, id: &str) -> Result<bool, DbError> {
        self.ensure_initialized()?;
        let existed = self.coalescer_handle()?.delete(id).await?;
        if existed {
            self.vector_cache.lock().delete(id);
            self.index.write().remove(id);
        }
        Ok(existed)
    }

    /// Read-modify-write update. Never coalesced: the rewrite goes straight
    /// to storage to preserve read-your-writes. Returns false when the id
    /// is absent.
    pub async fn update(&self, id: &str, patch: UpdatePatch) -> Result<bool, DbError> {
        self.ensure_initialized()?;
        let coalescer = self.coalescer_handle()?;
        coalescer.flush().await?;

        let storage = self.storage_handle()?;
        let Some(mut record) = storage.get(id).await? else {
            return Ok(false);
        };

        let timestamp = now_millis();
        if let Some(patch_meta) = patch.metadata {
            let sanitized = sanitize_metadata(Some(patch_meta), None, timestamp);
            for (key, value) in sanitized {
                record.metadata.insert(key, value);
            }
        }
        if let Some(vector) = patch.vector {
            self.check_dim(&vector)?;
            record.vector = vector;
        } else if let Some(text) = patch.text.as_deref() {
            record.vector = self.embed_text(text).await?;
            record
                .metadata
                .insert(META_CONTENT.to_string(), Value::from(text));
        }
        record.timestamp = timestamp;
        record
            .metadata
            .insert(META_TIMESTAMP.to_string(), Value::from(timestamp));

        storage.put(&record).await?;
        {
            let mut index = self.index.write();
            index.remove(id);
            index.add(&record)?;
        }
        self.cache_record(&record);
        Ok(true)
    }

    /// Remove every record from storage, index, and caches.
    pub async fn clear(&self) -> Result<(), DbError> {
        self.ensure_initialized()?;
        self.coalescer_handle()?.flush().await?;
        self.storage_handle()?.clear().await?;
        self.index.write().clear();
        self.vector_cache.lock().clear();
        self.embedding_cache.lock().clear();
        Ok(())
    }

    /// Number of live records.
    pub async fn size(&self) -> Result<usize, DbError> {
        self.ensure_initialized()?;
        // Settle pending coalesced writes so the count reflects every
        // operation the caller has seen complete.
        self.coalescer_handle()?.flush().await?;
        Ok(self.storage_handle()?.count().await?)
    }

    /// Statistics of the live index.
    pub fn index_stats(&self) -> IndexStats {
        self.index.read().stats()
    }

    /// Export everything into a single envelope.
    pub async fn export(&self, options: ExportOptions) -> Result<ExportEnvelope, DbError> {
        self.ensure_initialized()?;
        self.coalescer_handle()?.flush().await?;
        let storage = self.storage_handle()?;

        let mut vectors = Vec::new();
        self.loader
            .stream_process(storage.as_ref(), |record| {
                vectors.push(record);
                std::future::ready(())
            })
            .await?;

        let index = if options.include_index {
            BASE64.encode(self.index.read().serialize())
        } else {
            String::new()
        };

        Ok(ExportEnvelope {
            version: ENVELOPE_VERSION.to_string(),
            config: self.config.clone(),
            metadata: EnvelopeMetadata {
                exported_at: now_millis(),
                vector_count: vectors.len(),
                dimensions: self.dimensions(),
            },
            vectors,
            index,
        })
    }

    /// Streaming export: metadata first, then vector chunks, then the
    /// optional index. The caller pulls chunks, so the storage cursor is
    /// driven from the outside and every full chunk yields.
    pub async fn export_stream(&self, options: ExportOptions) -> Result<ExportStream, DbError> {
        self.ensure_initialized()?;
        self.coalescer_handle()?.flush().await?;
        let storage = self.storage_handle()?;
        let vector_count = storage.count().await?;

        let index = if options.include_index {
            Some(BASE64.encode(self.index.read().serialize()))
        } else {
            None
        };

        Ok(ExportStream {
            storage,
            chunk_size: self.loader.chunk_size(),
            state: StreamState::Metadata,
            header: Some((
                ENVELOPE_VERSION.to_string(),
                self.config.clone(),
                EnvelopeMetadata {
                    exported_at: now_millis(),
                    vector_count,
                    dimensions: self.dimensions(),
                },
            )),
            index,
            after: None,
        })
    }

    /// Import an envelope. All validation happens before any mutation; a
    /// corrupted serialized index degrades to a rebuild instead of failing.
    pub async fn import(
        &self,
        envelope: ExportEnvelope,
        options: ImportOptions,
    ) -> Result<usize, DbError> {
        self.ensure_initialized()?;
        envelope.check_version()?;

        if envelope.metadata.dimensions != self.dimensions() {
            return Err(DbError::DimensionMismatch {
                expected: self.dimensions(),
                actual: envelope.metadata.dimensions,
            });
        }
        if envelope.vectors.len() != envelope.metadata.vector_count {
            return Err(DbError::InvalidExportData(format!(
                "vector count mismatch: {} records, metadata says {}",
                envelope.vectors.len(),
                envelope.metadata.vector_count
            )));
        }
        for record in &envelope.vectors {
            if record.vector.len() != self.dimensions() {
                return Err(DbError::DimensionMismatch {
                    expected: self.dimensions(),
                    actual: record.vector.len(),
                });
            }
        }

        let had_records = {
            self.coalescer_handle()?.flush().await?;
            self.storage_handle()?.count().await? > 0
        };
        if options.clear_existing {
            self.clear().await?;
        }

        let storage = self.storage_handle()?;
        self.loader
            .import_in_batches(storage.as_ref(), &envelope.vectors, |loaded, total| {
                tracing::debug!(loaded, total, "import progress");
            })
            .await?;

        // The serialized index covers exactly the envelope's records, so it
        // only applies when they are the whole database.
        let whole_db = options.clear_existing || !had_records;
        let mut restored = false;
        if whole_db && !envelope.index.is_empty() {
            match BASE64.decode(envelope.index.as_bytes()) {
                Ok(bytes) => match self.index.write().deserialize(&bytes) {
                    Ok(()) => restored = true,
                    Err(err) => {
                        tracing::warn!(error = %err, "serialized index rejected; rebuilding");
                    }
                },
                Err(err) => {
                    tracing::warn!(error = %err, "index payload is not valid base64; rebuilding");
                }
            }
        }
        if !restored {
            self.rebuild_index().await?;
        }

        Ok(envelope.vectors.len())
    }

    /// Parse and import a raw JSON document.
    pub async fn import_json(
        &self,
        value: serde_json::Value,
        options: ImportOptions,
    ) -> Result<usize, DbError> {
        let envelope = ExportEnvelope::from_value(value)?;
        self.import(envelope, options).await
    }

    /// Reload the index from storage.
    pub async fn rebuild_index(&self) -> Result<(), DbError> {
        let records = self.storage_handle()?.get_all().await?;
        self.index.write().build(&records)?;
        Ok(())
    }

    /// Flush pending writes and release every resource. The database can
    /// be re-initialized afterwards.
    pub async fn dispose(&self) -> Result<(), DbError> {
        let coalescer = self.coalescer.write().take();
        if let Some(coalescer) = coalescer {
            coalescer.flush().await?;
        }
        let storage = self.storage.write().take();
        if let Some(storage) = storage {
            storage.close().await?;
        }
        self.index.write().clear();
        self.vector_cache.lock().clear();
        self.embedding_cache.lock().clear();
        if let Some(embedder) = &self.embedder {
            embedder.dispose().await;
        }
        self.embedder_ready.store(false, Ordering::SeqCst);
        self.initialized.store(false, Ordering::SeqCst);
        Ok(())
    }
}

enum StreamState {
    Metadata,
    Vectors,
    Index,
    Done,
}

/// Pull-based streaming export created by [`VectorDb::export_stream`].
pub struct ExportStream {
    storage: Arc<dyn Storage>,
    chunk_size: usize,
    state: StreamState,
    header: Option<(String, DbConfig, EnvelopeMetadata)>,
    index: Option<String>,
    after: Option<String>,
}

impl ExportStream {
    /// Next chunk in envelope order, or `None` when exhausted.
    pub async fn next_chunk(&mut self) -> Option<Result<ExportChunk, DbError>> {
        loop {
            match self.state {
                StreamState::Metadata => {
                    self.state = StreamState::Vectors;
                    let (version, config, metadata) =
                        self.header.take().expect("metadata emitted once");
                    return Some(Ok(ExportChunk::Metadata {
                        version,
                        config,
                        metadata,
                    }));
                }
                StreamState::Vectors => {
                    let page = match self
                        .storage
                        .scan_page(self.after.as_deref(), self.chunk_size)
                        .await
                    {
                        Ok(page) => page,
                        Err(err) => {
                            self.state = StreamState::Done;
                            return Some(Err(err.into()));
                        }
                    };
                    if page.is_empty() {
                        self.state = StreamState::Index;
                        continue;
                    }
                    self.after = page.last().map(|r| r.id.clone());
                    return Some(Ok(ExportChunk::Vectors(page)));
                }
                StreamState::Index => {
                    self.state = StreamState::Done;
                    if let Some(index) = self.index.take() {
                        return Some(Ok(ExportChunk::Index(index)));
                    }
                }
                StreamState::Done => return None,
            }
        }
    }
}
