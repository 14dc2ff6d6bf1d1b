// Retrieval pipeline
// Ingestion (chunk, embed, index, record) and query (embed, search, assemble context)

#[cfg(test)]
mod tests;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{Config, validate_namespace};
use crate::database::index::IndexSettings;
use crate::database::sqlite::models::{NamespaceStats, NamespaceSummary, NewVectorRecord};
use crate::database::{Database, Metadata, SearchResult, VectorEntry, VectorIndex};
use crate::embeddings::{Chunk, ChunkingConfig, EmbeddingProvider, chunk_document};
use crate::{KbError, Result};

/// Where a document comes from and how its chunks should be tagged
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceMetadata {
    /// Stable id of the document; a UUID is generated when absent
    pub source_id: Option<String>,
    /// Target namespace; the pipeline default when absent
    pub namespace: Option<String>,
    /// Tags copied onto every chunk
    #[serde(default)]
    pub tags: Metadata,
}

impl SourceMetadata {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn with_source_id(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    #[inline]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    #[inline]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStatus {
    Success,
    Failed,
}

impl fmt::Display for IngestStatus {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            IngestStatus::Success => write!(f, "success"),
            IngestStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of one `ingest` call. Failures are reported here, never raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestSummary {
    pub source_id: String,
    pub namespace: String,
    pub chunk_count: usize,
    /// Chunks whose vector reached the index
    pub vector_count: usize,
    pub status: IngestStatus,
    pub error: Option<String>,
}

impl IngestSummary {
    fn started(source_id: String, namespace: String) -> Self {
        Self {
            source_id,
            namespace,
            chunk_count: 0,
            vector_count: 0,
            status: IngestStatus::Success,
            error: None,
        }
    }

    fn failed(mut self, error: &KbError) -> Self {
        self.status = IngestStatus::Failed;
        self.error = Some(error.to_string());
        self
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        self.status == IngestStatus::Success
    }
}

/// A retrieval request; unset fields fall back to the pipeline defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub text: String,
    pub namespace: Option<String>,
    pub top_k: Option<usize>,
    pub threshold: Option<f32>,
    #[serde(default)]
    pub filter: Metadata,
}

impl QueryRequest {
    #[inline]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    #[inline]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    #[inline]
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    #[inline]
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = Some(threshold);
        self
    }

    #[inline]
    pub fn with_filter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub namespace: String,
    /// Best match first
    pub results: Vec<SearchResult>,
    /// Result texts merged for the generation step
    pub context: String,
}

impl QueryResponse {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Values used when a request leaves them unset
#[derive(Debug, Clone, PartialEq)]
pub struct QueryDefaults {
    pub namespace: String,
    pub top_k: usize,
    pub threshold: f32,
}

impl QueryDefaults {
    #[inline]
    pub fn from_config(config: &Config) -> Self {
        Self {
            namespace: config.index.namespace.clone(),
            top_k: config.index.top_k,
            threshold: config.index.score_threshold,
        }
    }
}

/// Ingestion and retrieval over a vector index paired with a metadata store.
///
/// Every mutation of a namespace holds that namespace's write lock across both
/// stores, so writers to one namespace never interleave their two halves.
pub struct RetrievalPipeline {
    index: Arc<VectorIndex>,
    database: Database,
    embedder: Arc<dyn EmbeddingProvider>,
    chunking: ChunkingConfig,
    defaults: QueryDefaults,
    write_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RetrievalPipeline {
    #[inline]
    pub fn new(
        index: Arc<VectorIndex>,
        database: Database,
        embedder: Arc<dyn EmbeddingProvider>,
        chunking: ChunkingConfig,
        defaults: QueryDefaults,
    ) -> Self {
        Self {
            index,
            database,
            embedder,
            chunking,
            defaults,
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Open both stores described by `config` and bring up the vector index
    #[inline]
    pub async fn open(config: &Config, embedder: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        let database = Database::initialize_from_config_dir(config.get_base_dir())
            .await
            .map_err(|e| KbError::MetadataRead(format!("{:#}", e)))?;

        let index = Arc::new(VectorIndex::new(
            IndexSettings::from_config(config),
            Arc::clone(&embedder),
        ));
        index.initialize().await?;

        Ok(Self::new(
            index,
            database,
            embedder,
            config.chunking.clone(),
            QueryDefaults::from_config(config),
        ))
    }

    #[inline]
    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    #[inline]
    pub fn database(&self) -> &Database {
        &self.database
    }

    #[inline]
    pub fn defaults(&self) -> &QueryDefaults {
        &self.defaults
    }

    /// Chunk, embed and store a document.
    ///
    /// Chunks are written in order. A failure stops the run and is reported in the
    /// summary; chunks written before it stay in place. Once every chunk is written,
    /// chunks of an earlier version of the same source that the new version no longer
    /// produces are removed from both stores.
    #[inline]
    pub async fn ingest(&self, raw_text: &str, source: &SourceMetadata) -> IngestSummary {
        let source_id = source
            .source_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let namespace = source
            .namespace
            .clone()
            .unwrap_or_else(|| self.defaults.namespace.clone());

        let mut summary = IngestSummary::started(source_id, namespace);

        if let Err(e) = validate_namespace(&summary.namespace) {
            return summary.failed(&KbError::Config(e.to_string()));
        }

        let chunks = chunk_document(&summary.source_id, raw_text, &self.chunking);
        summary.chunk_count = chunks.len();
        debug!(
            "Ingesting {} chunks from source '{}' into namespace '{}'",
            chunks.len(),
            summary.source_id,
            summary.namespace
        );

        for chunk in &chunks {
            match self.ingest_chunk(chunk, &source.tags, &summary.namespace).await {
                Ok(()) => summary.vector_count += 1,
                Err(e) => {
                    if matches!(e, KbError::MetadataWrite(_)) {
                        summary.vector_count += 1;
                    }
                    error!(
                        "Ingest of source '{}' failed at chunk {}: {}",
                        summary.source_id, chunk.index, e
                    );
                    return summary.failed(&e);
                }
            }
        }

        let current: HashSet<String> = chunks.iter().map(chunk_id).collect();
        match self
            .remove_stale_chunks(&summary.source_id, &summary.namespace, &current)
            .await
        {
            Ok(0) => {}
            Ok(removed) => info!(
                "Removed {} stale chunks of source '{}'",
                removed, summary.source_id
            ),
            Err(e) => {
                error!(
                    "Ingest of source '{}' could not remove stale chunks: {}",
                    summary.source_id, e
                );
                return summary.failed(&e);
            }
        }

        info!(
            "Ingested source '{}': {} chunks into namespace '{}'",
            summary.source_id, summary.vector_count, summary.namespace
        );
        summary
    }

    async fn ingest_chunk(&self, chunk: &Chunk, tags: &Metadata, namespace: &str) -> Result<()> {
        let embedding = self.embedder.embed(&chunk.text).await?;

        let mut metadata = tags.clone();
        metadata.insert("source_id".to_string(), Value::from(chunk.source_id.as_str()));
        metadata.insert("chunk_index".to_string(), Value::from(chunk.index));
        metadata.insert("total_chunks".to_string(), Value::from(chunk.total_chunks));

        let entry = VectorEntry {
            id: chunk_id(chunk),
            text: chunk.text.clone(),
            metadata,
            embedding,
        };

        self.record_entry(&entry, namespace).await
    }

    /// Write one entry to the vector index, then to the metadata store.
    ///
    /// The two writes are not transactional. If the second one fails the index entry
    /// stays orphaned and [`KbError::MetadataWrite`] is returned.
    #[inline]
    pub async fn record_entry(&self, entry: &VectorEntry, namespace: &str) -> Result<()> {
        let lock = self.write_lock(namespace);
        let _write = lock.lock().await;

        self.index.add(entry, namespace).await?;

        self.database
            .record(&NewVectorRecord::from_entry(entry, namespace))
            .await
            .map_err(|e| {
                warn!(
                    "Entry '{}' indexed but its metadata record failed; index entry is orphaned",
                    entry.id
                );
                KbError::MetadataWrite(format!("{:#}", e))
            })?;
        Ok(())
    }

    /// Delete the chunks recorded for `source_id` whose ids are not in `current`
    async fn remove_stale_chunks(
        &self,
        source_id: &str,
        namespace: &str,
        current: &HashSet<String>,
    ) -> Result<u64> {
        let lock = self.write_lock(namespace);
        let _write = lock.lock().await;

        let stale: Vec<String> = self
            .database
            .source_record_ids(namespace, source_id)
            .await
            .map_err(|e| KbError::MetadataRead(format!("{:#}", e)))?
            .into_iter()
            .filter(|id| !current.contains(id))
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }

        let removed = self.index.delete(&stale, namespace).await?;
        self.database
            .delete_records(namespace, &stale)
            .await
            .map_err(|e| KbError::MetadataWrite(format!("{:#}", e)))?;
        debug!(
            "Stale chunks of source '{}' removed: {}",
            source_id,
            stale.join(", ")
        );
        Ok(removed)
    }

    fn write_lock(&self, namespace: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .write_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(namespace.to_string()).or_default())
    }

    /// Search and assemble context. Zero results is a normal, empty response.
    #[inline]
    pub async fn query(&self, request: &QueryRequest) -> Result<QueryResponse> {
        if request.text.trim().is_empty() {
            return Err(KbError::IndexSearch("query text cannot be empty".to_string()));
        }

        let namespace = request
            .namespace
            .clone()
            .unwrap_or_else(|| self.defaults.namespace.clone());
        let top_k = request.top_k.unwrap_or(self.defaults.top_k);
        let threshold = request.threshold.unwrap_or(self.defaults.threshold);

        let results = self
            .index
            .search(&request.text, &namespace, top_k, threshold, &request.filter)
            .await?;

        if results.is_empty() {
            info!(
                "No results above threshold {} in namespace '{}'",
                threshold, namespace
            );
        }

        let context = assemble_context(&results);
        Ok(QueryResponse {
            namespace,
            results,
            context,
        })
    }

    /// Empty a namespace in both stores, returning how many vectors were removed
    #[inline]
    pub async fn clear_namespace(&self, namespace: &str) -> Result<u64> {
        let lock = self.write_lock(namespace);
        let _write = lock.lock().await;

        let removed = self.index.clear(namespace).await?;
        let records = self
            .database
            .clear_namespace(namespace)
            .await
            .map_err(|e| KbError::MetadataWrite(format!("{:#}", e)))?;

        if records != removed {
            warn!(
                "Namespace '{}' held {} vectors but {} metadata records",
                namespace, removed, records
            );
        }
        Ok(removed)
    }

    #[inline]
    pub async fn stats(&self, namespace: &str) -> Result<NamespaceStats> {
        validate_namespace(namespace).map_err(|e| KbError::Config(e.to_string()))?;
        self.database
            .stats(namespace)
            .await
            .map_err(|e| KbError::MetadataRead(format!("{:#}", e)))
    }

    #[inline]
    pub async fn list_namespaces(&self) -> Result<Vec<NamespaceSummary>> {
        self.database
            .list_namespaces()
            .await
            .map_err(|e| KbError::MetadataRead(format!("{:#}", e)))
    }

    /// Release the vector index and the metadata pool
    #[inline]
    pub async fn close(&self) -> Result<()> {
        self.index.close().await?;
        self.database.close().await;
        Ok(())
    }
}

fn chunk_id(chunk: &Chunk) -> String {
    format!("{}:{}", chunk.source_id, chunk.index)
}

/// Merge result texts, best first, each headed by its source and score
#[inline]
pub fn assemble_context(results: &[SearchResult]) -> String {
    results
        .iter()
        .enumerate()
        .map(|(position, result)| {
            let source = result
                .metadata
                .get("source_id")
                .and_then(Value::as_str)
                .unwrap_or(&result.id);
            format!(
                "[{}] source: {} (score {:.3})\n{}",
                position + 1,
                source,
                result.score,
                result.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
