
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::lancedb::vector_store::LocalVectorStore;
use super::remote::RemoteVectorStore;
use super::{Metadata, SearchResult, VectorEntry};
use crate::config::{BackendKind, Config, RemoteConfig, validate_namespace};
use crate::embeddings::EmbeddingProvider;
use crate::{KbError, Result};

/// Namespace reserved for index bookkeeping; callers can never read or write it
pub const SYSTEM_NAMESPACE: &str = "__system__";

/// Id of the bootstrap entry written into a brand new index
pub const PLACEHOLDER_ID: &str = "__placeholder__";

/// Queries longer than this many characters are cut before embedding
pub const MAX_QUERY_CHARS: usize = 2048;

/// Storage strategy behind a [`VectorIndex`].
///
/// Implementations are constructed already initialized (bootstrap included)
/// and only see validated input: the namespace is never [`SYSTEM_NAMESPACE`]
/// and every entry has the configured dimension.
#[async_trait]
pub trait VectorBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Insert or replace entries by id
    async fn upsert(&self, namespace: &str, entries: &[VectorEntry]) -> Result<()>;

    /// Nearest neighbours inside `namespace` whose metadata matches `filter`.
    /// May return more than `top_k` candidates; ordering ties must follow insertion order.
    async fn query(
        &self,
        namespace: &str,
        vector: &[f32],
        top_k: usize,
        filter: &Metadata,
    ) -> Result<Vec<SearchResult>>;

    /// Remove the listed ids from `namespace`, returning how many were removed
    async fn delete(&self, namespace: &str, ids: &[String]) -> Result<u64>;

    /// Remove every entry of `namespace`, returning how many were removed
    async fn delete_namespace(&self, namespace: &str) -> Result<u64>;

    async fn count(&self, namespace: &str) -> Result<u64>;

    /// Flush pending persistence
    async fn close(&self) -> Result<()>;
}

/// What the index needs from [`Config`]
#[derive(Debug, Clone)]
pub struct IndexSettings {
    pub backend: BackendKind,
    pub dimensions: usize,
    pub location: PathBuf,
    pub remote: RemoteConfig,
}

impl IndexSettings {
    #[inline]
    pub fn from_config(config: &Config) -> Self {
        Self {
            backend: config.index.backend,
            dimensions: config.index.dimensions,
            location: config.vector_database_path(),
            remote: config.remote.clone(),
        }
    }
}

/// Namespaced similarity index over embedded chunks.
///
/// The backend is chosen once by [`VectorIndex::initialize`]. A remote backend
/// that fails to come up is replaced by the local one for the lifetime of this
/// instance. Writes to a namespace are serialized against each other and against
/// searches of that namespace; different namespaces proceed independently.
pub struct VectorIndex {
    settings: IndexSettings,
    embedder: Arc<dyn EmbeddingProvider>,
    backend: RwLock<Option<Box<dyn VectorBackend>>>,
    resolved: OnceLock<BackendKind>,
    fell_back: AtomicBool,
    namespace_locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl VectorIndex {
    #[inline]
    pub fn new(settings: IndexSettings, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            settings,
            embedder,
            backend: RwLock::new(None),
            resolved: OnceLock::new(),
            fell_back: AtomicBool::new(false),
            namespace_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Build an index around an already constructed backend
    #[inline]
    pub fn with_backend(
        settings: IndexSettings,
        embedder: Arc<dyn EmbeddingProvider>,
        backend: Box<dyn VectorBackend>,
    ) -> Self {
        let mut index = Self::new(settings, embedder);
        if index.resolved.set(backend.kind()).is_err() {
            debug!("Backend kind already resolved");
        }
        index.backend = RwLock::new(Some(backend));
        index
    }

    /// Bring up the configured backend. Calling this on a live index is a no-op.
    #[inline]
    pub async fn initialize(&self) -> Result<()> {
        let mut slot = self.backend.write().await;
        if slot.is_some() {
            debug!("Vector index already initialized");
            return Ok(());
        }

        let target = self
            .resolved
            .get()
            .copied()
            .unwrap_or(self.settings.backend);

        let backend: Box<dyn VectorBackend> = match target {
            BackendKind::Local => Box::new(self.open_local().await?),
            BackendKind::Remote => {
                match RemoteVectorStore::connect(&self.settings.remote, self.settings.dimensions)
                    .await
                {
                    Ok(store) => Box::new(store),
                    Err(e) => {
                        warn!(
                            "Remote vector service unavailable, falling back to local index: {}",
                            e
                        );
                        self.fell_back.store(true, Ordering::SeqCst);
                        Box::new(self.open_local().await?)
                    }
                }
            }
        };

        let kind = backend.kind();
        if self.resolved.set(kind).is_err() {
            debug!("Reusing previously resolved {} backend", kind);
        }
        info!("Vector index ready using {} backend", kind);
        *slot = Some(backend);
        Ok(())
    }

    async fn open_local(&self) -> Result<LocalVectorStore> {
        LocalVectorStore::open(&self.settings.location, self.settings.dimensions).await
    }

    /// Backend currently serving requests, `None` before initialization or after close
    #[inline]
    pub async fn active_backend(&self) -> Option<BackendKind> {
        self.backend.read().await.as_ref().map(|b| b.kind())
    }

    /// Whether initialization replaced the remote backend with the local one
    #[inline]
    pub fn fell_back(&self) -> bool {
        self.fell_back.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn dimensions(&self) -> usize {
        self.settings.dimensions
    }

    #[inline]
    pub async fn add(&self, entry: &VectorEntry, namespace: &str) -> Result<()> {
        self.add_batch(std::slice::from_ref(entry), namespace).await
    }

    /// Insert or replace several entries in one backend write
    #[inline]
    pub async fn add_batch(&self, entries: &[VectorEntry], namespace: &str) -> Result<()> {
        let guard = self.backend.read().await;
        let backend = guard.as_ref().ok_or(KbError::NotInitialized)?;

        check_namespace(namespace)?;
        for entry in entries {
            self.check_entry(entry)?;
        }
        if entries.is_empty() {
            return Ok(());
        }

        let lock = self.namespace_lock(namespace);
        let _write = lock.write().await;
        debug!(
            "Writing {} entries to namespace '{}'",
            entries.len(),
            namespace
        );
        backend.upsert(namespace, entries).await
    }

    /// Embed `query` and return up to `top_k` entries of `namespace` scoring at least `threshold`
    #[inline]
    pub async fn search(
        &self,
        query: &str,
        namespace: &str,
        top_k: usize,
        threshold: f32,
        filter: &Metadata,
    ) -> Result<Vec<SearchResult>> {
        let guard = self.backend.read().await;
        let backend = guard.as_ref().ok_or(KbError::NotInitialized)?;

        check_namespace(namespace)?;
        if threshold.is_nan() {
            return Err(KbError::IndexSearch(
                "score threshold must be a number".to_string(),
            ));
        }
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let query = truncate_query(query);
        let vector = self.embedder.embed(query).await?;
        if vector.len() != self.settings.dimensions {
            return Err(KbError::IndexSearch(format!(
                "query embedding has {} dimensions, index expects {}",
                vector.len(),
                self.settings.dimensions
            )));
        }

        let lock = self.namespace_lock(namespace);
        let _read = lock.read().await;
        let candidates = backend.query(namespace, &vector, top_k, filter).await?;
        let results = rank_results(candidates, top_k, threshold);

        debug!(
            "Search in namespace '{}' returned {} results",
            namespace,
            results.len()
        );
        Ok(results)
    }

    /// Remove the listed ids from `namespace`, returning how many were removed
    #[inline]
    pub async fn delete(&self, ids: &[String], namespace: &str) -> Result<u64> {
        let guard = self.backend.read().await;
        let backend = guard.as_ref().ok_or(KbError::NotInitialized)?;
        check_namespace(namespace)?;
        if ids.is_empty() {
            return Ok(0);
        }

        let lock = self.namespace_lock(namespace);
        let _write = lock.write().await;
        let removed = backend.delete(namespace, ids).await?;
        debug!("Deleted {} entries from namespace '{}'", removed, namespace);
        Ok(removed)
    }

    /// Remove every entry of `namespace`, returning how many were removed
    #[inline]
    pub async fn clear(&self, namespace: &str) -> Result<u64> {
        let guard = self.backend.read().await;
        let backend = guard.as_ref().ok_or(KbError::NotInitialized)?;
        check_namespace(namespace)?;

        let lock = self.namespace_lock(namespace);
        let _write = lock.write().await;
        let removed = backend.delete_namespace(namespace).await?;
        info!("Cleared {} entries from namespace '{}'", removed, namespace);
        Ok(removed)
    }

    #[inline]
    pub async fn count(&self, namespace: &str) -> Result<u64> {
        let guard = self.backend.read().await;
        let backend = guard.as_ref().ok_or(KbError::NotInitialized)?;
        check_namespace(namespace)?;

        let lock = self.namespace_lock(namespace);
        let _read = lock.read().await;
        backend.count(namespace).await
    }

    /// Flush and release the backend. Later calls fail with [`KbError::NotInitialized`].
    #[inline]
    pub async fn close(&self) -> Result<()> {
        let backend = self
            .backend
            .write()
            .await
            .take()
            .ok_or(KbError::NotInitialized)?;
        backend.close().await?;
        info!("Vector index closed");
        Ok(())
    }

    fn check_entry(&self, entry: &VectorEntry) -> Result<()> {
        if entry.id.trim().is_empty() {
            return Err(KbError::IndexWrite("entry id cannot be empty".to_string()));
        }
        if entry.id == PLACEHOLDER_ID {
            return Err(KbError::IndexWrite(format!(
                "entry id '{}' is reserved",
                entry.id
            )));
        }
        if entry.embedding.len() != self.settings.dimensions {
            return Err(KbError::IndexWrite(format!(
                "entry '{}' has {} dimensions, index expects {}",
                entry.id,
                entry.embedding.len(),
                self.settings.dimensions
            )));
        }
        Ok(())
    }

    fn namespace_lock(&self, namespace: &str) -> Arc<RwLock<()>> {
        let mut locks = self
            .namespace_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(namespace.to_string()).or_default())
    }
}

fn check_namespace(namespace: &str) -> Result<()> {
    validate_namespace(namespace).map_err(|e| KbError::Config(e.to_string()))
}

/// Cut `query` to at most [`MAX_QUERY_CHARS`] characters
#[inline]
pub fn truncate_query(query: &str) -> &str {
    match query.char_indices().nth(MAX_QUERY_CHARS) {
        Some((cut, _)) => {
            debug!(
                "Query truncated from {} to {} characters before embedding",
                query.chars().count(),
                MAX_QUERY_CHARS
            );
            query.get(..cut).unwrap_or(query)
        }
        None => query,
    }
}

/// Drop the placeholder and anything under `threshold`, then keep the best `top_k`.
/// The sort is stable so equal scores keep the backend's insertion order.
fn rank_results(
    mut candidates: Vec<SearchResult>,
    top_k: usize,
    threshold: f32,
) -> Vec<SearchResult> {
    candidates.retain(|r| r.id != PLACEHOLDER_ID && r.score >= threshold);
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    candidates.truncate(top_k);
    candidates
}
