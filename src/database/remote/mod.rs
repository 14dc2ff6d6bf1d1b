// Remote vector service backend
// JSON over HTTP; blocking ureq calls run on the tokio blocking pool


use anyhow::{Context, anyhow};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{BackendKind, RemoteConfig};
use crate::database::index::{PLACEHOLDER_ID, SYSTEM_NAMESPACE, VectorBackend};
use crate::database::{Metadata, SearchResult, VectorEntry, matches_filter};
use crate::{KbError, Result};

/// Metadata key carrying the chunk text on the remote side
pub const TEXT_KEY: &str = "text";

#[derive(Debug, Serialize)]
struct UpsertRequest<'a> {
    vectors: Vec<RemoteVector<'a>>,
    namespace: &'a str,
}

#[derive(Debug, Serialize)]
struct RemoteVector<'a> {
    id: &'a str,
    values: &'a [f32],
    metadata: Metadata,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    vector: &'a [f32],
    top_k: usize,
    namespace: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<Value>,
    include_metadata: bool,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<RemoteMatch>,
}

#[derive(Debug, Deserialize)]
struct RemoteMatch {
    id: String,
    score: f32,
    #[serde(default)]
    metadata: Metadata,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeleteRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    ids: Option<&'a [String]>,
    delete_all: bool,
    namespace: &'a str,
}

/// Response of `describe_index_stats`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStats {
    pub dimension: Option<usize>,
    #[serde(default)]
    pub namespaces: HashMap<String, NamespaceSummary>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceSummary {
    #[serde(default)]
    pub vector_count: u64,
}

impl IndexStats {
    #[inline]
    pub fn total_vectors(&self) -> u64 {
        self.namespaces.values().map(|ns| ns.vector_count).sum()
    }

    #[inline]
    pub fn namespace_count(&self, namespace: &str) -> u64 {
        self.namespaces
            .get(namespace)
            .map_or(0, |ns| ns.vector_count)
    }
}

/// Vector index backend hosted by an HTTP vector service
#[derive(Clone)]
pub struct RemoteVectorStore {
    endpoint: String,
    api_key: Option<String>,
    agent: ureq::Agent,
    batch_size: usize,
}

impl RemoteVectorStore {
    /// Connect to the service and make sure it can serve `dimensions`-wide vectors.
    ///
    /// Fails with [`KbError::IndexInit`] when the service is unreachable, rejects the
    /// credentials or reports a different dimension.
    #[inline]
    pub async fn connect(config: &RemoteConfig, dimensions: usize) -> Result<Self> {
        config
            .validate()
            .map_err(|e| KbError::IndexInit(e.to_string()))?;
        let endpoint = config
            .endpoint_url()
            .map_err(|e| KbError::IndexInit(e.to_string()))?;

        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(config.timeout_secs)))
            .build()
            .into();

        let store = Self {
            endpoint: endpoint.as_str().trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            agent,
            batch_size: config.batch_size.max(1),
        };

        let stats = store.describe_index_stats().await.map_err(|e| {
            KbError::IndexInit(format!("Remote vector service unreachable: {:#}", e))
        })?;

        if let Some(remote_dim) = stats.dimension {
            if remote_dim != dimensions {
                return Err(KbError::IndexInit(format!(
                    "remote index has dimension {}, configured {}",
                    remote_dim, dimensions
                )));
            }
        }

        if stats.total_vectors() == 0 {
            info!("Bootstrapping empty remote index with placeholder entry");
            let placeholder = VectorEntry {
                id: PLACEHOLDER_ID.to_string(),
                text: String::new(),
                metadata: Metadata::new(),
                embedding: vec![1.0; dimensions],
            };
            store
                .upsert(SYSTEM_NAMESPACE, std::slice::from_ref(&placeholder))
                .await
                .map_err(|e| KbError::IndexInit(e.to_string()))?;
        }

        info!("Connected to remote vector service at {}", store.endpoint);
        Ok(store)
    }

    /// Dimension and per-namespace counts reported by the service
    #[inline]
    pub async fn describe_index_stats(&self) -> anyhow::Result<IndexStats> {
        self.post("describe_index_stats", &json!({})).await
    }

    async fn post<T, R>(&self, path: &str, body: &T) -> anyhow::Result<R>
    where
        T: Serialize + Sync + ?Sized,
        R: DeserializeOwned,
    {
        let body = serde_json::to_string(body)
            .with_context(|| format!("Failed to serialize request for {}", path))?;
        let url = format!("{}/{}", self.endpoint, path);
        let agent = self.agent.clone();
        let api_key = self.api_key.clone();

        debug!("POST {}", url);
        let response_text = tokio::task::spawn_blocking(move || {
            let mut request = agent.post(&url).header("Content-Type", "application/json");
            if let Some(key) = &api_key {
                request = request.header("Api-Key", key);
            }
            request
                .send(&body)
                .and_then(|mut resp| resp.body_mut().read_to_string())
        })
        .await
        .context("Remote request task panicked")?
        .map_err(|e| anyhow!("Request to {} failed: {}", path, e))?;

        serde_json::from_str(&response_text)
            .with_context(|| format!("Failed to parse response from {}", path))
    }
}

fn remote_filter(filter: &Metadata) -> Option<Value> {
    if filter.is_empty() {
        return None;
    }
    let clauses: Metadata = filter
        .iter()
        .map(|(key, value)| (key.clone(), json!({ "$eq": value })))
        .collect();
    Some(Value::Object(clauses))
}

fn into_search_result(remote: RemoteMatch) -> SearchResult {
    let mut metadata = remote.metadata;
    let text = match metadata.remove(TEXT_KEY) {
        Some(Value::String(text)) => text,
        Some(other) => other.to_string(),
        None => String::new(),
    };
    SearchResult {
        id: remote.id,
        text,
        metadata,
        score: remote.score.clamp(0.0, 1.0),
    }
}

#[async_trait]
impl VectorBackend for RemoteVectorStore {
    #[inline]
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    #[inline]
    async fn upsert(&self, namespace: &str, entries: &[VectorEntry]) -> Result<()> {
        for batch in entries.chunks(self.batch_size) {
            let vectors = batch
                .iter()
                .map(|entry| {
                    let mut metadata = entry.metadata.clone();
                    metadata.insert(TEXT_KEY.to_string(), Value::String(entry.text.clone()));
                    RemoteVector {
                        id: &entry.id,
                        values: &entry.embedding,
                        metadata,
                    }
                })
                .collect();

            let _: Value = self
                .post("vectors/upsert", &UpsertRequest { vectors, namespace })
                .await
                .map_err(|e| KbError::IndexWrite(format!("{:#}", e)))?;
            debug!(
                "Upserted batch of {} vectors into remote namespace '{}'",
                batch.len(),
                namespace
            );
        }
        Ok(())
    }

    #[inline]
    async fn query(
        &self,
        namespace: &str,
        vector: &[f32],
        top_k: usize,
        filter: &Metadata,
    ) -> Result<Vec<SearchResult>> {
        let request = QueryRequest {
            vector,
            top_k,
            namespace,
            filter: remote_filter(filter),
            include_metadata: true,
        };

        let response: QueryResponse = self
            .post("query", &request)
            .await
            .map_err(|e| KbError::IndexSearch(format!("{:#}", e)))?;

        Ok(response
            .matches
            .into_iter()
            .map(into_search_result)
            .filter(|result| {
                result.id != PLACEHOLDER_ID && matches_filter(&result.metadata, filter)
            })
            .collect())
    }

    /// The service does not report how many ids existed, so every listed id counts
    #[inline]
    async fn delete(&self, namespace: &str, ids: &[String]) -> Result<u64> {
        for batch in ids.chunks(self.batch_size) {
            let _: Value = self
                .post(
                    "vectors/delete",
                    &DeleteRequest {
                        ids: Some(batch),
                        delete_all: false,
                        namespace,
                    },
                )
                .await
                .map_err(|e| KbError::IndexWrite(format!("{:#}", e)))?;
        }
        Ok(ids.len() as u64)
    }

    #[inline]
    async fn delete_namespace(&self, namespace: &str) -> Result<u64> {
        let existing = self
            .describe_index_stats()
            .await
            .map_err(|e| KbError::IndexWrite(format!("{:#}", e)))?
            .namespace_count(namespace);

        let _: Value = self
            .post(
                "vectors/delete",
                &DeleteRequest {
                    ids: None,
                    delete_all: true,
                    namespace,
                },
            )
            .await
            .map_err(|e| KbError::IndexWrite(format!("{:#}", e)))?;

        Ok(existing)
    }

    #[inline]
    async fn count(&self, namespace: &str) -> Result<u64> {
        let stats = self
            .describe_index_stats()
            .await
            .map_err(|e| KbError::IndexSearch(format!("{:#}", e)))?;
        Ok(stats.namespace_count(namespace))
    }

    #[inline]
    async fn close(&self) -> Result<()> {
        debug!("Remote vector store released");
        Ok(())
    }
}
