
use arrow::record_batch::RecordBatchIterator;
use async_trait::async_trait;
use chrono::Utc;
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{Connection, DistanceType, Table};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, error, info, warn};

use super::{
    ScoredRow, TABLE_NAME, VectorRow, parse_search_batch, rows_to_batch, schema_dimension,
    vector_schema,
};
use crate::config::BackendKind;
use crate::database::index::{PLACEHOLDER_ID, SYSTEM_NAMESPACE, VectorBackend};
use crate::database::{Metadata, SearchResult, VectorEntry, matches_filter, sql_literal};
use crate::{KbError, Result};

/// Vector index backend persisted on disk with LanceDB
pub struct LocalVectorStore {
    table: Table,
    vector_dimension: usize,
    sequence: AtomicI64,
}

impl LocalVectorStore {
    /// Open (or create) the store under `db_path`.
    ///
    /// A brand new table receives a single placeholder row in the system namespace.
    /// An existing table with a different vector dimension is rebuilt only if it holds
    /// nothing but the placeholder; otherwise opening fails.
    #[inline]
    pub async fn open(db_path: &Path, vector_dimension: usize) -> Result<Self> {
        debug!("Opening local vector store at {:?}", db_path);

        std::fs::create_dir_all(db_path).map_err(|e| {
            KbError::IndexInit(format!("Failed to create vector database directory: {}", e))
        })?;

        let uri = db_path.to_string_lossy().into_owned();

        let connection = match lancedb::connect(&uri).execute().await {
            Ok(conn) => conn,
            Err(e) if looks_corrupted(&e.to_string()) => {
                warn!("Vector database corruption detected, attempting recovery: {}", e);
                recover_corrupted(db_path)?;
                lancedb::connect(&uri).execute().await.map_err(|e| {
                    KbError::IndexInit(format!(
                        "Failed to connect to LanceDB after recovery: {}",
                        e
                    ))
                })?
            }
            Err(e) => {
                error!("Failed to connect to LanceDB: {}", e);
                return Err(KbError::IndexInit(format!(
                    "Failed to connect to LanceDB: {}",
                    e
                )));
            }
        };

        let table = open_or_bootstrap(&connection, vector_dimension).await?;

        info!(
            "Local vector store ready with {} dimensions",
            vector_dimension
        );
        Ok(Self {
            table,
            vector_dimension,
            sequence: AtomicI64::new(0),
        })
    }

    /// Total rows in the table, placeholder included
    #[inline]
    pub async fn total_rows(&self) -> Result<u64> {
        let count = self
            .table
            .count_rows(None)
            .await
            .map_err(|e| KbError::IndexSearch(format!("Failed to count rows: {}", e)))?;
        Ok(count as u64)
    }

    /// Compact fragments left behind by deletes and replacements
    #[inline]
    pub async fn optimize(&self) -> Result<()> {
        debug!("Optimizing local vector store");
        self.table
            .optimize(lancedb::table::OptimizeAction::All)
            .await
            .map_err(|e| KbError::IndexWrite(format!("Failed to optimize table: {}", e)))?;
        Ok(())
    }

    fn next_sequence(&self) -> i64 {
        let now = Utc::now().timestamp_micros();
        self.sequence
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(last.saturating_add(1).max(now))
            })
            .map_or(now, |last| last.saturating_add(1).max(now))
    }

    /// Insert rows, replacing any stored row with the same id in one commit
    async fn merge_rows(&self, rows: &[VectorRow]) -> Result<()> {
        let batch = rows_to_batch(rows, self.vector_dimension)?;
        let schema = batch.schema();
        let reader = RecordBatchIterator::new(std::iter::once(Ok(batch)), schema);

        let mut merge = self.table.merge_insert(&["id"]);
        merge
            .when_matched_update_all(None)
            .when_not_matched_insert_all();
        merge
            .execute(Box::new(reader))
            .await
            .map_err(|e| KbError::IndexWrite(format!("Failed to upsert vectors: {}", e)))?;
        Ok(())
    }

    async fn nearest_rows(
        &self,
        vector: &[f32],
        predicate: &str,
        limit: usize,
    ) -> Result<Vec<ScoredRow>> {
        let mut stream = self
            .table
            .vector_search(vector)
            .map_err(|e| KbError::IndexSearch(format!("Failed to create vector search: {}", e)))?
            .column("vector")
            .distance_type(DistanceType::Cosine)
            .only_if(predicate)
            .limit(limit)
            .execute()
            .await
            .map_err(|e| KbError::IndexSearch(format!("Failed to execute search: {}", e)))?;

        let mut rows: Vec<ScoredRow> = Vec::new();
        while let Some(batch) = stream
            .try_next()
            .await
            .map_err(|e| KbError::IndexSearch(format!("Failed to read result stream: {}", e)))?
        {
            rows.extend(parse_search_batch(&batch)?);
        }
        Ok(rows)
    }

    async fn delete_matching(&self, predicate: &str) -> Result<u64> {
        let count = self
            .table
            .count_rows(Some(predicate.to_string()))
            .await
            .map_err(|e| KbError::IndexWrite(format!("Failed to count rows: {}", e)))?;

        if count > 0 {
            self.table
                .delete(predicate)
                .await
                .map_err(|e| KbError::IndexWrite(format!("Failed to delete vectors: {}", e)))?;
        }

        Ok(count as u64)
    }
}

fn lowest_score(rows: &[ScoredRow]) -> Option<f32> {
    rows.iter().map(|row| row.result.score).min_by(f32::total_cmp)
}

#[async_trait]
impl VectorBackend for LocalVectorStore {
    #[inline]
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    /// One merge commits every row of the batch or none of them, so a failed
    /// write leaves the previously stored rows in place.
    #[inline]
    async fn upsert(&self, namespace: &str, entries: &[VectorEntry]) -> Result<()> {
        // Within one batch the last entry for an id wins
        let mut latest: HashMap<&str, &VectorEntry> = HashMap::with_capacity(entries.len());
        let mut order = Vec::with_capacity(entries.len());
        for entry in entries {
            if latest.insert(entry.id.as_str(), entry).is_none() {
                order.push(entry.id.as_str());
            }
        }

        let rows: Vec<VectorRow> = order
            .iter()
            .filter_map(|id| latest.get(id))
            .map(|entry| VectorRow {
                id: entry.id.clone(),
                namespace: namespace.to_string(),
                text: entry.text.clone(),
                metadata: entry.metadata.clone(),
                vector: entry.embedding.clone(),
                inserted_at: self.next_sequence(),
            })
            .collect();

        self.merge_rows(&rows).await?;
        debug!("Stored {} vectors in namespace '{}'", rows.len(), namespace);
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
        let predicate = format!("namespace = {}", sql_literal(namespace));

        // Metadata filters are applied after the scan, so scan the whole namespace
        let mut limit = if filter.is_empty() {
            top_k
        } else {
            self.table
                .count_rows(Some(predicate.clone()))
                .await
                .map_err(|e| KbError::IndexSearch(format!("Failed to count rows: {}", e)))?
        };
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut rows = self.nearest_rows(vector, &predicate, limit).await?;

        // Rows tied with the last one kept may have been cut in any order;
        // widen until the cut falls strictly below that score
        if filter.is_empty() {
            if let Some(boundary) = lowest_score(&rows) {
                while rows.len() == limit
                    && lowest_score(&rows).is_some_and(|lowest| lowest >= boundary)
                {
                    limit = limit.saturating_mul(2);
                    rows = self.nearest_rows(vector, &predicate, limit).await?;
                }
            }
        }

        rows.retain(|row| {
            row.result.id != PLACEHOLDER_ID && matches_filter(&row.result.metadata, filter)
        });
        rows.sort_by(|a, b| {
            b.result
                .score
                .total_cmp(&a.result.score)
                .then(a.inserted_at.cmp(&b.inserted_at))
        });

        Ok(rows.into_iter().map(|row| row.result).collect())
    }

    #[inline]
    async fn delete(&self, namespace: &str, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let id_list = ids
            .iter()
            .map(|id| sql_literal(id))
            .collect::<Vec<_>>()
            .join(", ");
        let predicate = format!(
            "namespace = {} AND id IN ({})",
            sql_literal(namespace),
            id_list
        );
        self.delete_matching(&predicate).await
    }

    #[inline]
    async fn delete_namespace(&self, namespace: &str) -> Result<u64> {
        self.delete_matching(&format!("namespace = {}", sql_literal(namespace))).await
    }

    #[inline]
    async fn count(&self, namespace: &str) -> Result<u64> {
        let count = self
            .table
            .count_rows(Some(format!("namespace = {}", sql_literal(namespace))))
            .await
            .map_err(|e| KbError::IndexSearch(format!("Failed to count rows: {}", e)))?;
        Ok(count as u64)
    }

    #[inline]
    async fn close(&self) -> Result<()> {
        if let Err(e) = self.optimize().await {
            warn!("Vector store optimization failed on close: {}", e);
        }
        Ok(())
    }
}

async fn open_or_bootstrap(connection: &Connection, vector_dimension: usize) -> Result<Table> {
    let table_names = connection
        .table_names()
        .execute()
        .await
        .map_err(|e| KbError::IndexInit(format!("Failed to list tables: {}", e)))?;

    if table_names.iter().any(|name| name == TABLE_NAME) {
        let table = connection
            .open_table(TABLE_NAME)
            .execute()
            .await
            .map_err(|e| KbError::IndexInit(format!("Failed to open vector table: {}", e)))?;

        let schema = table
            .schema()
            .await
            .map_err(|e| KbError::IndexInit(format!("Failed to read table schema: {}", e)))?;

        let existing = schema_dimension(&schema);
        if existing == Some(vector_dimension) {
            debug!("Opened existing vector table");
            return Ok(table);
        }

        let stored = table
            .count_rows(Some(format!(
                "namespace != {}",
                sql_literal(SYSTEM_NAMESPACE)
            )))
            .await
            .map_err(|e| KbError::IndexInit(format!("Failed to count rows: {}", e)))?;
        if stored > 0 {
            return Err(KbError::IndexInit(format!(
                "vector table has dimension {:?} but {} is configured, and holds {} entries",
                existing, vector_dimension, stored
            )));
        }

        warn!(
            "Rebuilding empty vector table from dimension {:?} to {}",
            existing, vector_dimension
        );
        connection
            .drop_table(TABLE_NAME)
            .await
            .map_err(|e| KbError::IndexInit(format!("Failed to drop vector table: {}", e)))?;
    }

    info!("Bootstrapping vector table with placeholder entry");
    let table = connection
        .create_empty_table(TABLE_NAME, vector_schema(vector_dimension)?)
        .execute()
        .await
        .map_err(|e| KbError::IndexInit(format!("Failed to create vector table: {}", e)))?;

    let placeholder = VectorRow {
        id: PLACEHOLDER_ID.to_string(),
        namespace: SYSTEM_NAMESPACE.to_string(),
        text: String::new(),
        metadata: Metadata::new(),
        vector: vec![1.0; vector_dimension],
        inserted_at: 0,
    };
    let batch = rows_to_batch(std::slice::from_ref(&placeholder), vector_dimension)?;
    let schema = batch.schema();
    table
        .add(RecordBatchIterator::new(std::iter::once(Ok(batch)), schema))
        .execute()
        .await
        .map_err(|e| KbError::IndexInit(format!("Failed to write placeholder entry: {}", e)))?;

    Ok(table)
}

fn looks_corrupted(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("corrupt") || message.contains("malformed")
}

/// Move a damaged database aside so a fresh one can be created in its place
fn recover_corrupted(db_path: &Path) -> Result<()> {
    let mut backup = PathBuf::from(db_path);
    backup.set_extension("corrupted_backup");

    std::fs::rename(db_path, &backup).map_err(|e| {
        KbError::IndexInit(format!("Failed to move corrupted database aside: {}", e))
    })?;
    info!("Corrupted vector database moved to {:?}", backup);

    std::fs::create_dir_all(db_path).map_err(|e| {
        KbError::IndexInit(format!("Failed to recreate vector database directory: {}", e))
    })?;
    Ok(())
}
