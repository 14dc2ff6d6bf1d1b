
use super::models::{
    NamespaceStats, NamespaceSummary, NewVectorRecord, VectorRecord, VectorRecordRow,
};
use anyhow::{Context, Result};
use chrono::{NaiveDateTime, SubsecRound, Utc};
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use tracing::debug;

pub struct VectorRecordQueries;

impl VectorRecordQueries {
    /// Insert or replace the record with this id; the previous row is overwritten whole
    #[inline]
    pub async fn upsert(pool: &SqlitePool, record: &NewVectorRecord) -> Result<VectorRecord> {
        let now = Utc::now().naive_utc().trunc_subsecs(6);
        let metadata =
            serde_json::to_string(&record.metadata).context("Failed to encode record metadata")?;

        sqlx::query(
            "INSERT OR REPLACE INTO vector_records (id, namespace, text, metadata, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.namespace)
        .bind(&record.text)
        .bind(&metadata)
        .bind(now)
        .execute(pool)
        .await
        .with_context(|| format!("Failed to record entry {}", record.id))?;

        Ok(VectorRecord {
            id: record.id.clone(),
            namespace: record.namespace.clone(),
            text: record.text.clone(),
            metadata: record.metadata.clone(),
            created_at: now,
        })
    }

    #[inline]
    pub async fn get_by_id(pool: &SqlitePool, id: &str) -> Result<Option<VectorRecord>> {
        let row = sqlx::query_as::<_, VectorRecordRow>(
            "SELECT id, namespace, text, metadata, created_at FROM vector_records WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to get record by id")?;

        row.map(|row| VectorRecord::try_from(row).context("Stored metadata is not valid JSON"))
            .transpose()
    }

    #[inline]
    pub async fn list_by_namespace(
        pool: &SqlitePool,
        namespace: &str,
    ) -> Result<Vec<VectorRecord>> {
        let rows = sqlx::query_as::<_, VectorRecordRow>(
            r#"
            SELECT id, namespace, text, metadata, created_at
            FROM vector_records
            WHERE namespace = ?
            ORDER BY created_at, id
            "#,
        )
        .bind(namespace)
        .fetch_all(pool)
        .await
        .context("Failed to list records for namespace")?;

        rows.into_iter()
            .map(|row| VectorRecord::try_from(row).context("Stored metadata is not valid JSON"))
            .collect()
    }

    #[inline]
    pub async fn count_by_namespace(pool: &SqlitePool, namespace: &str) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM vector_records WHERE namespace = ?")
                .bind(namespace)
                .fetch_one(pool)
                .await
                .context("Failed to count records")?;
        Ok(count)
    }

    /// Delete every record of `namespace`, returning how many existed
    #[inline]
    pub async fn delete_by_namespace(pool: &SqlitePool, namespace: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM vector_records WHERE namespace = ?")
            .bind(namespace)
            .execute(pool)
            .await
            .context("Failed to delete namespace records")?;

        debug!(
            "Deleted {} records from namespace '{}'",
            result.rows_affected(),
            namespace
        );
        Ok(result.rows_affected())
    }

    /// Ids of the records in `namespace` that were chunked from `source_id`
    #[inline]
    pub async fn ids_by_source(
        pool: &SqlitePool,
        namespace: &str,
        source_id: &str,
    ) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT id
            FROM vector_records
            WHERE namespace = ? AND json_extract(metadata, '$.source_id') = ?
            ORDER BY id
            "#,
        )
        .bind(namespace)
        .bind(source_id)
        .fetch_all(pool)
        .await
        .context("Failed to list records for source")?;

        Ok(ids)
    }

    /// Delete the listed ids from `namespace`, returning how many existed
    #[inline]
    pub async fn delete_by_ids(pool: &SqlitePool, namespace: &str, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "DELETE FROM vector_records WHERE namespace = ? AND id IN ({})",
            placeholders
        );
        let mut query = sqlx::query(&sql).bind(namespace);
        for id in ids {
            query = query.bind(id);
        }

        let result = query
            .execute(pool)
            .await
            .context("Failed to delete records")?;
        debug!(
            "Deleted {} records from namespace '{}'",
            result.rows_affected(),
            namespace
        );
        Ok(result.rows_affected())
    }

    #[inline]
    pub async fn list_namespaces(pool: &SqlitePool) -> Result<Vec<NamespaceSummary>> {
        let summaries = sqlx::query_as::<_, NamespaceSummary>(
            r#"
            SELECT namespace,
                   COUNT(*) AS total_vectors,
                   MAX(created_at) AS last_updated
            FROM vector_records
            GROUP BY namespace
            ORDER BY namespace
            "#,
        )
        .fetch_all(pool)
        .await
        .context("Failed to list namespaces")?;

        Ok(summaries)
    }

    /// Aggregate the namespace's current rows inside one read transaction
    #[inline]
    pub async fn namespace_stats(pool: &SqlitePool, namespace: &str) -> Result<NamespaceStats> {
        let mut tx = pool
            .begin()
            .await
            .context("Failed to start stats transaction")?;

        let (total_vectors, first_created, last_updated) =
            sqlx::query_as::<_, (i64, Option<NaiveDateTime>, Option<NaiveDateTime>)>(
                "SELECT COUNT(*), MIN(created_at), MAX(created_at) FROM vector_records WHERE namespace = ?",
            )
            .bind(namespace)
            .fetch_one(&mut *tx)
            .await
            .context("Failed to aggregate namespace records")?;

        let tag_counts = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT tags.key, COUNT(DISTINCT tags.value)
            FROM vector_records AS records, json_each(records.metadata) AS tags
            WHERE records.namespace = ?
            GROUP BY tags.key
            ORDER BY tags.key
            "#,
        )
        .bind(namespace)
        .fetch_all(&mut *tx)
        .await
        .context("Failed to count distinct tags")?;

        tx.commit()
            .await
            .context("Failed to finish stats transaction")?;

        Ok(NamespaceStats {
            namespace: namespace.to_string(),
            total_vectors,
            first_created,
            last_updated,
            distinct_tag_counts: tag_counts.into_iter().collect::<BTreeMap<_, _>>(),
        })
    }
}
