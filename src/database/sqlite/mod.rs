use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use tracing::{debug, info};

use crate::database::sqlite::models::{
    NamespaceStats, NamespaceSummary, NewVectorRecord, VectorRecord,
};
use crate::database::sqlite::queries::VectorRecordQueries;


pub mod models;
pub mod queries;

pub type DbPool = Pool<Sqlite>;

/// SQLite-backed metadata store
#[derive(Debug, Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    #[inline]
    pub async fn new<P: AsRef<Path>>(database_path: P) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .context("Failed to create database connection pool")?;

        let database = Self { pool };
        database.run_migrations().await?;

        Ok(database)
    }

    #[inline]
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    #[inline]
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("src/database/sqlite/migrations")
            .run(&self.pool)
            .await
            .context("Failed to run schema migration")?;

        debug!("Database migrations completed successfully");
        Ok(())
    }

    /// Open `<config_dir>/metadata.db`, creating the directory if needed
    #[inline]
    pub async fn initialize_from_config_dir(config_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(config_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                config_dir.display()
            )
        })?;

        Self::new(config_dir.join("metadata.db")).await
    }

    /// Upsert the record for `record.id`; last write wins
    #[inline]
    pub async fn record(&self, record: &NewVectorRecord) -> Result<VectorRecord> {
        VectorRecordQueries::upsert(&self.pool, record).await
    }

    #[inline]
    pub async fn get_record(&self, id: &str) -> Result<Option<VectorRecord>> {
        VectorRecordQueries::get_by_id(&self.pool, id).await
    }

    #[inline]
    pub async fn list_namespace(&self, namespace: &str) -> Result<Vec<VectorRecord>> {
        VectorRecordQueries::list_by_namespace(&self.pool, namespace).await
    }

    /// Delete every record of `namespace`, returning the prior row count
    #[inline]
    pub async fn clear_namespace(&self, namespace: &str) -> Result<u64> {
        VectorRecordQueries::delete_by_namespace(&self.pool, namespace).await
    }

    #[inline]
    pub async fn source_record_ids(&self, namespace: &str, source_id: &str) -> Result<Vec<String>> {
        VectorRecordQueries::ids_by_source(&self.pool, namespace, source_id).await
    }

    #[inline]
    pub async fn delete_records(&self, namespace: &str, ids: &[String]) -> Result<u64> {
        VectorRecordQueries::delete_by_ids(&self.pool, namespace, ids).await
    }

    #[inline]
    pub async fn stats(&self, namespace: &str) -> Result<NamespaceStats> {
        VectorRecordQueries::namespace_stats(&self.pool, namespace).await
    }

    #[inline]
    pub async fn list_namespaces(&self) -> Result<Vec<NamespaceSummary>> {
        VectorRecordQueries::list_namespaces(&self.pool).await
    }

    /// Optimize database performance by running VACUUM and ANALYZE
    #[inline]
    pub async fn optimize(&self) -> Result<()> {
        info!("Optimizing metadata database");

        sqlx::query("VACUUM")
            .execute(&self.pool)
            .await
            .context("Failed to vacuum database")?;

        sqlx::query("ANALYZE")
            .execute(&self.pool)
            .await
            .context("Failed to analyze database")?;

        debug!("Database optimization completed");
        Ok(())
    }

    #[inline]
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
