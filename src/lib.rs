use thiserror::Error;

pub type Result<T> = std::result::Result<T, KbError>;

#[derive(Error, Debug)]
pub enum KbError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Chunking error: {0}")]
    Chunking(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Index initialization failed: {0}")]
    IndexInit(String),

    #[error("Index write failed: {0}")]
    IndexWrite(String),

    #[error("Index search failed: {0}")]
    IndexSearch(String),

    #[error("Metadata write failed: {0}")]
    MetadataWrite(String),

    #[error("Metadata read failed: {0}")]
    MetadataRead(String),

    #[error("Vector index is not initialized")]
    NotInitialized,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub mod commands;
pub mod config;
pub mod database;
pub mod embeddings;
pub mod retrieval;
