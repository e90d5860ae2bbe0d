//! Error types for the discovery / normalization / merge pipeline

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    // =============================
    // Contract violations (fatal)
    // =============================
    /// A flattened record produced a key that discovery never saw.
    /// Discovery must run over the same data before normalization.
    #[error("schema drift: column '{column}' is not part of the discovered schema for '{table}'")]
    SchemaDrift { table: String, column: String },

    #[error("no source database found; checked: {0}")]
    NoSources(String),

    #[error("invalid input document: {0}")]
    InvalidDocument(String),

    #[error("query rejected: {0}")]
    QueryRejected(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    // =============================
    // External library conversions
    // =============================
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
