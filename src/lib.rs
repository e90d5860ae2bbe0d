// PSD2 Account Aggregator - Core Library
// Exposes all modules for use in CLI, query server, and tests

pub mod error;
pub mod coerce;     // Numeric / timestamp coercion
pub mod discovery;  // Schema Discoverer - flattening + column sets
pub mod db;
pub mod sources;    // Per-bank source profiles (ING, ABN AMRO)
pub mod normalize;  // Relational Normalizer - per-source stores
pub mod merge;      // Cross-Source Merger - unified store
pub mod inspect;    // Query surface contract
pub mod config;
pub mod pipeline;

// Re-export commonly used types
pub use error::{PipelineError, Result};
pub use coerce::{to_numeric, to_timestamp, parse_timestamp, parse_instant, Coercion};
pub use discovery::{
    flatten, discover, discover_into,
    ColumnSet, DiscoveredSchema, FlatRecord, FlattenRule, RecordKind,
};
pub use db::{
    ImportRun, ImportReport,
    open_store, open_read_only, get_import_runs,
};
pub use sources::{
    BankSource, Bank, AccountDocuments, SourceBatch, SourceRecord,
    get_source, load_documents, parse_documents,
    IngSource, AbnAmroSource,
};
pub use normalize::{normalize_documents, latest_by_timestamp, TableSpec, InsertPolicy};
pub use merge::{
    merge_sources, merge_files, rebuild_unified_schema, fingerprint,
    MergeReport, MergeSource, UnifiedTable,
};
pub use inspect::{
    describe_store, render_schema, list_tables, run_read_only_query,
    QueryResult, TableSchema, ColumnInfo,
};
pub use config::{PipelineConfig, ServerConfig};
pub use pipeline::{normalize_file, run_all, PipelineSummary};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
