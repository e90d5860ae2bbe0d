// 🚚 Pipeline - documents on disk → per-source stores → unified store

use crate::config::PipelineConfig;
use crate::db::{open_store, ImportReport, ImportRun};
use crate::error::Result;
use crate::merge::{merge_files, MergeReport};
use crate::normalize::normalize_documents;
use crate::sources::{get_source, load_documents, Bank};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub imports: Vec<ImportReport>,
    pub merge: MergeReport,
}

/// Normalize one bank's document file into its per-source store
pub fn normalize_file(bank: Bank, input: &Path, store: &Path, run: &ImportRun) -> Result<ImportReport> {
    info!(bank = bank.name(), input = %input.display(), store = %store.display(), "loading documents");

    let documents = load_documents(input)?;
    let conn = open_store(store)?;
    let source = get_source(bank);

    normalize_documents(&conn, source.as_ref(), &documents, run)
}

/// Normalize every bank whose input file exists, then rebuild the unified store.
///
/// Banks without an input keep whatever their store already holds.
pub fn run_all(config: &PipelineConfig) -> Result<PipelineSummary> {
    let run = ImportRun::new();
    let mut imports = Vec::new();

    for bank in Bank::all() {
        let input = config.input_path(bank);
        if !input.exists() {
            warn!(bank = bank.name(), input = %input.display(), "no input documents, skipping normalization");
            continue;
        }

        imports.push(normalize_file(bank, &input, &config.store_path(bank), &run)?);
    }

    let merge = merge_files(&config.unified_path(), &config.store_paths())?;

    Ok(PipelineSummary { imports, merge })
}

// ============================================================================
// TESTS
// ============================================================================
