// ⚙️ Configuration - file locations and server settings
// Every value can come from a flag, an environment variable or `.env`.

use crate::error::{PipelineError, Result};
use crate::sources::Bank;
use clap::Args;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Where per-source inputs, per-source stores and the unified store live.
///
/// Relative paths are resolved against `data_dir`.
#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct PipelineConfig {
    /// Base directory for relative paths
    #[arg(long, env = "PSD2_DATA_DIR", default_value = ".")]
    pub data_dir: PathBuf,

    /// ING documents written by the fetch phase
    #[arg(long, env = "PSD2_ING_INPUT", default_value = "ing_data_output.json")]
    pub ing_input: PathBuf,

    #[arg(long, env = "PSD2_ING_DB", default_value = "ing_data.db")]
    pub ing_db: PathBuf,

    /// ABN AMRO documents written by the fetch phase
    #[arg(long, env = "PSD2_ABN_INPUT", default_value = "abn_amro_data_output.json")]
    pub abn_input: PathBuf,

    #[arg(long, env = "PSD2_ABN_DB", default_value = "abn_amro_data.db")]
    pub abn_db: PathBuf,

    /// Unified store rebuilt by every merge
    #[arg(long, env = "PSD2_UNIFIED_DB", default_value = "merged_data.db")]
    pub unified_db: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            data_dir: PathBuf::from("."),
            ing_input: PathBuf::from("ing_data_output.json"),
            ing_db: PathBuf::from("ing_data.db"),
            abn_input: PathBuf::from("abn_amro_data_output.json"),
            abn_db: PathBuf::from("abn_amro_data.db"),
            unified_db: PathBuf::from("merged_data.db"),
        }
    }
}

impl PipelineConfig {
    /// Same file names under another directory
    pub fn in_dir(data_dir: impl Into<PathBuf>) -> Self {
        PipelineConfig {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        }
    }

    pub fn input_path(&self, bank: Bank) -> PathBuf {
        match bank {
            Bank::Ing => self.resolve(&self.ing_input),
            Bank::AbnAmro => self.resolve(&self.abn_input),
        }
    }

    pub fn store_path(&self, bank: Bank) -> PathBuf {
        match bank {
            Bank::Ing => self.resolve(&self.ing_db),
            Bank::AbnAmro => self.resolve(&self.abn_db),
        }
    }

    pub fn unified_path(&self) -> PathBuf {
        self.resolve(&self.unified_db)
    }

    /// Per-source stores in merge order
    pub fn store_paths(&self) -> Vec<(Bank, PathBuf)> {
        Bank::all()
            .into_iter()
            .map(|bank| (bank, self.store_path(bank)))
            .collect()
    }
}

// ============================================================================
// QUERY SERVER
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub unified_db: PathBuf,
    pub cors_allow: Vec<String>,
    /// Maximum rows returned by one query
    pub row_limit: usize,
}

impl ServerConfig {
    /// Read `PSD2_LISTEN_ADDR`, `PSD2_UNIFIED_DB`, `PSD2_CORS_ALLOW_ORIGINS`
    /// and `PSD2_QUERY_ROW_LIMIT`. Call after `.env` has been loaded.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr = lookup("PSD2_LISTEN_ADDR")
            .unwrap_or_else(|| "0.0.0.0:3000".to_string())
            .parse::<SocketAddr>()
            .map_err(|e| PipelineError::Config(format!("PSD2_LISTEN_ADDR: {}", e)))?;

        let pipeline = PipelineConfig {
            data_dir: lookup("PSD2_DATA_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from(".")),
            unified_db: lookup("PSD2_UNIFIED_DB")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("merged_data.db")),
            ..Default::default()
        };

        let cors_allow = lookup("PSD2_CORS_ALLOW_ORIGINS")
            .unwrap_or_else(|| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let row_limit = match lookup("PSD2_QUERY_ROW_LIMIT") {
            Some(raw) => raw
                .parse()
                .map_err(|e| PipelineError::Config(format!("PSD2_QUERY_ROW_LIMIT: {}", e)))?,
            None => 1000,
        };

        Ok(ServerConfig {
            listen_addr,
            unified_db: pipeline.unified_path(),
            cors_allow,
            row_limit,
        })
    }
}
