use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::experiments::persistence::{
    JsonDocumentRepository, JsonLinesRepository, PersistenceError,
};
use crate::experiments::store::ExperimentStore;

pub const DEFAULT_DATA_DIR: &str = "./data";
pub const DEFAULT_CONFIG_FILE: &str = "ab_test_config.json";
pub const DEFAULT_DATA_FILE: &str = "ab_test_data.json";
pub const DEFAULT_LOG_FILE: &str = "ab_test_data.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageFormat {
    /// Config document plus one JSON array of records, rewritten per append.
    #[default]
    Json,
    /// Config document plus an append-only newline-delimited records log.
    JsonLines,
}

impl FromStr for StorageFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "jsonl" | "jsonlines" | "ndjson" => Ok(Self::JsonLines),
            other => Err(format!(
                "unknown storage format '{}' (expected json or jsonl)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub data_dir: PathBuf,
    pub storage: StorageFormat,
    pub config_file: String,
    /// Records file name; `None` picks the default for `storage`.
    pub data_file: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            storage: StorageFormat::Json,
            config_file: DEFAULT_CONFIG_FILE.to_string(),
            data_file: None,
        }
    }
}

impl EngineSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let storage = match env::var("RECSYS_AB_STORAGE") {
            Ok(raw) => raw.parse().unwrap_or_else(|e: String| {
                tracing::warn!(error = %e, "ignoring RECSYS_AB_STORAGE");
                StorageFormat::default()
            }),
            Err(_) => StorageFormat::default(),
        };
        EngineSettings {
            data_dir: env::var("RECSYS_AB_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            storage,
            config_file: env::var("RECSYS_AB_CONFIG_FILE").unwrap_or(defaults.config_file),
            data_file: env::var("RECSYS_AB_DATA_FILE").ok(),
        }
    }

    pub fn with_data_dir(mut self, data_dir: impl AsRef<Path>) -> Self {
        self.data_dir = data_dir.as_ref().to_path_buf();
        self
    }

    pub fn with_storage(mut self, storage: StorageFormat) -> Self {
        self.storage = storage;
        self
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join(&self.config_file)
    }

    pub fn data_path(&self) -> PathBuf {
        let default = match self.storage {
            StorageFormat::Json => DEFAULT_DATA_FILE,
            StorageFormat::JsonLines => DEFAULT_LOG_FILE,
        };
        self.data_dir
            .join(self.data_file.as_deref().unwrap_or(default))
    }

    pub fn open_store(&self) -> Result<ExperimentStore, PersistenceError> {
        tracing::debug!(
            config = %self.config_path().display(),
            data = %self.data_path().display(),
            storage = ?self.storage,
            "opening experiment store"
        );
        match self.storage {
            StorageFormat::Json => ExperimentStore::open(JsonDocumentRepository::new(
                self.config_path(),
                self.data_path(),
            )),
            StorageFormat::JsonLines => ExperimentStore::open(JsonLinesRepository::new(
                self.config_path(),
                self.data_path(),
            )),
        }
    }
}
