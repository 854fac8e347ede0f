//! Storage for the two experiment documents.
//!
//! The store only talks to [`ExperimentRepository`]; the on-disk layout is
//! chosen by the implementation:
//! - [`JsonDocumentRepository`]: `ab_test_config.json` plus a single JSON
//!   array of records, rewritten on every append.
//! - [`JsonLinesRepository`]: same config document, records appended one per
//!   line to a `.jsonl` log.
//! - [`MemoryRepository`]: nothing leaves the process.

use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::config::GroupConfig;
use super::record::{iso8601, ObservationRecord};

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed document {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("serialization error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid persisted configuration: {0}")]
    InvalidConfig(String),
}

impl PersistenceError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn json(path: &Path, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// The persisted experiment configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ConfigDocument {
    #[serde(default)]
    pub test_enabled: bool,
    #[serde(default)]
    pub test_name: String,
    #[serde(default, with = "iso8601::option")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, with = "iso8601::option")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub test_groups: Vec<GroupConfig>,
}

/// Everything a repository held when the store was opened.
#[derive(Debug, Default)]
pub struct PersistedExperiment {
    pub config: Option<ConfigDocument>,
    pub records: Vec<ObservationRecord>,
}

pub trait ExperimentRepository: Send + Sync {
    fn load(&self) -> Result<PersistedExperiment, PersistenceError>;

    fn save_config(&self, config: &ConfigDocument) -> Result<(), PersistenceError>;

    /// Replaces the whole record collection.
    fn save_records(&self, records: &[ObservationRecord]) -> Result<(), PersistenceError>;

    /// Persists one freshly appended record. `records` is the full collection
    /// with `record` as its last element; whole-document stores rewrite from
    /// it, append-only stores ignore it.
    fn append_record(
        &self,
        _record: &ObservationRecord,
        records: &[ObservationRecord],
    ) -> Result<(), PersistenceError> {
        self.save_records(records)
    }
}

fn ensure_parent(path: &Path) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| PersistenceError::io(parent, e))?;
        }
    }
    Ok(())
}

/// Writes to `<path>.tmp` and renames over `path`.
fn atomic_write(path: &Path, data: &[u8]) -> Result<(), PersistenceError> {
    ensure_parent(path)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp_path = PathBuf::from(tmp);
    std::fs::write(&tmp_path, data).map_err(|e| PersistenceError::io(&tmp_path, e))?;
    std::fs::rename(&tmp_path, path).map_err(|e| PersistenceError::io(path, e))?;
    Ok(())
}

fn read_optional(path: &Path) -> Result<Option<String>, PersistenceError> {
    match std::fs::read_to_string(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(PersistenceError::io(path, e)),
    }
}

fn load_config_document(path: &Path) -> Result<Option<ConfigDocument>, PersistenceError> {
    match read_optional(path)? {
        Some(data) => serde_json::from_str(&data)
            .map(Some)
            .map_err(|e| PersistenceError::json(path, e)),
        None => Ok(None),
    }
}

fn save_config_document(path: &Path, config: &ConfigDocument) -> Result<(), PersistenceError> {
    let data = serde_json::to_vec_pretty(config)?;
    atomic_write(path, &data)
}

pub struct JsonDocumentRepository {
    config_path: PathBuf,
    data_path: PathBuf,
}

impl JsonDocumentRepository {
    pub fn new(config_path: impl Into<PathBuf>, data_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            data_path: data_path.into(),
        }
    }
}

impl ExperimentRepository for JsonDocumentRepository {
    fn load(&self) -> Result<PersistedExperiment, PersistenceError> {
        let config = load_config_document(&self.config_path)?;
        let records = match read_optional(&self.data_path)? {
            Some(data) => serde_json::from_str(&data)
                .map_err(|e| PersistenceError::json(&self.data_path, e))?,
            None => Vec::new(),
        };
        Ok(PersistedExperiment { config, records })
    }

    fn save_config(&self, config: &ConfigDocument) -> Result<(), PersistenceError> {
        save_config_document(&self.config_path, config)
    }

    fn save_records(&self, records: &[ObservationRecord]) -> Result<(), PersistenceError> {
        let data = serde_json::to_vec_pretty(records)?;
        atomic_write(&self.data_path, &data)
    }
}

/// Records are kept as newline-delimited JSON so an append costs one line
/// instead of a full rewrite. A torn final line (crash mid-append) is
/// skipped on load and cut from the file so the next append starts on a
/// fresh line; any other malformed line fails the load.
pub struct JsonLinesRepository {
    config_path: PathBuf,
    log_path: PathBuf,
}

impl JsonLinesRepository {
    pub fn new(config_path: impl Into<PathBuf>, log_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            log_path: log_path.into(),
        }
    }

    /// Makes the log end on a line boundary: a complete but unterminated last
    /// record gets its newline, a torn one is truncated away.
    fn repair_tail(&self, content: &str, tail_parsed: bool) -> Result<(), PersistenceError> {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(&self.log_path)
            .map_err(|e| PersistenceError::io(&self.log_path, e))?;
        if tail_parsed {
            file.seek(SeekFrom::End(0))
                .and_then(|_| file.write_all(b"\n"))
                .map_err(|e| PersistenceError::io(&self.log_path, e))
        } else {
            let keep = content.rfind('\n').map_or(0, |i| i + 1);
            file.set_len(keep as u64)
                .map_err(|e| PersistenceError::io(&self.log_path, e))
        }
    }
}

impl ExperimentRepository for JsonLinesRepository {
    fn load(&self) -> Result<PersistedExperiment, PersistenceError> {
        let config = load_config_document(&self.config_path)?;
        let mut records = Vec::new();
        if let Some(content) = read_optional(&self.log_path)? {
            let unterminated = !content.is_empty() && !content.ends_with('\n');
            let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
            let mut tail_parsed = true;
            for (i, line) in lines.iter().enumerate() {
                match serde_json::from_str::<ObservationRecord>(line) {
                    Ok(record) => records.push(record),
                    Err(e) if i + 1 == lines.len() && unterminated => {
                        tracing::warn!(
                            path = %self.log_path.display(),
                            error = %e,
                            "dropping torn trailing record"
                        );
                        tail_parsed = false;
                    }
                    Err(e) => return Err(PersistenceError::json(&self.log_path, e)),
                }
            }
            if unterminated {
                self.repair_tail(&content, tail_parsed)?;
            }
        }
        Ok(PersistedExperiment { config, records })
    }

    fn save_config(&self, config: &ConfigDocument) -> Result<(), PersistenceError> {
        save_config_document(&self.config_path, config)
    }

    fn save_records(&self, records: &[ObservationRecord]) -> Result<(), PersistenceError> {
        let mut data = Vec::new();
        for record in records {
            serde_json::to_writer(&mut data, record)?;
            data.push(b'\n');
        }
        atomic_write(&self.log_path, &data)
    }

    fn append_record(
        &self,
        record: &ObservationRecord,
        _records: &[ObservationRecord],
    ) -> Result<(), PersistenceError> {
        ensure_parent(&self.log_path)?;
        let line = serde_json::to_string(record)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(|e| PersistenceError::io(&self.log_path, e))?;
        writeln!(file, "{}", line).map_err(|e| PersistenceError::io(&self.log_path, e))
    }
}

#[derive(Default)]
pub struct MemoryRepository {
    inner: Mutex<PersistedExperiment>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExperimentRepository for MemoryRepository {
    fn load(&self) -> Result<PersistedExperiment, PersistenceError> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(PersistedExperiment {
            config: inner.config.clone(),
            records: inner.records.clone(),
        })
    }

    fn save_config(&self, config: &ConfigDocument) -> Result<(), PersistenceError> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .config = Some(config.clone());
        Ok(())
    }

    fn save_records(&self, records: &[ObservationRecord]) -> Result<(), PersistenceError> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .records = records.to_vec();
        Ok(())
    }

    fn append_record(
        &self,
        record: &ObservationRecord,
        _records: &[ObservationRecord],
    ) -> Result<(), PersistenceError> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .records
            .push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiments::record::NewObservation;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn record(subject: &str, score: f64) -> ObservationRecord {
        NewObservation {
            subject_id: subject.to_string(),
            group_id: "control".to_string(),
            overall_score: score,
            response_time_ms: 100.0,
            ..Default::default()
        }
        .into_record(Utc.with_ymd_and_hms(2025, 4, 2, 9, 15, 0).unwrap())
    }

    fn config() -> ConfigDocument {
        ConfigDocument {
            test_enabled: true,
            test_name: "weights".to_string(),
            start_time: Some(Utc::now()),
            end_time: None,
            test_groups: vec![
                GroupConfig::new("control", "Control", 0.5),
                GroupConfig::new("variant", "Variant", 0.5),
            ],
        }
    }

    #[test]
    fn json_document_load_of_missing_files_is_empty() {
        let tmp = TempDir::new().unwrap();
        let repo = JsonDocumentRepository::new(
            tmp.path().join("config.json"),
            tmp.path().join("data.json"),
        );
        let loaded = repo.load().unwrap();
        assert!(loaded.config.is_none());
        assert!(loaded.records.is_empty());
    }

    #[test]
    fn json_document_persists_config_and_records() {
        let tmp = TempDir::new().unwrap();
        let repo = JsonDocumentRepository::new(
            tmp.path().join("config/ab_test_config.json"),
            tmp.path().join("data/ab_test_data.json"),
        );
        let cfg = config();
        repo.save_config(&cfg).unwrap();
        let records = vec![record("m1", 60.0), record("m2", 70.0)];
        repo.append_record(&records[1], &records).unwrap();

        let loaded = repo.load().unwrap();
        assert_eq!(loaded.config.unwrap().test_groups, cfg.test_groups);
        assert_eq!(loaded.records.len(), 2);
        assert!(!tmp.path().join("data/ab_test_data.json.tmp").exists());
    }

    #[test]
    fn json_document_data_file_is_a_json_array() {
        let tmp = TempDir::new().unwrap();
        let data_path = tmp.path().join("data.json");
        let repo = JsonDocumentRepository::new(tmp.path().join("config.json"), &data_path);
        repo.save_records(&[record("m1", 50.0)]).unwrap();
        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(data_path).unwrap()).unwrap();
        assert!(raw.is_array());
        assert!(raw[0]["timestamp"].is_string());
    }

    #[test]
    fn json_document_malformed_config_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let config_path = tmp.path().join("config.json");
        std::fs::write(&config_path, "{ not json").unwrap();
        let repo = JsonDocumentRepository::new(&config_path, tmp.path().join("data.json"));
        assert!(matches!(repo.load(), Err(PersistenceError::Json { .. })));
    }

    #[test]
    fn config_document_fills_missing_keys_with_defaults() {
        let doc: ConfigDocument = serde_json::from_str(r#"{"test_name":"x"}"#).unwrap();
        assert!(!doc.test_enabled);
        assert!(doc.start_time.is_none());
        assert!(doc.test_groups.is_empty());
    }

    #[test]
    fn config_document_serializes_null_bounds() {
        let mut doc = config();
        doc.start_time = None;
        let json = serde_json::to_value(&doc).unwrap();
        assert!(json["start_time"].is_null());
        assert!(json["end_time"].is_null());
    }

    #[test]
    fn json_lines_appends_without_rewriting() {
        let tmp = TempDir::new().unwrap();
        let log_path = tmp.path().join("data.jsonl");
        let repo = JsonLinesRepository::new(tmp.path().join("config.json"), &log_path);
        let first = record("m1", 55.0);
        repo.append_record(&first, &[]).unwrap();
        let second = record("m2", 65.0);
        repo.append_record(&second, &[]).unwrap();

        let content = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(content.lines().count(), 2);
        let loaded = repo.load().unwrap();
        assert_eq!(loaded.records, vec![first, second]);
    }

    #[test]
    fn json_lines_skips_torn_trailing_line() {
        let tmp = TempDir::new().unwrap();
        let log_path = tmp.path().join("data.jsonl");
        let repo = JsonLinesRepository::new(tmp.path().join("config.json"), &log_path);
        repo.append_record(&record("m1", 55.0), &[]).unwrap();
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&log_path)
            .unwrap();
        write!(file, "{{\"subject_id\":\"m2\",\"gro").unwrap();

        let loaded = repo.load().unwrap();
        assert_eq!(loaded.records.len(), 1);
    }

    #[test]
    fn json_lines_append_after_torn_tail_reloads() {
        let tmp = TempDir::new().unwrap();
        let log_path = tmp.path().join("data.jsonl");
        let repo = JsonLinesRepository::new(tmp.path().join("config.json"), &log_path);
        repo.append_record(&record("m1", 55.0), &[]).unwrap();
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&log_path)
            .unwrap();
        write!(file, "{{\"subject_id\":\"m2\",\"gro").unwrap();
        drop(file);

        assert_eq!(repo.load().unwrap().records.len(), 1);
        assert!(std::fs::read_to_string(&log_path).unwrap().ends_with('\n'));

        repo.append_record(&record("m3", 65.0), &[]).unwrap();
        let reloaded = repo.load().unwrap();
        let subjects: Vec<&str> = reloaded.records.iter().map(|r| r.subject_id.as_str()).collect();
        assert_eq!(subjects, vec!["m1", "m3"]);
    }

    #[test]
    fn json_lines_complete_unterminated_tail_is_kept() {
        let tmp = TempDir::new().unwrap();
        let log_path = tmp.path().join("data.jsonl");
        let line = serde_json::to_string(&record("m1", 55.0)).unwrap();
        std::fs::write(&log_path, line).unwrap();
        let repo = JsonLinesRepository::new(tmp.path().join("config.json"), &log_path);

        assert_eq!(repo.load().unwrap().records.len(), 1);
        repo.append_record(&record("m2", 60.0), &[]).unwrap();
        assert_eq!(repo.load().unwrap().records.len(), 2);
    }

    #[test]
    fn json_lines_rejects_corruption_in_the_middle() {
        let tmp = TempDir::new().unwrap();
        let log_path = tmp.path().join("data.jsonl");
        let line = serde_json::to_string(&record("m1", 55.0)).unwrap();
        std::fs::write(&log_path, format!("garbage\n{}\n", line)).unwrap();
        let repo = JsonLinesRepository::new(tmp.path().join("config.json"), &log_path);
        assert!(repo.load().is_err());
    }

    #[test]
    fn json_lines_save_records_replaces_log() {
        let tmp = TempDir::new().unwrap();
        let log_path = tmp.path().join("data.jsonl");
        let repo = JsonLinesRepository::new(tmp.path().join("config.json"), &log_path);
        repo.append_record(&record("m1", 55.0), &[]).unwrap();
        repo.save_records(&[]).unwrap();
        assert!(repo.load().unwrap().records.is_empty());
    }

    #[test]
    fn memory_repository_round_trips() {
        let repo = MemoryRepository::new();
        repo.save_config(&config()).unwrap();
        let r = record("m1", 42.0);
        repo.append_record(&r, &[]).unwrap();
        let loaded = repo.load().unwrap();
        assert_eq!(loaded.config.unwrap().test_name, "weights");
        assert_eq!(loaded.records, vec![r]);
    }
}
