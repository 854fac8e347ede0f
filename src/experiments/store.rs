use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;

use super::assignment;
use super::config::{validate_groups, ConfigValidationError, GroupConfig};
use super::persistence::{
    ConfigDocument, ExperimentRepository, MemoryRepository, PersistenceError,
};
use super::record::{NewObservation, ObservationRecord};
use super::report::{self, Report, ReportError};
use super::stats::{self, ComparisonResult, GroupStatistics, TestError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentPhase {
    Uninitialized,
    Active,
    Stopped,
}

/// Experiment state as seen by one reader. Groups keep configured order:
/// assignment and the control-vs-others comparisons depend on it.
#[derive(Debug, Clone, Default)]
pub struct ExperimentState {
    pub enabled: bool,
    pub name: String,
    pub groups: IndexMap<String, GroupConfig>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub records: Vec<ObservationRecord>,
}

impl ExperimentState {
    fn from_document(config: ConfigDocument, records: Vec<ObservationRecord>) -> Self {
        Self {
            enabled: config.test_enabled,
            name: config.test_name,
            groups: config
                .test_groups
                .into_iter()
                .map(|g| (g.group_id.clone(), g))
                .collect(),
            start_time: config.start_time,
            end_time: config.end_time,
            records,
        }
    }

    pub fn to_config_document(&self) -> ConfigDocument {
        ConfigDocument {
            test_enabled: self.enabled,
            test_name: self.name.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            test_groups: self.groups.values().cloned().collect(),
        }
    }

    pub fn phase(&self) -> ExperimentPhase {
        if self.enabled {
            ExperimentPhase::Active
        } else if self.start_time.is_some() || !self.groups.is_empty() {
            ExperimentPhase::Stopped
        } else {
            ExperimentPhase::Uninitialized
        }
    }

    pub fn assign_group(&self, subject_id: &str) -> Option<&str> {
        assignment::assign_group(subject_id, self.groups.values(), self.enabled)
    }

    /// `None` only when `group_id` is not configured.
    pub fn group_statistics(&self, group_id: &str) -> Option<GroupStatistics> {
        self.groups
            .get(group_id)
            .map(|group| stats::compute_statistics(group, &self.records))
    }

    pub fn all_statistics(&self) -> IndexMap<String, GroupStatistics> {
        self.groups
            .values()
            .map(|group| {
                (
                    group.group_id.clone(),
                    stats::compute_statistics(group, &self.records),
                )
            })
            .collect()
    }

    pub fn compare(&self, group_a: &str, group_b: &str) -> Result<ComparisonResult, TestError> {
        let a = self
            .group_statistics(group_a)
            .ok_or_else(|| TestError::UnknownGroup(group_a.to_string()))?;
        let b = self
            .group_statistics(group_b)
            .ok_or_else(|| TestError::UnknownGroup(group_b.to_string()))?;
        stats::compare_groups(&a, &b)
    }
}

/// The single owner of experiment state.
///
/// Mutations (`create_test`, `record_result`, `stop_test`) are serialized by
/// `writer`. Each one swaps its in-memory change in under a short exclusive
/// lock and then persists while holding only a shared lock, so readers never
/// wait on storage. Persistence failures after the swap are logged and do not
/// roll memory back.
pub struct ExperimentStore {
    state: RwLock<ExperimentState>,
    writer: Mutex<()>,
    repository: Box<dyn ExperimentRepository>,
}

impl ExperimentStore {
    /// Loads both documents from `repository`. Unreadable or malformed
    /// documents, and a persisted group list that fails validation, are
    /// fatal.
    pub fn open(repository: impl ExperimentRepository + 'static) -> Result<Self, PersistenceError> {
        let persisted = repository.load()?;
        let state = match persisted.config {
            Some(config) => {
                if !config.test_groups.is_empty() {
                    validate_groups(&config.test_groups)
                        .map_err(|e| PersistenceError::InvalidConfig(e.to_string()))?;
                }
                ExperimentState::from_document(config, persisted.records)
            }
            None => ExperimentState {
                records: persisted.records,
                ..Default::default()
            },
        };

        tracing::info!(
            test_name = %state.name,
            enabled = state.enabled,
            groups = state.groups.len(),
            records = state.records.len(),
            "experiment store opened"
        );

        Ok(Self {
            state: RwLock::new(state),
            writer: Mutex::new(()),
            repository: Box::new(repository),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(ExperimentState::default()),
            writer: Mutex::new(()),
            repository: Box::new(MemoryRepository::new()),
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, ExperimentState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, ExperimentState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, what: &str, result: Result<(), PersistenceError>) {
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to persist {}; in-memory state kept", what);
        }
    }

    /// Starts a fresh experiment, discarding any previous groups and records.
    /// On validation failure nothing changes.
    pub fn create_test(
        &self,
        name: &str,
        groups: Vec<GroupConfig>,
    ) -> Result<(), ConfigValidationError> {
        if let Err(e) = validate_groups(&groups) {
            tracing::warn!(test_name = %name, error = %e, "rejected experiment configuration");
            return Err(e);
        }

        let _writer = self.lock_writer();
        let next = ExperimentState {
            enabled: true,
            name: name.to_string(),
            groups: groups
                .into_iter()
                .map(|g| (g.group_id.clone(), g))
                .collect(),
            start_time: Some(Utc::now()),
            end_time: None,
            records: Vec::new(),
        };
        *self.write_state() = next;

        let state = self.read_state();
        self.persist(
            "experiment config",
            self.repository.save_config(&state.to_config_document()),
        );
        self.persist("experiment records", self.repository.save_records(&[]));
        tracing::info!(
            test_name = %state.name,
            groups = state.groups.len(),
            "experiment created"
        );
        Ok(())
    }

    /// Appends one observation stamped with the current time.
    pub fn record_result(&self, observation: NewObservation) {
        let _writer = self.lock_writer();
        let record = observation.into_record(Utc::now());
        {
            let mut state = self.write_state();
            if !state.groups.contains_key(&record.group_id) {
                tracing::debug!(group_id = %record.group_id, "recording result for unconfigured group");
            }
            state.records.push(record);
        }

        let state = self.read_state();
        if let Some(record) = state.records.last() {
            self.persist(
                "experiment record",
                self.repository.append_record(record, &state.records),
            );
        }
    }

    /// Disables assignment and stamps the end time. Records stay readable.
    pub fn stop_test(&self) {
        let _writer = self.lock_writer();
        {
            let mut state = self.write_state();
            state.enabled = false;
            state.end_time = Some(Utc::now());
        }

        let state = self.read_state();
        self.persist(
            "experiment config",
            self.repository.save_config(&state.to_config_document()),
        );
        tracing::info!(
            test_name = %state.name,
            records = state.records.len(),
            "experiment stopped"
        );
    }

    pub fn assign_group(&self, subject_id: &str) -> Option<String> {
        self.read_state().assign_group(subject_id).map(str::to_string)
    }

    pub fn get_group_config(&self, group_id: &str) -> Option<GroupConfig> {
        self.read_state().groups.get(group_id).cloned()
    }

    pub fn is_enabled(&self) -> bool {
        self.read_state().enabled
    }

    pub fn test_name(&self) -> String {
        self.read_state().name.clone()
    }

    pub fn phase(&self) -> ExperimentPhase {
        self.read_state().phase()
    }

    pub fn group_ids(&self) -> Vec<String> {
        self.read_state().groups.keys().cloned().collect()
    }

    pub fn record_count(&self) -> usize {
        self.read_state().records.len()
    }

    /// Owned copy of the current state, for running several derived
    /// computations against the same data.
    pub fn snapshot(&self) -> ExperimentState {
        self.read_state().clone()
    }

    pub fn compute_statistics(&self, group_id: &str) -> Option<GroupStatistics> {
        self.read_state().group_statistics(group_id)
    }

    pub fn compute_all_statistics(&self) -> IndexMap<String, GroupStatistics> {
        self.read_state().all_statistics()
    }

    pub fn compare(&self, group_a: &str, group_b: &str) -> Result<ComparisonResult, TestError> {
        self.read_state().compare(group_a, group_b)
    }

    pub fn generate_report(&self) -> Result<Report, ReportError> {
        report::generate_report(&self.read_state())
    }

    pub fn export_raw_data(&self) -> Vec<ObservationRecord> {
        self.read_state().records.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiments::persistence::{JsonDocumentRepository, PersistedExperiment};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn groups() -> Vec<GroupConfig> {
        vec![
            GroupConfig::new("control", "Control", 0.5),
            GroupConfig::new("variant", "Variant", 0.5),
        ]
    }

    fn observation(group: &str, score: f64) -> NewObservation {
        NewObservation {
            subject_id: format!("member-{}", score),
            group_id: group.to_string(),
            overall_score: score,
            response_time_ms: 100.0,
            item_count: 5,
            strategy_label: "hybrid".to_string(),
            ..Default::default()
        }
    }

    fn json_repo(tmp: &TempDir) -> JsonDocumentRepository {
        JsonDocumentRepository::new(
            tmp.path().join("ab_test_config.json"),
            tmp.path().join("ab_test_data.json"),
        )
    }

    /// Loads fine, then fails every save and counts the attempts.
    #[derive(Default)]
    struct FailingRepository {
        saves: Arc<AtomicUsize>,
    }

    impl ExperimentRepository for FailingRepository {
        fn load(&self) -> Result<PersistedExperiment, PersistenceError> {
            Ok(PersistedExperiment::default())
        }

        fn save_config(&self, _config: &ConfigDocument) -> Result<(), PersistenceError> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            Err(PersistenceError::InvalidConfig("disk full".to_string()))
        }

        fn save_records(&self, _records: &[ObservationRecord]) -> Result<(), PersistenceError> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            Err(PersistenceError::InvalidConfig("disk full".to_string()))
        }
    }

    #[test]
    fn new_store_is_uninitialized() {
        let store = ExperimentStore::in_memory();
        assert_eq!(store.phase(), ExperimentPhase::Uninitialized);
        assert!(!store.is_enabled());
        assert_eq!(store.assign_group("member-1"), None);
        assert!(store.get_group_config("control").is_none());
        assert!(store.compute_all_statistics().is_empty());
    }

    #[test]
    fn create_test_activates_experiment() {
        let store = ExperimentStore::in_memory();
        store.create_test("weights", groups()).unwrap();
        assert_eq!(store.phase(), ExperimentPhase::Active);
        assert!(store.is_enabled());
        assert_eq!(store.test_name(), "weights");
        assert_eq!(store.group_ids(), vec!["control", "variant"]);
        let snapshot = store.snapshot();
        assert!(snapshot.start_time.is_some());
        assert!(snapshot.end_time.is_none());
    }

    #[test]
    fn create_test_with_bad_ratios_leaves_state_untouched() {
        let store = ExperimentStore::in_memory();
        let bad = vec![
            GroupConfig::new("a", "A", 0.4),
            GroupConfig::new("b", "B", 0.4),
        ];
        assert!(matches!(
            store.create_test("bad", bad.clone()),
            Err(ConfigValidationError::RatioSum(_))
        ));
        assert!(!store.is_enabled());
        assert_eq!(store.phase(), ExperimentPhase::Uninitialized);

        store.create_test("good", groups()).unwrap();
        store.record_result(observation("control", 60.0));
        assert!(store.create_test("bad", bad).is_err());
        assert_eq!(store.test_name(), "good");
        assert_eq!(store.record_count(), 1);
        assert!(store.get_group_config("a").is_none());
    }

    #[test]
    fn create_test_resets_records_and_end_time() {
        let store = ExperimentStore::in_memory();
        store.create_test("first", groups()).unwrap();
        store.record_result(observation("control", 60.0));
        store.stop_test();
        store.create_test("second", groups()).unwrap();
        assert_eq!(store.record_count(), 0);
        assert!(store.snapshot().end_time.is_none());
        assert_eq!(store.phase(), ExperimentPhase::Active);
    }

    #[test]
    fn stop_test_keeps_records_and_disables_assignment() {
        let store = ExperimentStore::in_memory();
        store.create_test("weights", groups()).unwrap();
        store.record_result(observation("control", 60.0));
        store.stop_test();
        assert_eq!(store.phase(), ExperimentPhase::Stopped);
        assert_eq!(store.assign_group("member-1"), None);
        assert_eq!(store.record_count(), 1);
        assert!(store.snapshot().end_time.is_some());
        assert!(store.get_group_config("control").is_some());
        assert_eq!(store.compute_statistics("control").unwrap().count, 1);
    }

    #[test]
    fn assign_group_is_stable_and_configured() {
        let store = ExperimentStore::in_memory();
        store.create_test("weights", groups()).unwrap();
        for i in 0..100 {
            let subject = format!("member-{}", i);
            let group = store.assign_group(&subject).unwrap();
            assert!(group == "control" || group == "variant");
            assert_eq!(store.assign_group(&subject).as_deref(), Some(group.as_str()));
        }
    }

    #[test]
    fn record_result_stamps_timestamp_and_exports() {
        let store = ExperimentStore::in_memory();
        store.create_test("weights", groups()).unwrap();
        let before = Utc::now();
        store.record_result(observation("variant", 72.0));
        let exported = store.export_raw_data();
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].group_id, "variant");
        assert!(exported[0].timestamp >= before);
    }

    #[test]
    fn statistics_for_unknown_group_is_none() {
        let store = ExperimentStore::in_memory();
        store.create_test("weights", groups()).unwrap();
        assert!(store.compute_statistics("ghost").is_none());
        assert_eq!(
            store.compare("control", "ghost").unwrap_err(),
            TestError::UnknownGroup("ghost".to_string())
        );
    }

    #[test]
    fn all_statistics_follow_configured_order() {
        let store = ExperimentStore::in_memory();
        store
            .create_test(
                "order",
                vec![
                    GroupConfig::new("z", "Z", 0.3),
                    GroupConfig::new("a", "A", 0.3),
                    GroupConfig::new("m", "M", 0.4),
                ],
            )
            .unwrap();
        let ids: Vec<String> = store.compute_all_statistics().keys().cloned().collect();
        assert_eq!(ids, vec!["z", "a", "m"]);
    }

    #[test]
    fn state_persists_across_store_restart() {
        let tmp = TempDir::new().unwrap();
        {
            let store = ExperimentStore::open(json_repo(&tmp)).unwrap();
            store.create_test("weights", groups()).unwrap();
            for i in 0..5 {
                store.record_result(observation("control", 60.0 + i as f64));
            }
        }
        let reopened = ExperimentStore::open(json_repo(&tmp)).unwrap();
        assert_eq!(reopened.test_name(), "weights");
        assert!(reopened.is_enabled());
        assert_eq!(reopened.record_count(), 5);
        assert_eq!(reopened.get_group_config("variant").unwrap(), groups()[1]);
        assert_eq!(reopened.group_ids(), vec!["control", "variant"]);
    }

    #[test]
    fn stop_persists_config_only() {
        let tmp = TempDir::new().unwrap();
        {
            let store = ExperimentStore::open(json_repo(&tmp)).unwrap();
            store.create_test("weights", groups()).unwrap();
            store.record_result(observation("control", 61.0));
            store.stop_test();
        }
        let reopened = ExperimentStore::open(json_repo(&tmp)).unwrap();
        assert_eq!(reopened.phase(), ExperimentPhase::Stopped);
        assert!(reopened.snapshot().end_time.is_some());
        assert_eq!(reopened.record_count(), 1);
    }

    #[test]
    fn open_rejects_malformed_documents() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("ab_test_data.json"), "[{\"broken\": ").unwrap();
        assert!(ExperimentStore::open(json_repo(&tmp)).is_err());
    }

    #[test]
    fn open_rejects_persisted_groups_with_bad_ratios() {
        let tmp = TempDir::new().unwrap();
        let doc = ConfigDocument {
            test_enabled: true,
            test_name: "bad".to_string(),
            test_groups: vec![GroupConfig::new("a", "A", 0.3)],
            ..Default::default()
        };
        std::fs::write(
            tmp.path().join("ab_test_config.json"),
            serde_json::to_string(&doc).unwrap(),
        )
        .unwrap();
        assert!(matches!(
            ExperimentStore::open(json_repo(&tmp)),
            Err(PersistenceError::InvalidConfig(_))
        ));
    }

    #[test]
    fn save_failures_do_not_roll_back_memory() {
        let saves = Arc::new(AtomicUsize::new(0));
        let store = ExperimentStore::open(FailingRepository {
            saves: Arc::clone(&saves),
        })
        .unwrap();
        store.create_test("weights", groups()).unwrap();
        store.record_result(observation("control", 60.0));
        store.stop_test();
        assert_eq!(store.record_count(), 1);
        assert_eq!(store.phase(), ExperimentPhase::Stopped);
        // config + records on create, records on append, config on stop
        assert_eq!(saves.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn concurrent_writers_never_lose_records() {
        let store = Arc::new(ExperimentStore::in_memory());
        store.create_test("weights", groups()).unwrap();
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let group = if i % 2 == 0 { "control" } else { "variant" };
                        store.record_result(observation(group, (t * 50 + i) as f64));
                        let _ = store.compute_all_statistics();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.record_count(), 400);
        let all = store.compute_all_statistics();
        assert_eq!(all["control"].count + all["variant"].count, 400);
    }
}
