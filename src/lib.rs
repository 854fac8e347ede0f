//! Experiment assignment and statistical comparison engine for
//! recommendation strategies.
//!
//! Subjects are bucketed deterministically into treatment groups, per-request
//! quality and latency observations are appended per group, and the engine
//! derives descriptive statistics, a simplified two-sample significance test
//! and a cross-group report from those observations.
//!
//! ```rust,ignore
//! use recsys_ab::experiments::config::GroupConfig;
//! use recsys_ab::settings::EngineSettings;
//!
//! let store = EngineSettings::from_env().open_store()?;
//! store.create_test("weights", vec![
//!     GroupConfig::new("control", "Control", 0.5),
//!     GroupConfig::new("cf_heavy", "Collaborative heavy", 0.5),
//! ])?;
//! let group = store.assign_group("member-0042");
//! ```

pub mod experiments;
pub mod settings;

pub use experiments::config::{ConfigValidationError, ExperimentError, GroupConfig};
pub use experiments::persistence::{ExperimentRepository, PersistenceError};
pub use experiments::record::{NewObservation, ObservationRecord};
pub use experiments::report::{Report, ReportError};
pub use experiments::stats::{ComparisonResult, GroupStatistics, TestError};
pub use experiments::store::{ExperimentPhase, ExperimentState, ExperimentStore};
pub use settings::{EngineSettings, StorageFormat};
