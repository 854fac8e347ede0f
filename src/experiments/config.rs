use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::persistence::PersistenceError;
use super::report::ReportError;
use super::stats::TestError;

/// Allowed distance between the sum of traffic ratios and 1.0.
pub const RATIO_SUM_TOLERANCE: f64 = 0.01;

/// One arm of an experiment.
///
/// `strategy_config` is handed back to the recommendation engine untouched;
/// the experiment engine never interprets it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct GroupConfig {
    pub group_id: String,
    pub group_name: String,
    #[serde(default)]
    pub strategy_config: serde_json::Map<String, serde_json::Value>,
    pub traffic_ratio: f64,
    #[serde(default)]
    pub description: String,
}

impl GroupConfig {
    pub fn new(group_id: &str, group_name: &str, traffic_ratio: f64) -> Self {
        Self {
            group_id: group_id.to_string(),
            group_name: group_name.to_string(),
            strategy_config: serde_json::Map::new(),
            traffic_ratio,
            description: String::new(),
        }
    }

    pub fn with_strategy(mut self, key: &str, value: serde_json::Value) -> Self {
        self.strategy_config.insert(key.to_string(), value);
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("traffic ratios must sum to 1.0 (±0.01), got {0}")]
    RatioSum(f64),
    #[error("traffic ratio for group '{group_id}' must be in [0, 1], got {ratio}")]
    RatioOutOfRange { group_id: String, ratio: f64 },
    #[error("group id must not be empty")]
    EmptyGroupId,
    #[error("duplicate group id: {0}")]
    DuplicateGroupId(String),
}

/// Umbrella error for callers that drive several engine operations in a row.
#[derive(Debug, thiserror::Error)]
pub enum ExperimentError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigValidationError),
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("comparison failed: {0}")]
    Test(#[from] TestError),
    #[error("report failed: {0}")]
    Report(#[from] ReportError),
}

/// Checks the per-group invariants and the traffic-ratio sum.
///
/// An empty slice fails on the ratio sum (0.0).
pub fn validate_groups(groups: &[GroupConfig]) -> Result<(), ConfigValidationError> {
    let mut seen = HashSet::with_capacity(groups.len());
    for group in groups {
        if group.group_id.is_empty() {
            return Err(ConfigValidationError::EmptyGroupId);
        }
        if !seen.insert(group.group_id.as_str()) {
            return Err(ConfigValidationError::DuplicateGroupId(
                group.group_id.clone(),
            ));
        }
        if !(0.0..=1.0).contains(&group.traffic_ratio) {
            return Err(ConfigValidationError::RatioOutOfRange {
                group_id: group.group_id.clone(),
                ratio: group.traffic_ratio,
            });
        }
    }

    let total: f64 = groups.iter().map(|g| g.traffic_ratio).sum();
    if (total - 1.0).abs() > RATIO_SUM_TOLERANCE {
        return Err(ConfigValidationError::RatioSum(total));
    }
    Ok(())
}
