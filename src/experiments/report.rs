use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;

use super::record::iso8601;
use super::stats::{ComparisonResult, GroupStatistics};
use super::store::ExperimentState;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReportError {
    #[error("no active or completed experiment")]
    NoExperiment,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub test_info: TestInfo,
    pub groups: IndexMap<String, GroupReport>,
    pub comparisons: Vec<ComparisonResult>,
    pub recommendation: Option<Recommendation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestInfo {
    pub test_name: String,
    #[serde(serialize_with = "iso8601::option::serialize")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(serialize_with = "iso8601::option::serialize")]
    pub end_time: Option<DateTime<Utc>>,
    pub duration_hours: Option<f64>,
    pub total_records: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupReport {
    pub group_name: String,
    pub total_records: usize,
    pub quality_scores: QualityScores,
    pub performance: PerformanceSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct QualityScores {
    pub overall: f64,
    pub relevance: f64,
    pub novelty: f64,
    pub explainability: f64,
    pub diversity: f64,
    pub std: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceSummary {
    pub avg_response_time_ms: f64,
    pub p50_response_time_ms: f64,
    pub p95_response_time_ms: f64,
    pub p99_response_time_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    pub best_group_id: String,
    pub best_group_name: String,
    pub best_score: f64,
}

impl From<&GroupStatistics> for GroupReport {
    fn from(stats: &GroupStatistics) -> Self {
        Self {
            group_name: stats.group_name.clone(),
            total_records: stats.count,
            quality_scores: QualityScores {
                overall: stats.mean_overall_score,
                relevance: stats.mean_relevance_score,
                novelty: stats.mean_novelty_score,
                explainability: stats.mean_explainability_score,
                diversity: stats.mean_diversity_score,
                std: stats.std_overall_score,
            },
            performance: PerformanceSummary {
                avg_response_time_ms: stats.mean_response_time_ms,
                p50_response_time_ms: stats.p50_response_time_ms,
                p95_response_time_ms: stats.p95_response_time_ms,
                p99_response_time_ms: stats.p99_response_time_ms,
            },
        }
    }
}

/// Highest mean overall score among groups with at least one record. The
/// scan keeps the first of equal maxima, so ties go to the earlier group.
fn best_group(all: &IndexMap<String, GroupStatistics>) -> Option<Recommendation> {
    let mut best: Option<&GroupStatistics> = None;
    for stats in all.values().filter(|s| s.count > 0) {
        if best.map_or(true, |b| stats.mean_overall_score > b.mean_overall_score) {
            best = Some(stats);
        }
    }
    best.map(|s| Recommendation {
        best_group_id: s.group_id.clone(),
        best_group_name: s.group_name.clone(),
        best_score: s.mean_overall_score,
    })
}

/// Builds the cross-group report. The first configured group is the control;
/// every other group is compared against it and comparisons that cannot be
/// computed (too few samples, no variance) are left out.
pub fn generate_report(state: &ExperimentState) -> Result<Report, ReportError> {
    if !state.enabled && state.end_time.is_none() && state.records.is_empty() {
        return Err(ReportError::NoExperiment);
    }

    let all = state.all_statistics();
    let groups = all
        .iter()
        .map(|(id, stats)| (id.clone(), GroupReport::from(stats)))
        .collect();

    let mut comparisons = Vec::new();
    let mut ids = all.keys();
    if let Some(control) = ids.next() {
        for other in ids {
            match super::stats::compare_groups(&all[control], &all[other]) {
                Ok(result) => comparisons.push(result),
                Err(e) => tracing::debug!(
                    control = %control,
                    group = %other,
                    reason = %e,
                    "comparison skipped"
                ),
            }
        }
    }

    let duration_hours = match (state.start_time, state.end_time) {
        (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 3_600_000.0),
        _ => None,
    };

    Ok(Report {
        test_info: TestInfo {
            test_name: state.name.clone(),
            start_time: state.start_time,
            end_time: state.end_time,
            duration_hours,
            total_records: state.records.len(),
        },
        groups,
        comparisons,
        recommendation: best_group(&all),
    })
}
