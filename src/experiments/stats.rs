use serde::Serialize;

use super::config::GroupConfig;
use super::record::ObservationRecord;

/// Minimum records per group before two groups may be compared.
pub const MIN_SAMPLES_PER_GROUP: usize = 30;

// ── Group Statistics ────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct GroupStatistics {
    pub group_id: String,
    pub group_name: String,
    pub count: usize,
    pub mean_overall_score: f64,
    /// Population standard deviation (divides by N).
    pub std_overall_score: f64,
    pub mean_relevance_score: f64,
    pub mean_novelty_score: f64,
    pub mean_explainability_score: f64,
    pub mean_diversity_score: f64,
    pub mean_response_time_ms: f64,
    pub p50_response_time_ms: f64,
    pub p95_response_time_ms: f64,
    pub p99_response_time_ms: f64,
    #[serde(skip)]
    pub overall_scores: Vec<f64>,
    #[serde(skip)]
    pub response_times: Vec<f64>,
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

/// Population standard deviation; 0.0 for fewer than two values.
pub fn population_std(values: &[f64], mean: f64) -> f64 {
    if values.len() <= 1 {
        return 0.0;
    }
    let variance = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Index-based percentile over an ascending slice: `sorted[floor(n * p)]`,
/// clamped to the last element. Returns 0.0 for an empty slice.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        n => {
            let idx = ((n as f64 * p).floor() as usize).min(n - 1);
            sorted[idx]
        }
    }
}

/// p99 only trusts the index estimate above 100 samples; smaller groups
/// report their maximum.
pub fn p99(sorted: &[f64]) -> f64 {
    if sorted.len() > 100 {
        percentile(sorted, 0.99)
    } else {
        sorted.last().copied().unwrap_or(0.0)
    }
}

/// Statistics for one group over a records snapshot. Records belonging to
/// other groups are ignored; a group without records yields all zeros.
pub fn compute_statistics(group: &GroupConfig, records: &[ObservationRecord]) -> GroupStatistics {
    let group_records: Vec<&ObservationRecord> = records
        .iter()
        .filter(|r| r.group_id == group.group_id)
        .collect();

    let mut stats = GroupStatistics {
        group_id: group.group_id.clone(),
        group_name: group.group_name.clone(),
        ..Default::default()
    };
    if group_records.is_empty() {
        return stats;
    }

    stats.count = group_records.len();
    stats.overall_scores = group_records.iter().map(|r| r.overall_score).collect();
    stats.mean_overall_score = mean(stats.overall_scores.iter().copied());
    stats.std_overall_score = population_std(&stats.overall_scores, stats.mean_overall_score);
    stats.mean_relevance_score = mean(group_records.iter().map(|r| r.relevance_score));
    stats.mean_novelty_score = mean(group_records.iter().map(|r| r.novelty_score));
    stats.mean_explainability_score = mean(group_records.iter().map(|r| r.explainability_score));
    stats.mean_diversity_score = mean(group_records.iter().map(|r| r.diversity_score));

    stats.response_times = group_records.iter().map(|r| r.response_time_ms).collect();
    stats.mean_response_time_ms = mean(stats.response_times.iter().copied());
    let mut sorted = stats.response_times.clone();
    sorted.sort_by(|a, b| a.total_cmp(b));
    stats.p50_response_time_ms = percentile(&sorted, 0.50);
    stats.p95_response_time_ms = percentile(&sorted, 0.95);
    stats.p99_response_time_ms = p99(&sorted);

    stats
}

// ── Significance Test ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TestError {
    #[error("unknown group: {0}")]
    UnknownGroup(String),
    #[error(
        "insufficient samples: each group needs at least 30 records (got {count_a} and {count_b})"
    )]
    InsufficientSample { count_a: usize, count_b: usize },
    #[error("both groups have zero variance; the difference cannot be tested")]
    DegenerateVariance,
}

/// Significance tier from a fixed two-tailed normal critical-value table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SignificanceTier {
    #[serde(rename = "***")]
    P01,
    #[serde(rename = "**")]
    P05,
    #[serde(rename = "*")]
    P10,
    #[serde(rename = "ns")]
    NotSignificant,
}

impl SignificanceTier {
    pub fn from_t(t: f64) -> Self {
        let abs_t = t.abs();
        if abs_t > 2.576 {
            Self::P01
        } else if abs_t > 1.96 {
            Self::P05
        } else if abs_t > 1.645 {
            Self::P10
        } else {
            Self::NotSignificant
        }
    }

    /// Nominal p-value reported for the tier. Not an exact p-value.
    pub fn p_value(self) -> f64 {
        match self {
            Self::P01 => 0.01,
            Self::P05 => 0.05,
            Self::P10 => 0.10,
            Self::NotSignificant => 0.20,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::P01 => "***",
            Self::P05 => "**",
            Self::P10 => "*",
            Self::NotSignificant => "ns",
        }
    }

    pub fn is_significant(self) -> bool {
        self != Self::NotSignificant
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectSize {
    Small,
    Medium,
    Large,
}

impl EffectSize {
    pub fn from_cohens_d(d: f64) -> Self {
        let abs_d = d.abs();
        if abs_d < 0.2 {
            Self::Small
        } else if abs_d < 0.5 {
            Self::Medium
        } else {
            Self::Large
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupSample {
    pub id: String,
    pub name: String,
    pub mean: f64,
    pub std: f64,
    pub n: usize,
}

impl GroupSample {
    fn from_stats(stats: &GroupStatistics) -> Self {
        Self {
            id: stats.group_id.clone(),
            name: stats.group_name.clone(),
            mean: stats.mean_overall_score,
            std: stats.std_overall_score,
            n: stats.count,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComparisonResult {
    pub group_a: GroupSample,
    pub group_b: GroupSample,
    /// mean(B) - mean(A)
    pub mean_difference: f64,
    pub improvement_pct: f64,
    pub t_statistic: f64,
    pub p_value: f64,
    pub significance: SignificanceTier,
    pub is_significant: bool,
    pub cohens_d: f64,
    pub effect_size: EffectSize,
    pub interpretation: String,
}

/// Compares the overall-score distributions of two groups, B against A.
///
/// The test statistic uses the unequal-variance standard error
/// `sqrt(sA²/nA + sB²/nB)` and is classified against fixed normal critical
/// values. Cohen's d pools the two standard deviations as
/// `sqrt((sA² + sB²) / 2)`.
pub fn compare_groups(
    a: &GroupStatistics,
    b: &GroupStatistics,
) -> Result<ComparisonResult, TestError> {
    if a.count < MIN_SAMPLES_PER_GROUP || b.count < MIN_SAMPLES_PER_GROUP {
        return Err(TestError::InsufficientSample {
            count_a: a.count,
            count_b: b.count,
        });
    }
    if a.std_overall_score == 0.0 && b.std_overall_score == 0.0 {
        return Err(TestError::DegenerateVariance);
    }

    let mean_difference = b.mean_overall_score - a.mean_overall_score;
    let var_a = a.std_overall_score.powi(2);
    let var_b = b.std_overall_score.powi(2);

    let se = (var_a / a.count as f64 + var_b / b.count as f64).sqrt();
    let t_statistic = if se == 0.0 { 0.0 } else { mean_difference / se };
    let significance = SignificanceTier::from_t(t_statistic);

    let pooled_std = ((var_a + var_b) / 2.0).sqrt();
    let cohens_d = if pooled_std == 0.0 {
        0.0
    } else {
        mean_difference / pooled_std
    };
    let effect_size = EffectSize::from_cohens_d(cohens_d);

    let improvement_pct = if a.mean_overall_score == 0.0 {
        0.0
    } else {
        mean_difference / a.mean_overall_score * 100.0
    };

    Ok(ComparisonResult {
        group_a: GroupSample::from_stats(a),
        group_b: GroupSample::from_stats(b),
        mean_difference,
        improvement_pct,
        t_statistic,
        p_value: significance.p_value(),
        significance,
        is_significant: significance.is_significant(),
        cohens_d,
        effect_size,
        interpretation: interpret(
            &b.group_id,
            mean_difference,
            significance.is_significant(),
            effect_size,
        ),
    })
}

/// Fixed-template reading of a comparison for dashboards and logs.
pub fn interpret(
    group_b: &str,
    mean_difference: f64,
    is_significant: bool,
    effect_size: EffectSize,
) -> String {
    if !is_significant {
        return "No statistically significant difference between the groups; keep collecting \
                data or stay with the current strategy."
            .to_string();
    }

    let better = mean_difference > 0.0;
    let advice = match (effect_size, better) {
        (EffectSize::Large, true) => "adopt its strategy",
        (EffectSize::Medium, true) => "consider adopting its strategy",
        (EffectSize::Small, true) => "the gain is minor, decide on other factors",
        (EffectSize::Small, false) => "the loss is minor, decide on other factors",
        (_, false) => "keep the control strategy",
    };
    format!(
        "Group '{}' performs significantly {} ({} effect); {}.",
        group_b,
        if better { "better" } else { "worse" },
        effect_size.label(),
        advice
    )
}
