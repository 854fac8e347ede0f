use sha2::{Digest, Sha256};

use super::config::GroupConfig;

/// Number of buckets the hash space is folded into before scaling to [0, 1).
pub const BUCKETS: u32 = 10_000;

/// Maps a subject onto [0, 1) using the first four bytes of its SHA-256
/// digest. Stable across processes: there is no per-process seed.
pub fn bucket_ratio(subject_id: &str) -> f64 {
    let digest = Sha256::digest(subject_id.as_bytes());
    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    (prefix % BUCKETS) as f64 / BUCKETS as f64
}

/// Picks the group for `subject_id`.
///
/// Walks `groups` in configured order, accumulating traffic ratios, and
/// returns the first group whose cumulative share exceeds the subject's
/// bucket. Floating-point shortfall at the upper boundary falls back to the
/// last group, so every enabled, non-empty configuration yields a group.
pub fn assign_group<'a>(
    subject_id: &str,
    groups: impl IntoIterator<Item = &'a GroupConfig>,
    enabled: bool,
) -> Option<&'a str> {
    if !enabled {
        return None;
    }

    let ratio = bucket_ratio(subject_id);
    let mut cumulative = 0.0;
    let mut last = None;
    for group in groups {
        cumulative += group.traffic_ratio;
        if ratio < cumulative {
            return Some(group.group_id.as_str());
        }
        last = Some(group.group_id.as_str());
    }
    last
}
