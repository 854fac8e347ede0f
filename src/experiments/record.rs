use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// One observed unit of work, appended once and never modified.
///
/// The legacy field names `member_code`, `recommendation_count` and
/// `strategy_used` are accepted when reading older data documents.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ObservationRecord {
    #[serde(alias = "member_code")]
    pub subject_id: String,
    pub group_id: String,
    #[serde(with = "iso8601")]
    pub timestamp: DateTime<Utc>,
    pub overall_score: f64,
    pub relevance_score: f64,
    pub novelty_score: f64,
    pub explainability_score: f64,
    pub diversity_score: f64,
    pub response_time_ms: f64,
    #[serde(alias = "recommendation_count")]
    pub item_count: i64,
    #[serde(alias = "strategy_used")]
    pub strategy_label: String,
}

/// Caller-supplied fields of a record; the store stamps the timestamp.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct NewObservation {
    pub subject_id: String,
    pub group_id: String,
    pub overall_score: f64,
    #[serde(default)]
    pub relevance_score: f64,
    #[serde(default)]
    pub novelty_score: f64,
    #[serde(default)]
    pub explainability_score: f64,
    #[serde(default)]
    pub diversity_score: f64,
    pub response_time_ms: f64,
    #[serde(default)]
    pub item_count: i64,
    #[serde(default)]
    pub strategy_label: String,
}

impl NewObservation {
    pub fn into_record(self, timestamp: DateTime<Utc>) -> ObservationRecord {
        ObservationRecord {
            subject_id: self.subject_id,
            group_id: self.group_id,
            timestamp,
            overall_score: self.overall_score,
            relevance_score: self.relevance_score,
            novelty_score: self.novelty_score,
            explainability_score: self.explainability_score,
            diversity_score: self.diversity_score,
            response_time_ms: self.response_time_ms,
            item_count: self.item_count,
            strategy_label: self.strategy_label,
        }
    }
}

/// Parses an ISO-8601 instant. Offsets are honored; values without an offset
/// are taken as UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// serde adapter: RFC 3339 on write, lenient ISO-8601 on read.
pub(crate) mod iso8601 {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Micros, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_timestamp(&raw)
            .ok_or_else(|| D::Error::custom(format!("invalid ISO-8601 timestamp: {}", raw)))
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{de::Error, Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<DateTime<Utc>>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(dt) => super::serialize(dt, s),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            match Option::<String>::deserialize(d)? {
                Some(raw) => super::super::parse_timestamp(&raw)
                    .map(Some)
                    .ok_or_else(|| D::Error::custom(format!("invalid ISO-8601 timestamp: {}", raw))),
                None => Ok(None),
            }
        }
    }
}
