use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

pub type Labels = BTreeMap<String, String>;

/// Fixed-width UTC layout used for persisted expirations. Every value has six
/// fractional digits so string order and time order agree.
pub const EXPIRATION_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// One registered hostname with its merged labels and targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub hostname: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub labels: Labels,
    #[serde(default, deserialize_with = "null_as_default")]
    pub targets: Vec<String>,
    #[serde(with = "expiration_format")]
    pub expiration: DateTime<Utc>,
}

impl CatalogEntry {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiration <= now
    }

    pub fn holds_values(&self, labels: &Labels, targets: &[String]) -> bool {
        self.labels == *labels && self.targets == targets
    }

    pub fn to_discovery_target(&self) -> DiscoveryTarget {
        DiscoveryTarget {
            labels: self.labels.clone(),
            targets: self.targets.clone(),
        }
    }
}

/// The `{labels, targets}` projection consumed by file-based discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryTarget {
    pub labels: Labels,
    pub targets: Vec<String>,
}

pub fn format_expiration(value: &DateTime<Utc>) -> String {
    value.format(EXPIRATION_FORMAT).to_string()
}

/// Accepts the fixed-width layout, the same layout without a fractional part,
/// and RFC 3339 with an explicit offset.
pub fn parse_expiration(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }

    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|value| value.with_timezone(&Utc))
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

pub(crate) mod expiration_format {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_expiration(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_expiration(&raw)
            .ok_or_else(|| D::Error::custom(format!("invalid expiration timestamp: {}", raw)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn expiration_is_fixed_width_and_orders_lexicographically() {
        let whole = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let later = whole + chrono::Duration::microseconds(7);

        let whole_str = format_expiration(&whole);
        let later_str = format_expiration(&later);

        assert_eq!(whole_str, "2026-01-02T03:04:05.000000");
        assert_eq!(later_str, "2026-01-02T03:04:05.000007");
        assert_eq!(whole_str.len(), later_str.len());
        assert!(whole_str < later_str);
    }

    #[test]
    fn parses_legacy_timestamps() {
        let expected = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();

        assert_eq!(parse_expiration("2026-01-02T03:04:05"), Some(expected));
        assert_eq!(parse_expiration("2026-01-02T03:04:05.000000"), Some(expected));
        assert_eq!(parse_expiration("2026-01-02T05:04:05+02:00"), Some(expected));
        assert_eq!(parse_expiration("not a time"), None);
    }

    #[test]
    fn null_labels_and_targets_read_as_empty() {
        let entry: CatalogEntry = serde_json::from_str(
            r#"{"hostname":"a","labels":null,"targets":null,"expiration":"2026-01-02T03:04:05"}"#,
        )
        .unwrap();

        assert!(entry.labels.is_empty());
        assert!(entry.targets.is_empty());
    }
}
