//! # Records
//! The normalized unit of ingested content shared by every source.
//!
//! A `Record` carries its origin (`SourceKind`), the instant it was fetched,
//! a flat payload of scalar fields and a byte-size estimate used by the
//! exporter's memory trigger. Payload fields vary by source, but `title`,
//! `url` and `timestamp` are mandatory.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Fields kept when slim mode is on.
pub const SLIM_FIELDS: [&str; 8] = [
    "title",
    "url",
    "published",
    "source",
    "feed_category",
    "language",
    "summary",
    "timestamp",
];

const SLIM_SUMMARY_CHARS: usize = 500;

/// Supported origins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Reddit,
    Twitter,
    NewsApi,
    Rss,
    StockTwits,
    AlphaVantage,
}

impl SourceKind {
    pub const ALL: [SourceKind; 6] = [
        SourceKind::Reddit,
        SourceKind::Twitter,
        SourceKind::NewsApi,
        SourceKind::Rss,
        SourceKind::StockTwits,
        SourceKind::AlphaVantage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Reddit => "reddit",
            SourceKind::Twitter => "twitter",
            SourceKind::NewsApi => "newsapi",
            SourceKind::Rss => "rss",
            SourceKind::StockTwits => "stocktwits",
            SourceKind::AlphaVantage => "alphavantage",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        SourceKind::ALL
            .into_iter()
            .find(|k| k.as_str() == wanted)
            .ok_or_else(|| RecordError::UnknownSource(s.to_string()))
    }
}

/// A single payload value. Payloads are flat: no nested maps or lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Scalar::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Render for tabular output (CSV cells).
    pub fn to_cell(&self) -> String {
        match self {
            Scalar::Null => String::new(),
            Scalar::Bool(b) => b.to_string(),
            Scalar::Int(i) => i.to_string(),
            Scalar::Float(f) => f.to_string(),
            Scalar::Text(s) => s.clone(),
        }
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::Text(s.to_string())
    }
}

impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Scalar::Text(s)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int(v)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Float(v)
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

impl TryFrom<serde_json::Value> for Scalar {
    type Error = RecordError;

    fn try_from(v: serde_json::Value) -> Result<Self, Self::Error> {
        use serde_json::Value;
        match v {
            Value::Null => Ok(Scalar::Null),
            Value::Bool(b) => Ok(Scalar::Bool(b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Ok(Scalar::Int(i)),
                None => Ok(Scalar::Float(n.as_f64().unwrap_or_default())),
            },
            Value::String(s) => Ok(Scalar::Text(s)),
            Value::Array(_) | Value::Object(_) => Err(RecordError::NonScalar),
        }
    }
}

pub type Payload = BTreeMap<String, Scalar>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("missing mandatory field `{0}`")]
    MissingField(&'static str),
    #[error("record source {found} does not match worker source {expected}")]
    SourceMismatch {
        expected: SourceKind,
        found: SourceKind,
    },
    #[error("payload value is not a scalar")]
    NonScalar,
    #[error("unknown source `{0}`")]
    UnknownSource(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub source: SourceKind,
    pub fetched_at: DateTime<Utc>,
    pub payload: Payload,
    #[serde(default)]
    pub raw_size_estimate: u64,
}

impl Record {
    /// Build a record stamped with the current time.
    pub fn new(source: SourceKind, payload: Payload) -> Self {
        Self::at(source, Utc::now(), payload)
    }

    pub fn at(source: SourceKind, fetched_at: DateTime<Utc>, payload: Payload) -> Self {
        let mut rec = Self {
            source,
            fetched_at,
            payload,
            raw_size_estimate: 0,
        };
        rec.refresh_size_estimate();
        rec
    }

    /// Recompute `raw_size_estimate` from the serialized payload length.
    pub fn refresh_size_estimate(&mut self) {
        self.raw_size_estimate = serde_json::to_vec(&self.payload)
            .map(|v| v.len() as u64)
            .unwrap_or(0);
    }

    pub fn url(&self) -> Option<&str> {
        self.payload.get("url").and_then(Scalar::as_text)
    }

    /// Check the mandatory subset: non-empty `title` and `url`, and a `timestamp`
    /// that is either an integer or non-empty text.
    pub fn validate(&self) -> Result<(), RecordError> {
        for field in ["title", "url"] {
            match self.payload.get(field).and_then(Scalar::as_text) {
                Some(s) if !s.trim().is_empty() => {}
                _ => return Err(RecordError::MissingField(field)),
            }
        }
        match self.payload.get("timestamp") {
            Some(Scalar::Int(_)) => Ok(()),
            Some(Scalar::Text(s)) if !s.trim().is_empty() => Ok(()),
            _ => Err(RecordError::MissingField("timestamp")),
        }
    }

    /// Stable key for idempotent downstream merges: `(source, fetched_at, url)`.
    pub fn merge_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.source.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.fetched_at.timestamp_micros().to_le_bytes());
        hasher.update([0u8]);
        hasher.update(self.url().unwrap_or_default().as_bytes());
        let digest = hasher.finalize();
        let mut out = String::with_capacity(32);
        for b in digest.iter().take(16) {
            use std::fmt::Write as _;
            let _ = write!(&mut out, "{:02x}", b);
        }
        out
    }

    /// Project the payload onto [`SLIM_FIELDS`], deriving `summary` and
    /// `timestamp` from their long-form counterparts when missing.
    pub fn into_slim(mut self) -> Self {
        if !self.payload.contains_key("summary") {
            if let Some(text) = self.payload.get("text").and_then(Scalar::as_text) {
                let summary: String = text.chars().take(SLIM_SUMMARY_CHARS).collect();
                self.payload.insert("summary".into(), Scalar::Text(summary));
            }
        }
        if !self.payload.contains_key("timestamp") {
            if let Some(ts) = self.payload.get("crawl_timestamp").cloned() {
                self.payload.insert("timestamp".into(), ts);
            }
        }
        self.payload.retain(|k, _| SLIM_FIELDS.contains(&k.as_str()));
        self.refresh_size_estimate();
        self
    }
}

/// Small helper for building payloads in fetchers and tests.
pub fn payload<I, K, V>(pairs: I) -> Payload
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Scalar>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> Record {
        Record::at(
            SourceKind::Rss,
            Utc.with_ymd_and_hms(2025, 10, 20, 12, 0, 0).unwrap(),
            payload([
                ("title", Scalar::from("Fed holds rates")),
                ("url", Scalar::from("https://example.test/a")),
                ("timestamp", Scalar::from(1_760_961_600i64)),
            ]),
        )
    }

    #[test]
    fn valid_record_passes() {
        assert_eq!(sample().validate(), Ok(()));
    }

    #[test]
    fn missing_url_is_rejected() {
        let mut r = sample();
        r.payload.remove("url");
        assert_eq!(r.validate(), Err(RecordError::MissingField("url")));
    }

    #[test]
    fn blank_title_is_rejected() {
        let mut r = sample();
        r.payload.insert("title".into(), Scalar::from("   "));
        assert_eq!(r.validate(), Err(RecordError::MissingField("title")));
    }

    #[test]
    fn size_estimate_tracks_payload() {
        let r = sample();
        let expected = serde_json::to_vec(&r.payload).unwrap().len() as u64;
        assert_eq!(r.raw_size_estimate, expected);
    }

    #[test]
    fn merge_key_is_stable_and_url_sensitive() {
        let a = sample();
        let b = sample();
        assert_eq!(a.merge_key(), b.merge_key());
        let mut c = sample();
        c.payload
            .insert("url".into(), Scalar::from("https://example.test/b"));
        assert_ne!(a.merge_key(), c.merge_key());
    }

    #[test]
    fn slim_mode_keeps_core_fields_and_derives_summary() {
        let mut r = sample();
        r.payload.insert("text".into(), Scalar::from("x".repeat(800)));
        r.payload.insert("like_count".into(), Scalar::from(12i64));
        let slim = r.into_slim();
        assert!(!slim.payload.contains_key("text"));
        assert!(!slim.payload.contains_key("like_count"));
        let summary = slim.payload["summary"].as_text().unwrap();
        assert_eq!(summary.chars().count(), 500);
        assert!(slim.validate().is_ok());
    }

    #[test]
    fn source_kind_parses_case_insensitively() {
        assert_eq!("RSS".parse::<SourceKind>(), Ok(SourceKind::Rss));
        assert_eq!(" newsapi ".parse::<SourceKind>(), Ok(SourceKind::NewsApi));
        assert!("bloomberg".parse::<SourceKind>().is_err());
    }

    #[test]
    fn scalar_rejects_nested_json() {
        let v = serde_json::json!({"a": 1});
        assert_eq!(Scalar::try_from(v), Err(RecordError::NonScalar));
    }
}
