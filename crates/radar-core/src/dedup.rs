//! Deduplication and upsert
//!
//! Maps each normalized draft to a stable natural key
//! `(source_type, subject, coarse time bucket)` and drives the store's
//! atomic per-key upsert. The coarse bucket absorbs near-duplicate bursts
//! from one source without collapsing distinct days into one row.

use crate::error::RadarError;
use crate::store::{EventStore, UpsertOutcome};
use crate::EventDraft;
use chrono::{DateTime, Timelike, Utc};
use sha2::{Digest, Sha256};

/// Granularity the natural key truncates `observed_at` to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketGranularity {
    Hour,
    Day,
}

impl BucketGranularity {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hour" => Some(Self::Hour),
            "day" => Some(Self::Day),
            _ => None,
        }
    }

    fn label(&self, at: DateTime<Utc>) -> String {
        match self {
            Self::Day => at.format("%Y-%m-%d").to_string(),
            Self::Hour => at
                .with_minute(0)
                .and_then(|t| t.with_second(0))
                .unwrap_or(at)
                .format("%Y-%m-%dT%H")
                .to_string(),
        }
    }
}

/// Stable dedup key for one draft. Subject matching is case- and
/// whitespace-insensitive so provider quirks do not split rows.
pub fn natural_key(draft: &EventDraft, bucket: BucketGranularity) -> String {
    let material = format!(
        "{}|{}|{}",
        draft.source_type.as_str(),
        draft.subject.trim().to_ascii_lowercase(),
        bucket.label(draft.observed_at),
    );
    let digest = Sha256::digest(material.as_bytes());
    hex::encode(digest)
}

/// Drives insert-vs-update decisions against the store.
pub struct UpsertEngine {
    bucket: BucketGranularity,
}

impl UpsertEngine {
    pub fn new(bucket: BucketGranularity) -> Self {
        Self { bucket }
    }

    /// Ingest one draft. Safe to retry: replays land on the same key and
    /// merge instead of duplicating.
    pub async fn ingest(
        &self,
        store: &dyn EventStore,
        draft: &EventDraft,
    ) -> Result<UpsertOutcome, RadarError> {
        let key = natural_key(draft, self.bucket);
        store.upsert_event(&key, draft).await
    }
}
