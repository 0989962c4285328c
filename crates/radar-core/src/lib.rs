//! PhishRadar ingestion and correlation engine
//!
//! Consumes heterogeneous security telemetry (threat-feed hits, CT-log
//! lookalike matches, account-takeover signals, DMARC reports) from a
//! durable queue, deduplicates it into threat events, escalates
//! high-confidence events into alerts, and correlates events across signal
//! types into campaigns that can drive downstream remediation.
//!
//! # Architecture
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                      INGESTION & CORRELATION                         │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                                                                      │
//! │  producers ──▶ Event Queue ──▶ Normalizer ──▶ Upsert Engine          │
//! │                                                    │                 │
//! │                                                    ▼                 │
//! │                 Alert Policy ◀──────────── persisted events          │
//! │                                                    │                 │
//! │                                                    ▼                 │
//! │                 Campaign Correlator ──▶ campaigns ──▶ Orchestrator   │
//! │                 (windowed sweep)                     (dry-run aware) │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub mod alerts;
pub mod config;
pub mod correlation;
pub mod dedup;
pub mod error;
pub mod feedsim;
pub mod normalize;
pub mod orchestrate;
pub mod pipeline;
pub mod queue;
pub mod store;

pub use config::RadarConfig;
pub use error::RadarError;

// =============================================================================
// Core Types
// =============================================================================

/// Telemetry signal families the engine ingests.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// Generic threat-feed event (URLhaus-style or synthetic feed).
    Feed,
    /// Certificate-transparency lookalike hit.
    Certstream,
    /// Account-takeover signal.
    Ato,
    /// DMARC aggregate report.
    Dmarc,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Feed => "feed",
            Self::Certstream => "certstream",
            Self::Ato => "ato",
            Self::Dmarc => "dmarc",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "feed" => Some(Self::Feed),
            "certstream" => Some(Self::Certstream),
            "ato" => Some(Self::Ato),
            "dmarc" => Some(Self::Dmarc),
            _ => None,
        }
    }
}

/// Canonical deduplicated telemetry event.
///
/// `dedup_key` is unique: repeated sightings of the same natural key
/// increment `occurrence_count` and refresh `last_seen` instead of creating
/// a second row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatEvent {
    pub id: String,
    pub source_type: SourceType,
    /// Domain, brand, or account identifier the event is about.
    pub subject: String,
    pub observed_at: DateTime<Utc>,
    /// 0-100; never regresses across repeat sightings.
    pub confidence: u8,
    /// Opaque provider payload, preserved for audit.
    pub raw_payload: serde_json::Value,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub occurrence_count: u64,
    pub dedup_key: String,
}

/// Normalized event before persistence (no store identity yet).
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub source_type: SourceType,
    pub subject: String,
    pub observed_at: DateTime<Utc>,
    pub confidence: u8,
    pub raw_payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Open,
    Acknowledged,
    Closed,
}

/// Escalation record referencing (not owning) a threat event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub threat_event_id: String,
    pub severity: Severity,
    pub status: AlertStatus,
    pub title: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// Account-takeover detail row linked to a threat event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtoSignal {
    pub id: String,
    pub threat_event_id: String,
    /// Targeted account, usually an email address.
    pub account: String,
    pub origin_location: String,
    pub login_location: String,
    pub risk_score: u8,
    pub action_taken: String,
    pub created_at: DateTime<Utc>,
}

/// DMARC aggregate-report detail row linked to a threat event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DmarcRecord {
    pub id: String,
    pub threat_event_id: String,
    pub domain: String,
    pub reporting_org: String,
    pub source_ip: String,
    pub disposition: String,
    pub spf_result: String,
    pub dkim_result: String,
    pub message_count: u64,
    pub report_date: NaiveDate,
    pub created_at: DateTime<Utc>,
}

impl DmarcRecord {
    /// An authentication failure worth corroborating a campaign with.
    pub fn is_failure(&self) -> bool {
        self.disposition == "reject" || self.spf_result != "pass" || self.dkim_result != "pass"
    }
}

/// Campaign lifecycle. Transitions are one-directional; a stale campaign
/// returns to active only by acquiring a new member event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Active,
    Stale,
    Resolved,
}

/// Cross-signal attacker operation grouped by a shared identity anchor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    /// Shared identity value (brand key) the members were grouped by.
    pub anchor: String,
    /// Human-readable brand label inferred from the monitored-brand list.
    pub brand: String,
    pub member_event_ids: BTreeSet<String>,
    pub signal_types_present: BTreeSet<SourceType>,
    /// Derived, recomputed every correlation pass; capped at 100.
    pub confidence_score: u8,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub status: CampaignStatus,
    pub created_at: DateTime<Utc>,
    /// What escalated this campaign, e.g. "Lookalike domain activity".
    pub triggers: Vec<String>,
}

impl Campaign {
    /// Whether any member belongs to the given signal type.
    pub fn has_signal(&self, source: SourceType) -> bool {
        self.signal_types_present.contains(&source)
    }
}
