//! Event normalization
//!
//! Converts raw provider payloads into one canonical [`EventDraft`] per
//! message. Parsers are registered per source type; unknown or extra
//! payload fields are preserved verbatim in `raw_payload` for audit and
//! never interpreted. Pure transform: no side effects beyond counters.

use crate::error::RadarError;
use crate::{EventDraft, SourceType};
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

/// Account-takeover detail extracted alongside the draft.
#[derive(Debug, Clone)]
pub struct AtoDraft {
    pub account: String,
    pub origin_location: String,
    pub login_location: String,
    pub risk_score: u8,
    pub action_taken: String,
}

/// DMARC detail extracted alongside the draft.
#[derive(Debug, Clone)]
pub struct DmarcDraft {
    pub domain: String,
    pub reporting_org: String,
    pub source_ip: String,
    pub disposition: String,
    pub spf_result: String,
    pub dkim_result: String,
    pub message_count: u64,
    pub report_date: NaiveDate,
}

/// Source-specific detail rows carried next to the canonical draft.
#[derive(Debug, Clone)]
pub enum SourceDetail {
    None,
    Ato(AtoDraft),
    Dmarc(DmarcDraft),
}

/// One canonical draft plus whatever detail the source contributes.
#[derive(Debug, Clone)]
pub struct NormalizedEvent {
    pub draft: EventDraft,
    pub detail: SourceDetail,
}

pub trait SourceParser: Send + Sync {
    fn source_type(&self) -> SourceType;
    fn parse(&self, raw: &Value) -> Result<NormalizedEvent, RadarError>;
}

pub struct Normalizer {
    parsers: dashmap::DashMap<SourceType, Box<dyn SourceParser>>,
    processed: AtomicU64,
    failed: AtomicU64,
}

impl Normalizer {
    pub fn new() -> Self {
        let normalizer = Self {
            parsers: dashmap::DashMap::new(),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        };
        normalizer.register(Box::new(FeedParser));
        normalizer.register(Box::new(CertstreamParser));
        normalizer.register(Box::new(AtoParser));
        normalizer.register(Box::new(DmarcParser));
        normalizer
    }

    pub fn register(&self, parser: Box<dyn SourceParser>) {
        self.parsers.insert(parser.source_type(), parser);
    }

    /// Normalize one serialized queue message.
    pub fn normalize(&self, body: &str) -> Result<NormalizedEvent, RadarError> {
        let raw: Value = serde_json::from_str(body)
            .map_err(|e| RadarError::MalformedEvent(format!("invalid json: {e}")))?;

        let source = raw
            .get("source_type")
            .and_then(Value::as_str)
            .and_then(SourceType::parse)
            .ok_or_else(|| RadarError::MalformedEvent("missing or unknown source_type".into()))?;

        let parser = self
            .parsers
            .get(&source)
            .ok_or_else(|| RadarError::MalformedEvent(format!("no parser for {}", source.as_str())))?;

        match parser.parse(&raw) {
            Ok(event) => {
                self.processed.fetch_add(1, Ordering::Relaxed);
                Ok(event)
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> (u64, u64) {
        (
            self.processed.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
        )
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new()
    }
}

fn required_subject(raw: &Value) -> Result<String, RadarError> {
    raw.get("subject")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| RadarError::MalformedEvent("missing subject".into()))
}

fn required_observed_at(raw: &Value) -> Result<DateTime<Utc>, RadarError> {
    let text = raw
        .get("observed_at")
        .and_then(Value::as_str)
        .ok_or_else(|| RadarError::MalformedEvent("missing observed_at".into()))?;
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RadarError::MalformedEvent(format!("unparseable observed_at: {e}")))
}

fn confidence_or(raw: &Value, default: u8) -> u8 {
    raw.get("confidence")
        .and_then(Value::as_u64)
        .map(|v| v.min(100) as u8)
        .unwrap_or(default)
}

fn payload_of(raw: &Value) -> Value {
    raw.get("payload").cloned().unwrap_or_else(|| Value::Object(Default::default()))
}

fn payload_str<'a>(payload: &'a Value, key: &str, default: &'a str) -> &'a str {
    payload.get(key).and_then(Value::as_str).unwrap_or(default)
}

fn draft(raw: &Value, source: SourceType, default_confidence: u8) -> Result<EventDraft, RadarError> {
    Ok(EventDraft {
        source_type: source,
        subject: required_subject(raw)?,
        observed_at: required_observed_at(raw)?,
        confidence: confidence_or(raw, default_confidence),
        raw_payload: payload_of(raw),
    })
}

// Generic threat-feed events: subject is the flagged domain or URL.
struct FeedParser;

impl SourceParser for FeedParser {
    fn source_type(&self) -> SourceType {
        SourceType::Feed
    }

    fn parse(&self, raw: &Value) -> Result<NormalizedEvent, RadarError> {
        Ok(NormalizedEvent {
            draft: draft(raw, SourceType::Feed, 50)?,
            detail: SourceDetail::None,
        })
    }
}

// CT-log lookalike hits: subject is the certificate domain.
struct CertstreamParser;

impl SourceParser for CertstreamParser {
    fn source_type(&self) -> SourceType {
        SourceType::Certstream
    }

    fn parse(&self, raw: &Value) -> Result<NormalizedEvent, RadarError> {
        let mut event = NormalizedEvent {
            draft: draft(raw, SourceType::Certstream, 80)?,
            detail: SourceDetail::None,
        };
        // Wildcard entries arrive as "*.domain"; anchor on the bare name.
        event.draft.subject = event
            .draft
            .subject
            .trim_start_matches("*.")
            .to_ascii_lowercase();
        Ok(event)
    }
}

// ATO signals: subject is the targeted account email.
struct AtoParser;

impl SourceParser for AtoParser {
    fn source_type(&self) -> SourceType {
        SourceType::Ato
    }

    fn parse(&self, raw: &Value) -> Result<NormalizedEvent, RadarError> {
        let payload = payload_of(raw);
        let risk_score = payload
            .get("risk_score")
            .and_then(Value::as_u64)
            .map(|v| v.min(100) as u8)
            .unwrap_or(50);

        let mut base = draft(raw, SourceType::Ato, risk_score)?;
        base.subject = base.subject.to_ascii_lowercase();

        let detail = AtoDraft {
            account: base.subject.clone(),
            origin_location: payload_str(&payload, "origin_location", "Unknown").to_string(),
            login_location: payload_str(&payload, "login_location", "Unknown").to_string(),
            risk_score,
            action_taken: payload_str(&payload, "action_taken", "monitor").to_string(),
        };

        Ok(NormalizedEvent {
            draft: base,
            detail: SourceDetail::Ato(detail),
        })
    }
}

// DMARC aggregate reports: subject is the reported domain.
struct DmarcParser;

impl SourceParser for DmarcParser {
    fn source_type(&self) -> SourceType {
        SourceType::Dmarc
    }

    fn parse(&self, raw: &Value) -> Result<NormalizedEvent, RadarError> {
        let payload = payload_of(raw);
        let mut base = draft(raw, SourceType::Dmarc, 60)?;
        base.subject = base.subject.to_ascii_lowercase();

        let report_date = payload
            .get("report_date")
            .and_then(Value::as_str)
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
            .unwrap_or_else(|| base.observed_at.date_naive());

        let detail = DmarcDraft {
            domain: base.subject.clone(),
            reporting_org: payload_str(&payload, "reporting_org", "unknown").to_string(),
            source_ip: payload_str(&payload, "source_ip", "0.0.0.0").to_string(),
            disposition: payload_str(&payload, "disposition", "none").to_string(),
            spf_result: payload_str(&payload, "spf_result", "fail").to_string(),
            dkim_result: payload_str(&payload, "dkim_result", "fail").to_string(),
            message_count: payload.get("msg_count").and_then(Value::as_u64).unwrap_or(1),
            report_date,
        };

        Ok(NormalizedEvent {
            draft: base,
            detail: SourceDetail::Dmarc(detail),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(v: Value) -> String {
        serde_json::to_string(&v).unwrap()
    }

    #[test]
    fn test_feed_event_normalizes() {
        let n = Normalizer::new();
        let event = n
            .normalize(&body(json!({
                "source_type": "feed",
                "subject": "pay-pal-secure.com",
                "observed_at": "2026-08-01T10:00:00Z",
                "confidence": 88,
                "payload": {"category": "Phishing URL", "extra": "kept"}
            })))
            .unwrap();
        assert_eq!(event.draft.source_type, SourceType::Feed);
        assert_eq!(event.draft.confidence, 88);
        assert_eq!(event.draft.raw_payload["extra"], "kept");
    }

    #[test]
    fn test_missing_subject_is_malformed() {
        let n = Normalizer::new();
        let err = n
            .normalize(&body(json!({
                "source_type": "feed",
                "observed_at": "2026-08-01T10:00:00Z"
            })))
            .unwrap_err();
        assert!(matches!(err, RadarError::MalformedEvent(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_bad_timestamp_is_malformed() {
        let n = Normalizer::new();
        let err = n
            .normalize(&body(json!({
                "source_type": "certstream",
                "subject": "login.paypa1.com",
                "observed_at": "yesterday-ish"
            })))
            .unwrap_err();
        assert!(matches!(err, RadarError::MalformedEvent(_)));
    }

    #[test]
    fn test_certstream_strips_wildcard() {
        let n = Normalizer::new();
        let event = n
            .normalize(&body(json!({
                "source_type": "certstream",
                "subject": "*.Pay-Pal-Secure.com",
                "observed_at": "2026-08-01T10:00:00Z"
            })))
            .unwrap();
        assert_eq!(event.draft.subject, "pay-pal-secure.com");
    }

    #[test]
    fn test_ato_detail_extracted() {
        let n = Normalizer::new();
        let event = n
            .normalize(&body(json!({
                "source_type": "ato",
                "subject": "jane.doe@paypal.com",
                "observed_at": "2026-08-01T10:00:00Z",
                "payload": {
                    "risk_score": 92,
                    "origin_location": "Berlin",
                    "login_location": "Lagos",
                    "action_taken": "force_reset"
                }
            })))
            .unwrap();
        // Confidence falls back to the risk score when not set explicitly.
        assert_eq!(event.draft.confidence, 92);
        match event.detail {
            SourceDetail::Ato(a) => {
                assert_eq!(a.account, "jane.doe@paypal.com");
                assert_eq!(a.login_location, "Lagos");
            }
            _ => panic!("expected ato detail"),
        }
    }

    #[test]
    fn test_dmarc_detail_extracted() {
        let n = Normalizer::new();
        let event = n
            .normalize(&body(json!({
                "source_type": "dmarc",
                "subject": "paypal.com",
                "observed_at": "2026-08-01T10:00:00Z",
                "payload": {
                    "reporting_org": "google.com",
                    "source_ip": "203.0.113.9",
                    "disposition": "reject",
                    "spf_result": "fail",
                    "dkim_result": "pass",
                    "msg_count": 140,
                    "report_date": "2026-07-31"
                }
            })))
            .unwrap();
        match event.detail {
            SourceDetail::Dmarc(d) => {
                assert_eq!(d.source_ip, "203.0.113.9");
                assert_eq!(d.message_count, 140);
            }
            _ => panic!("expected dmarc detail"),
        }
    }

    #[test]
    fn test_unknown_source_rejected() {
        let n = Normalizer::new();
        assert!(n
            .normalize(&body(json!({"source_type": "carrier-pigeon", "subject": "x"})))
            .is_err());
    }
}
