//! Alert policy
//!
//! Runs synchronously after a successful upsert. Escalates events whose
//! confidence crosses the configured threshold, at most once per event per
//! cooldown window, with severity from a fixed confidence banding.
//! Idempotent under replay.

use crate::error::RadarError;
use crate::store::EventStore;
use crate::{Alert, AlertStatus, RadarConfig, Severity, ThreatEvent};
use chrono::Utc;
use uuid::Uuid;

pub struct AlertPolicy {
    threshold: u8,
    cooldown: chrono::Duration,
}

impl AlertPolicy {
    pub fn new(config: &RadarConfig) -> Self {
        Self {
            threshold: config.alert_threshold,
            cooldown: config.alert_cooldown,
        }
    }

    /// Severity banding: >= 95 critical, everything else over the
    /// threshold is high.
    fn severity_for(&self, confidence: u8) -> Severity {
        if confidence >= 95 {
            Severity::Critical
        } else {
            Severity::High
        }
    }

    /// Evaluate a freshly upserted event; returns the created alert, if
    /// any. Re-ingesting the same event inside the cooldown is a no-op.
    pub async fn evaluate(
        &self,
        store: &dyn EventStore,
        event: &ThreatEvent,
    ) -> Result<Option<Alert>, RadarError> {
        if event.confidence < self.threshold {
            return Ok(None);
        }

        let cooldown_start = Utc::now() - self.cooldown;
        if store.open_alert_for(&event.id, cooldown_start).await?.is_some() {
            return Ok(None);
        }

        let severity = self.severity_for(event.confidence);
        let alert = Alert {
            id: Uuid::new_v4().to_string(),
            threat_event_id: event.id.clone(),
            severity,
            status: AlertStatus::Open,
            title: format!("{} flagged by {}", event.subject, event.source_type.as_str()),
            description: format!(
                "{} observed {} time(s) with confidence {}%.",
                event.subject, event.occurrence_count, event.confidence
            ),
            created_at: Utc::now(),
        };
        tracing::info!(
            subject = %event.subject,
            confidence = event.confidence,
            severity = ?severity,
            "alert created"
        );
        store.insert_alert(alert.clone()).await?;
        Ok(Some(alert))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::{BucketGranularity, UpsertEngine};
    use crate::store::MemoryStore;
    use crate::{EventDraft, SourceType};
    use serde_json::json;

    fn draft(confidence: u8) -> EventDraft {
        EventDraft {
            source_type: SourceType::Certstream,
            subject: "login-micros0ft.com".into(),
            observed_at: Utc::now(),
            confidence,
            raw_payload: json!({}),
        }
    }

    async fn ingest_and_evaluate(
        store: &MemoryStore,
        policy: &AlertPolicy,
        confidence: u8,
    ) -> Option<Alert> {
        let engine = UpsertEngine::new(BucketGranularity::Day);
        let outcome = engine.ingest(store, &draft(confidence)).await.unwrap();
        policy.evaluate(store, &outcome.event).await.unwrap()
    }

    #[tokio::test]
    async fn test_below_threshold_no_alert() {
        let store = MemoryStore::new();
        let policy = AlertPolicy::new(&RadarConfig::default());
        assert!(ingest_and_evaluate(&store, &policy, 79).await.is_none());
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_second_alert() {
        let store = MemoryStore::new();
        let policy = AlertPolicy::new(&RadarConfig::default());

        let first = ingest_and_evaluate(&store, &policy, 85).await;
        assert!(first.is_some());

        // Second sighting at higher confidence, same natural key, inside
        // the cooldown: no new alert even though confidence moved to 90.
        let second = ingest_and_evaluate(&store, &policy, 90).await;
        assert!(second.is_none());

        let alerts = store
            .alerts_since(Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(alerts.len(), 1);
    }

    #[tokio::test]
    async fn test_severity_banding() {
        let store = MemoryStore::new();
        let policy = AlertPolicy::new(&RadarConfig::default());

        let high = ingest_and_evaluate(&store, &policy, 88).await.unwrap();
        assert_eq!(high.severity, Severity::High);

        let store2 = MemoryStore::new();
        let critical = ingest_and_evaluate(&store2, &policy, 96).await.unwrap();
        assert_eq!(critical.severity, Severity::Critical);
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let store = MemoryStore::new();
        let policy = AlertPolicy::new(&RadarConfig::default());
        for _ in 0..5 {
            ingest_and_evaluate(&store, &policy, 85).await;
        }
        let alerts = store
            .alerts_since(Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(alerts.len(), 1);
    }
}
