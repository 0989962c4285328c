//! Persistence seam
//!
//! The storage engine is an ordinary relational store and an external
//! collaborator; [`EventStore`] is the seam the engine talks through.
//! [`MemoryStore`] is the in-process implementation. The per-key upsert is
//! the sole synchronization point guarding concurrent consumers: it holds
//! the map entry for one dedup key only, never a lock across a batch.

use crate::error::RadarError;
use crate::{Alert, AtoSignal, Campaign, DmarcRecord, EventDraft, ThreatEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Result of an atomic per-key upsert.
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub event: ThreatEvent,
    pub created: bool,
}

/// Aggregate row counts for the dashboard surface.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StoreCounts {
    pub threat_events: usize,
    pub alerts: usize,
    pub campaigns: usize,
    pub ato_signals: usize,
    pub dmarc_records: usize,
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert-or-update by dedup key. Present keys merge: occurrence count
    /// increments, `last_seen` takes the max, confidence never regresses,
    /// payload objects merge shallowly with incoming keys winning.
    async fn upsert_event(&self, key: &str, draft: &EventDraft) -> Result<UpsertOutcome, RadarError>;

    async fn event(&self, id: &str) -> Result<Option<ThreatEvent>, RadarError>;

    /// Snapshot of events with `last_seen` at or after `since`.
    async fn events_since(&self, since: DateTime<Utc>) -> Result<Vec<ThreatEvent>, RadarError>;

    async fn insert_alert(&self, alert: Alert) -> Result<(), RadarError>;

    /// Open alert referencing the event, created at or after `since`.
    async fn open_alert_for(
        &self,
        threat_event_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Alert>, RadarError>;

    async fn alerts_since(&self, since: DateTime<Utc>) -> Result<Vec<Alert>, RadarError>;

    async fn insert_ato(&self, signal: AtoSignal) -> Result<(), RadarError>;

    async fn insert_dmarc(&self, record: DmarcRecord) -> Result<(), RadarError>;

    async fn ato_since(&self, since: DateTime<Utc>) -> Result<Vec<AtoSignal>, RadarError>;

    async fn dmarc_since(&self, since: DateTime<Utc>) -> Result<Vec<DmarcRecord>, RadarError>;

    async fn upsert_campaign(&self, campaign: Campaign) -> Result<(), RadarError>;

    async fn campaign(&self, id: &str) -> Result<Option<Campaign>, RadarError>;

    async fn all_campaigns(&self) -> Result<Vec<Campaign>, RadarError>;

    async fn counts(&self) -> Result<StoreCounts, RadarError>;
}

/// Concurrent in-memory store keyed the way the relational schema is.
pub struct MemoryStore {
    events: dashmap::DashMap<String, ThreatEvent>,
    event_ids: dashmap::DashMap<String, String>,
    alerts: dashmap::DashMap<String, Alert>,
    atos: dashmap::DashMap<String, AtoSignal>,
    dmarcs: dashmap::DashMap<String, DmarcRecord>,
    campaigns: dashmap::DashMap<String, Campaign>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            events: dashmap::DashMap::new(),
            event_ids: dashmap::DashMap::new(),
            alerts: dashmap::DashMap::new(),
            atos: dashmap::DashMap::new(),
            dmarcs: dashmap::DashMap::new(),
            campaigns: dashmap::DashMap::new(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn merge_payload(existing: &mut serde_json::Value, incoming: &serde_json::Value) {
    if let (Some(base), Some(extra)) = (existing.as_object_mut(), incoming.as_object()) {
        for (k, v) in extra {
            base.insert(k.clone(), v.clone());
        }
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn upsert_event(&self, key: &str, draft: &EventDraft) -> Result<UpsertOutcome, RadarError> {
        // Entry API holds this key's shard lock for the whole merge, so two
        // consumers racing on one natural key cannot produce two rows.
        let mut created = false;
        let entry = self
            .events
            .entry(key.to_string())
            .and_modify(|event| {
                event.occurrence_count += 1;
                event.last_seen = event.last_seen.max(draft.observed_at);
                event.confidence = event.confidence.max(draft.confidence);
                merge_payload(&mut event.raw_payload, &draft.raw_payload);
            })
            .or_insert_with(|| {
                created = true;
                ThreatEvent {
                    id: Uuid::new_v4().to_string(),
                    source_type: draft.source_type,
                    subject: draft.subject.clone(),
                    observed_at: draft.observed_at,
                    confidence: draft.confidence,
                    raw_payload: draft.raw_payload.clone(),
                    first_seen: draft.observed_at,
                    last_seen: draft.observed_at,
                    occurrence_count: 1,
                    dedup_key: key.to_string(),
                }
            });
        let event = entry.clone();
        drop(entry);

        if created {
            self.event_ids.insert(event.id.clone(), key.to_string());
        }
        Ok(UpsertOutcome { event, created })
    }

    async fn event(&self, id: &str) -> Result<Option<ThreatEvent>, RadarError> {
        Ok(self
            .event_ids
            .get(id)
            .and_then(|key| self.events.get(key.value()).map(|e| e.clone())))
    }

    async fn events_since(&self, since: DateTime<Utc>) -> Result<Vec<ThreatEvent>, RadarError> {
        let mut out: Vec<ThreatEvent> = self
            .events
            .iter()
            .filter(|e| e.last_seen >= since)
            .map(|e| e.clone())
            .collect();
        out.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        Ok(out)
    }

    async fn insert_alert(&self, alert: Alert) -> Result<(), RadarError> {
        self.alerts.insert(alert.id.clone(), alert);
        Ok(())
    }

    async fn open_alert_for(
        &self,
        threat_event_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Alert>, RadarError> {
        Ok(self
            .alerts
            .iter()
            .find(|a| {
                a.threat_event_id == threat_event_id
                    && a.status == crate::AlertStatus::Open
                    && a.created_at >= since
            })
            .map(|a| a.clone()))
    }

    async fn alerts_since(&self, since: DateTime<Utc>) -> Result<Vec<Alert>, RadarError> {
        let mut out: Vec<Alert> = self
            .alerts
            .iter()
            .filter(|a| a.created_at >= since)
            .map(|a| a.clone())
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    async fn insert_ato(&self, signal: AtoSignal) -> Result<(), RadarError> {
        self.atos.insert(signal.id.clone(), signal);
        Ok(())
    }

    async fn insert_dmarc(&self, record: DmarcRecord) -> Result<(), RadarError> {
        self.dmarcs.insert(record.id.clone(), record);
        Ok(())
    }

    async fn ato_since(&self, since: DateTime<Utc>) -> Result<Vec<AtoSignal>, RadarError> {
        Ok(self
            .atos
            .iter()
            .filter(|s| s.created_at >= since)
            .map(|s| s.clone())
            .collect())
    }

    async fn dmarc_since(&self, since: DateTime<Utc>) -> Result<Vec<DmarcRecord>, RadarError> {
        Ok(self
            .dmarcs
            .iter()
            .filter(|r| r.created_at >= since)
            .map(|r| r.clone())
            .collect())
    }

    async fn upsert_campaign(&self, campaign: Campaign) -> Result<(), RadarError> {
        self.campaigns.insert(campaign.id.clone(), campaign);
        Ok(())
    }

    async fn campaign(&self, id: &str) -> Result<Option<Campaign>, RadarError> {
        Ok(self.campaigns.get(id).map(|c| c.clone()))
    }

    async fn all_campaigns(&self) -> Result<Vec<Campaign>, RadarError> {
        Ok(self.campaigns.iter().map(|c| c.clone()).collect())
    }

    async fn counts(&self) -> Result<StoreCounts, RadarError> {
        Ok(StoreCounts {
            threat_events: self.events.len(),
            alerts: self.alerts.len(),
            campaigns: self.campaigns.len(),
            ato_signals: self.atos.len(),
            dmarc_records: self.dmarcs.len(),
        })
    }
}
