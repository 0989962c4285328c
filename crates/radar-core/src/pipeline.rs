//! Ingestion pipeline
//!
//! Queue consumer: pop-with-timeout, normalize, atomic upsert, detail-row
//! persistence, then the alert policy, one message at a time with no
//! batch-wide locks.
//! Malformed messages dead-letter immediately; transient persistence
//! failures retry with bounded exponential backoff before dead-lettering.
//! Multiple consumer instances can run this loop concurrently.

use crate::alerts::AlertPolicy;
use crate::dedup::UpsertEngine;
use crate::error::RadarError;
use crate::normalize::{Normalizer, SourceDetail};
use crate::queue::EventQueue;
use crate::store::EventStore;
use crate::{AtoSignal, DmarcRecord, RadarConfig};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// What happened to one pop attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Queue was empty for the whole poll budget.
    Idle,
    Processed,
    DeadLettered,
}

#[derive(Debug, Default)]
pub struct PipelineStats {
    pub received: AtomicU64,
    pub processed: AtomicU64,
    pub alerts_created: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub retries: AtomicU64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PipelineMetrics {
    pub received: u64,
    pub processed: u64,
    pub alerts_created: u64,
    pub dead_lettered: u64,
    pub retries: u64,
}

pub struct IngestPipeline {
    queue: Arc<dyn EventQueue>,
    store: Arc<dyn EventStore>,
    normalizer: Normalizer,
    engine: UpsertEngine,
    policy: AlertPolicy,
    config: RadarConfig,
    stats: PipelineStats,
    sweep_requested: AtomicBool,
}

impl IngestPipeline {
    pub fn new(queue: Arc<dyn EventQueue>, store: Arc<dyn EventStore>, config: RadarConfig) -> Self {
        Self {
            queue,
            store,
            normalizer: Normalizer::new(),
            engine: UpsertEngine::new(config.dedup_bucket),
            policy: AlertPolicy::new(&config),
            stats: PipelineStats::default(),
            sweep_requested: AtomicBool::new(false),
            config,
        }
    }

    /// Pop and process at most one message, waiting up to `poll`.
    pub async fn process_one(&self, poll: Duration) -> ProcessOutcome {
        let body = match self.queue.pop(poll).await {
            Some(body) => body,
            None => return ProcessOutcome::Idle,
        };
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        match self.process_body(&body).await {
            Ok(()) => {
                self.stats.processed.fetch_add(1, Ordering::Relaxed);
                ProcessOutcome::Processed
            }
            Err(e) => {
                self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
                self.queue.push_dead_letter(body, e.to_string()).await;
                ProcessOutcome::DeadLettered
            }
        }
    }

    async fn process_body(&self, body: &str) -> Result<(), RadarError> {
        let normalized = self.normalizer.normalize(body)?;

        // Atomic per-key upsert, retried on transient failures. Replays
        // merge into the same row, so a retry after a half-applied attempt
        // cannot duplicate anything.
        let outcome = {
            let mut attempt = 0u32;
            loop {
                match self.engine.ingest(self.store.as_ref(), &normalized.draft).await {
                    Err(e) if e.is_retryable() && attempt < self.config.max_ingest_retries => {
                        attempt += 1;
                        self.stats.retries.fetch_add(1, Ordering::Relaxed);
                        let delay = self.config.retry_backoff_ms << (attempt - 1);
                        tracing::debug!(attempt, delay_ms = delay, "retrying upsert");
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                    other => break other?,
                }
            }
        };

        // Detail rows are built once so a retried insert stays idempotent.
        match &normalized.detail {
            SourceDetail::None => {}
            SourceDetail::Ato(draft) => {
                let row = AtoSignal {
                    id: Uuid::new_v4().to_string(),
                    threat_event_id: outcome.event.id.clone(),
                    account: draft.account.clone(),
                    origin_location: draft.origin_location.clone(),
                    login_location: draft.login_location.clone(),
                    risk_score: draft.risk_score,
                    action_taken: draft.action_taken.clone(),
                    created_at: Utc::now(),
                };
                self.insert_with_retries(|| self.store.insert_ato(row.clone())).await?;
            }
            SourceDetail::Dmarc(draft) => {
                let row = DmarcRecord {
                    id: Uuid::new_v4().to_string(),
                    threat_event_id: outcome.event.id.clone(),
                    domain: draft.domain.clone(),
                    reporting_org: draft.reporting_org.clone(),
                    source_ip: draft.source_ip.clone(),
                    disposition: draft.disposition.clone(),
                    spf_result: draft.spf_result.clone(),
                    dkim_result: draft.dkim_result.clone(),
                    message_count: draft.message_count,
                    report_date: draft.report_date,
                    created_at: Utc::now(),
                };
                self.insert_with_retries(|| self.store.insert_dmarc(row.clone())).await?;
            }
        }

        if let Some(alert) = self.policy.evaluate(self.store.as_ref(), &outcome.event).await? {
            self.stats.alerts_created.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(alert = %alert.id, "escalated");
        }

        if outcome.event.confidence >= self.config.alert_threshold {
            self.sweep_requested.store(true, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn insert_with_retries<F, Fut>(&self, mut op: F) -> Result<(), RadarError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<(), RadarError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Err(e) if e.is_retryable() && attempt < self.config.max_ingest_retries => {
                    attempt += 1;
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    let delay = self.config.retry_backoff_ms << (attempt - 1);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                other => return other,
            }
        }
    }

    /// Drain the queue without blocking; for tests and the demo seeder.
    pub async fn run_until_idle(&self) {
        while self.process_one(Duration::from_millis(10)).await != ProcessOutcome::Idle {}
    }

    /// Consumer loop for the server: poll-with-timeout, never busy-spins.
    pub async fn run(&self) {
        tracing::info!(queue = %self.config.queue_name, "pipeline consumer started");
        loop {
            self.process_one(Duration::from_secs(5)).await;
        }
    }

    /// True once since the last call if a high-confidence upsert asked
    /// for an immediate correlation pass.
    pub fn take_sweep_request(&self) -> bool {
        self.sweep_requested.swap(false, Ordering::Relaxed)
    }

    pub fn metrics(&self) -> PipelineMetrics {
        PipelineMetrics {
            received: self.stats.received.load(Ordering::Relaxed),
            processed: self.stats.processed.load(Ordering::Relaxed),
            alerts_created: self.stats.alerts_created.load(Ordering::Relaxed),
            dead_lettered: self.stats.dead_lettered.load(Ordering::Relaxed),
            retries: self.stats.retries.load(Ordering::Relaxed),
        }
    }
}
