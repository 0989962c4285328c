//! Orchestration payload builders
//!
//! Pure functions from a campaign snapshot to provider-specific action
//! payloads, plus the dispatch step. Each builder is independently
//! pluggable; a provider with no applicable data for a campaign is simply
//! omitted. Dispatch is per provider with its own timeout: one provider's
//! failure never blocks the others. Payloads are ephemeral, derived from
//! the snapshot at generation time and regenerated rather than edited.

use crate::error::RadarError;
use crate::store::EventStore;
use crate::{AtoSignal, Campaign, DmarcRecord, RadarConfig, SourceType, ThreatEvent};
use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration as StdDuration;

/// Everything a builder may draw on: the campaign, its member events, and
/// the linked detail rows, with the top indicators pre-derived.
pub struct CampaignContext {
    pub campaign: Campaign,
    pub members: Vec<ThreatEvent>,
    pub dmarc_records: Vec<DmarcRecord>,
    pub ato_signals: Vec<AtoSignal>,
    pub ioc_domains: Vec<String>,
    pub ioc_ips: Vec<String>,
    pub affected_accounts: Vec<String>,
    pub evidence_url: String,
}

impl CampaignContext {
    /// Assemble the snapshot for one campaign. Detail rows are read-only
    /// evidence; only rows linked to member events are included.
    pub async fn load(
        store: &dyn EventStore,
        campaign: Campaign,
        config: &RadarConfig,
    ) -> Result<Self, RadarError> {
        let mut members = Vec::new();
        for id in &campaign.member_event_ids {
            if let Some(event) = store.event(id).await? {
                members.push(event);
            }
        }
        members.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));

        let since = Utc::now() - Duration::hours(168);
        let dmarc_records: Vec<DmarcRecord> = store
            .dmarc_since(since)
            .await?
            .into_iter()
            .filter(|r| campaign.member_event_ids.contains(&r.threat_event_id))
            .collect();
        let ato_signals: Vec<AtoSignal> = store
            .ato_since(since)
            .await?
            .into_iter()
            .filter(|s| campaign.member_event_ids.contains(&s.threat_event_id))
            .collect();

        let mut domain_counts: HashMap<&str, u64> = HashMap::new();
        let mut ip_counts: HashMap<&str, u64> = HashMap::new();
        for event in &members {
            if matches!(event.source_type, SourceType::Certstream | SourceType::Feed) {
                *domain_counts.entry(event.subject.as_str()).or_default() += event.occurrence_count;
            }
            if let Some(ip) = event.raw_payload.get("source_ip").and_then(Value::as_str) {
                *ip_counts.entry(ip).or_default() += 1;
            }
        }
        for record in &dmarc_records {
            *ip_counts.entry(record.source_ip.as_str()).or_default() += record.message_count;
        }

        let ioc_domains = top_keys(domain_counts, 5);
        let ioc_ips = top_keys(ip_counts, 5);
        let affected_accounts: Vec<String> = ato_signals
            .iter()
            .map(|s| s.account.clone())
            .take(5)
            .collect();
        let evidence_url = format!(
            "{}/api/campaigns/{}/evidence/dmarc",
            config.public_api_base_url, campaign.id
        );

        Ok(Self {
            campaign,
            members,
            dmarc_records,
            ato_signals,
            ioc_domains,
            ioc_ips,
            affected_accounts,
            evidence_url,
        })
    }

    fn primary_domain(&self) -> Option<&str> {
        self.ioc_domains.first().map(String::as_str)
    }

    fn attacker_ip(&self) -> Option<&str> {
        self.ioc_ips.first().map(String::as_str)
    }

    fn dmarc_fail_count(&self) -> u64 {
        self.dmarc_records
            .iter()
            .filter(|r| r.is_failure())
            .map(|r| r.message_count)
            .sum()
    }
}

fn top_keys(counts: HashMap<&str, u64>, limit: usize) -> Vec<String> {
    let mut pairs: Vec<(&str, u64)> = counts.into_iter().collect();
    pairs.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    pairs.into_iter().take(limit).map(|(k, _)| k.to_string()).collect()
}

/// Capability interface: one implementation per downstream provider.
pub trait PayloadBuilder: Send + Sync {
    fn provider(&self) -> &'static str;
    /// Whether this campaign carries the data the provider acts on.
    fn applicable(&self, ctx: &CampaignContext) -> bool;
    fn build(&self, ctx: &CampaignContext) -> Value;
}

/// Blocklist submission: lookalike domain plus associated attacker IP.
pub struct BlocklistBuilder;

impl PayloadBuilder for BlocklistBuilder {
    fn provider(&self) -> &'static str {
        "blocklist"
    }

    fn applicable(&self, ctx: &CampaignContext) -> bool {
        ctx.primary_domain().is_some() || ctx.attacker_ip().is_some()
    }

    fn build(&self, ctx: &CampaignContext) -> Value {
        let mut indicators = Vec::new();
        if let Some(domain) = ctx.primary_domain() {
            indicators.push(json!({
                "value": domain,
                "operator": "equal",
                "comment": "Auto-block: correlated campaign with lookalike infrastructure and telemetry evidence.",
            }));
        }
        if let Some(ip) = ctx.attacker_ip() {
            indicators.push(json!({
                "value": ip,
                "operator": "equal",
                "comment": "Auto-block: associated attacker IP for correlated campaign.",
            }));
        }
        json!({
            "action": "add",
            "threat_type": "domain",
            "campaign_id": ctx.campaign.id,
            "indicators": indicators,
        })
    }
}

/// Takedown / digital-risk-protection incident for the hosting provider.
pub struct TakedownBuilder;

impl PayloadBuilder for TakedownBuilder {
    fn provider(&self) -> &'static str {
        "takedown"
    }

    fn applicable(&self, ctx: &CampaignContext) -> bool {
        ctx.primary_domain().is_some()
    }

    fn build(&self, ctx: &CampaignContext) -> Value {
        let domain = ctx.primary_domain().unwrap_or_default();
        let priority = if ctx.campaign.confidence_score >= 90 {
            "critical"
        } else {
            "high"
        };
        json!({
            "incident_type": "brand_impersonation",
            "target_url": format!("https://{domain}/auth/login"),
            "impersonated_brand": ctx.campaign.brand,
            "priority": priority,
            "automated_authorization": true,
            "evidence_package": {
                "campaign_id": ctx.campaign.id,
                "dmarc_failure_log_url": ctx.evidence_url,
                "dmarc_fail_count": ctx.dmarc_fail_count(),
                "ato_signal_count": ctx.ato_signals.len(),
                "triggers": ctx.campaign.triggers,
            },
        })
    }
}

/// Identity-provider workflow: terminate sessions and step up the most
/// recently targeted account.
pub struct IdentityWorkflowBuilder;

impl PayloadBuilder for IdentityWorkflowBuilder {
    fn provider(&self) -> &'static str {
        "identity"
    }

    fn applicable(&self, ctx: &CampaignContext) -> bool {
        !ctx.affected_accounts.is_empty()
    }

    fn build(&self, ctx: &CampaignContext) -> Value {
        let target = ctx.affected_accounts.first().cloned().unwrap_or_default();
        json!({
            "signal": {
                "campaign_id": ctx.campaign.id,
                "threat_confidence_score": ctx.campaign.confidence_score,
                "trigger_event": ctx.campaign.triggers.join(" + "),
            },
            "identity_target": {
                "user_email": target,
                "requested_response": "terminate_sessions_and_step_up",
                "context": {
                    "attacker_ip": ctx.attacker_ip().unwrap_or("0.0.0.0"),
                    "compromised_via": ctx.primary_domain().unwrap_or("unknown"),
                },
            },
        })
    }
}

/// Built payload for one provider, before any dispatch decision.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderPayload {
    pub provider: String,
    pub endpoint: Option<String>,
    pub payload: Value,
}

/// Per-provider delivery outcome.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    WouldSend,
    Sent { status_code: u16 },
    SkippedNoEndpoint,
    SkippedNoCredentials,
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryResult {
    pub provider: String,
    pub outcome: DeliveryOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationReport {
    pub dry_run: bool,
    pub results: Vec<DeliveryResult>,
    pub payloads: Vec<ProviderPayload>,
}

pub struct Orchestrator {
    builders: Vec<Box<dyn PayloadBuilder>>,
    client: reqwest::Client,
    config: RadarConfig,
}

impl Orchestrator {
    pub fn new(config: RadarConfig) -> Self {
        let builders: Vec<Box<dyn PayloadBuilder>> = vec![
            Box::new(BlocklistBuilder),
            Box::new(TakedownBuilder),
            Box::new(IdentityWorkflowBuilder),
        ];
        Self::with_builders(config, builders)
    }

    pub fn with_builders(config: RadarConfig, builders: Vec<Box<dyn PayloadBuilder>>) -> Self {
        Self {
            builders,
            client: reqwest::Client::new(),
            config,
        }
    }

    fn provider_config(&self, provider: &str) -> &crate::config::ProviderConfig {
        match provider {
            "blocklist" => &self.config.blocklist,
            "takedown" => &self.config.takedown,
            _ => &self.config.identity,
        }
    }

    /// Build the payload set for applicable providers only. Pure: no
    /// network, no store writes.
    pub fn payloads(&self, ctx: &CampaignContext) -> Vec<ProviderPayload> {
        self.builders
            .iter()
            .filter(|b| b.applicable(ctx))
            .map(|b| ProviderPayload {
                provider: b.provider().to_string(),
                endpoint: self.provider_config(b.provider()).endpoint.clone(),
                payload: b.build(ctx),
            })
            .collect()
    }

    /// Build and, unless dry-run, dispatch each payload to its provider.
    /// Providers are attempted independently; a failure is reported in the
    /// outcome set and never aborts the siblings.
    pub async fn execute(&self, ctx: &CampaignContext, dry_run: Option<bool>) -> OrchestrationReport {
        let dry_run = dry_run.unwrap_or(self.config.dry_run_default);
        let payloads = self.payloads(ctx);
        let mut results = Vec::with_capacity(payloads.len());

        for entry in &payloads {
            let outcome = if dry_run {
                DeliveryOutcome::WouldSend
            } else {
                self.deliver(entry).await
            };
            if let DeliveryOutcome::Failed { reason } = &outcome {
                let err = RadarError::OrchestrationDelivery {
                    provider: entry.provider.clone(),
                    reason: reason.clone(),
                };
                tracing::warn!(error = %err, "provider dispatch failed");
            }
            results.push(DeliveryResult {
                provider: entry.provider.clone(),
                outcome,
            });
        }

        OrchestrationReport {
            dry_run,
            results,
            payloads,
        }
    }

    async fn deliver(&self, entry: &ProviderPayload) -> DeliveryOutcome {
        let provider = self.provider_config(&entry.provider);
        let endpoint = match &provider.endpoint {
            Some(endpoint) => endpoint,
            None => return DeliveryOutcome::SkippedNoEndpoint,
        };
        let credential = match &provider.credential {
            Some(credential) => credential,
            None => return DeliveryOutcome::SkippedNoCredentials,
        };

        let request = self
            .client
            .post(endpoint)
            .bearer_auth(credential)
            .json(&entry.payload)
            .timeout(StdDuration::from_secs(provider.timeout_secs));

        match request.send().await {
            Ok(response) => DeliveryOutcome::Sent {
                status_code: response.status().as_u16(),
            },
            Err(e) => DeliveryOutcome::Failed {
                reason: e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::CampaignCorrelator;
    use crate::dedup::{BucketGranularity, UpsertEngine};
    use crate::store::MemoryStore;
    use crate::EventDraft;
    use uuid::Uuid;

    async fn seeded_context(store: &MemoryStore, config: &RadarConfig) -> CampaignContext {
        let engine = UpsertEngine::new(BucketGranularity::Day);
        engine
            .ingest(
                store,
                &EventDraft {
                    source_type: SourceType::Certstream,
                    subject: "pay-pal-secure.com".into(),
                    observed_at: Utc::now(),
                    confidence: 92,
                    raw_payload: json!({"source_ip": "203.0.113.9"}),
                },
            )
            .await
            .unwrap();
        let ato = engine
            .ingest(
                store,
                &EventDraft {
                    source_type: SourceType::Ato,
                    subject: "victim@paypal.com".into(),
                    observed_at: Utc::now(),
                    confidence: 88,
                    raw_payload: json!({}),
                },
            )
            .await
            .unwrap();
        store
            .insert_ato(AtoSignal {
                id: Uuid::new_v4().to_string(),
                threat_event_id: ato.event.id.clone(),
                account: "victim@paypal.com".into(),
                origin_location: "Berlin".into(),
                login_location: "Lagos".into(),
                risk_score: 93,
                action_taken: "monitor".into(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let dmarc = engine
            .ingest(
                store,
                &EventDraft {
                    source_type: SourceType::Dmarc,
                    subject: "paypal.com".into(),
                    observed_at: Utc::now(),
                    confidence: 60,
                    raw_payload: json!({"source_ip": "203.0.113.9"}),
                },
            )
            .await
            .unwrap();
        store
            .insert_dmarc(DmarcRecord {
                id: Uuid::new_v4().to_string(),
                threat_event_id: dmarc.event.id.clone(),
                domain: "paypal.com".into(),
                reporting_org: "google.com".into(),
                source_ip: "203.0.113.9".into(),
                disposition: "reject".into(),
                spf_result: "fail".into(),
                dkim_result: "fail".into(),
                message_count: 37,
                report_date: Utc::now().date_naive(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let correlator = CampaignCorrelator::new(config.clone());
        let campaigns = correlator.sweep(store, Utc::now()).await.unwrap();
        CampaignContext::load(store, campaigns[0].clone(), config)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_dry_run_default_no_dispatch() {
        let store = MemoryStore::new();
        let config = RadarConfig::default();
        let ctx = seeded_context(&store, &config).await;
        let orchestrator = Orchestrator::new(config);

        // No explicit flag: dry-run, every applicable provider would send.
        let report = orchestrator.execute(&ctx, None).await;
        assert!(report.dry_run);
        assert!(!report.results.is_empty());
        assert!(report
            .results
            .iter()
            .all(|r| r.outcome == DeliveryOutcome::WouldSend));

        // Same payload shapes as a live run would build.
        let live_payloads = orchestrator.payloads(&ctx);
        assert_eq!(report.payloads.len(), live_payloads.len());
        for (a, b) in report.payloads.iter().zip(&live_payloads) {
            assert_eq!(a.provider, b.provider);
            assert_eq!(a.payload, b.payload);
        }
    }

    #[tokio::test]
    async fn test_provider_failure_isolated() {
        let store = MemoryStore::new();
        let mut config = RadarConfig::default();
        // Blocklist dials an unreachable endpoint; takedown has no
        // credentials; identity is unreachable too.
        config.blocklist.endpoint = Some("http://127.0.0.1:1/block".into());
        config.blocklist.credential = Some("token".into());
        config.blocklist.timeout_secs = 2;
        config.takedown.endpoint = Some("http://127.0.0.1:1/takedown".into());
        config.identity.endpoint = Some("http://127.0.0.1:1/workflow".into());
        config.identity.credential = Some("token".into());
        config.identity.timeout_secs = 2;

        let ctx = seeded_context(&store, &config).await;
        let orchestrator = Orchestrator::new(config);
        let report = orchestrator.execute(&ctx, Some(false)).await;

        let outcome = |provider: &str| {
            report
                .results
                .iter()
                .find(|r| r.provider == provider)
                .map(|r| r.outcome.clone())
                .unwrap()
        };
        assert!(matches!(outcome("blocklist"), DeliveryOutcome::Failed { .. }));
        assert_eq!(outcome("takedown"), DeliveryOutcome::SkippedNoCredentials);
        assert!(matches!(outcome("identity"), DeliveryOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_identity_omitted_without_ato_data() {
        let store = MemoryStore::new();
        let config = RadarConfig::default();
        let engine = UpsertEngine::new(BucketGranularity::Day);
        for subject in ["okta-sso.net", "okta-login.net"] {
            engine
                .ingest(
                    &store,
                    &EventDraft {
                        source_type: SourceType::Certstream,
                        subject: subject.into(),
                        observed_at: Utc::now(),
                        confidence: 90,
                        raw_payload: json!({}),
                    },
                )
                .await
                .unwrap();
        }
        let correlator = CampaignCorrelator::new(config.clone());
        let campaigns = correlator.sweep(&store, Utc::now()).await.unwrap();
        let ctx = CampaignContext::load(&store, campaigns[0].clone(), &config)
            .await
            .unwrap();

        let orchestrator = Orchestrator::new(config);
        let payloads = orchestrator.payloads(&ctx);
        assert!(payloads.iter().any(|p| p.provider == "blocklist"));
        assert!(payloads.iter().any(|p| p.provider == "takedown"));
        assert!(!payloads.iter().any(|p| p.provider == "identity"));
    }

    #[tokio::test]
    async fn test_takedown_priority_tracks_score() {
        let store = MemoryStore::new();
        let config = RadarConfig::default();
        let ctx = seeded_context(&store, &config).await;
        // Three corroborating signal types push the score past 90.
        assert!(ctx.campaign.confidence_score >= 90);
        let payload = TakedownBuilder.build(&ctx);
        assert_eq!(payload["priority"], "critical");
        assert_eq!(payload["evidence_package"]["ato_signal_count"], 1);
    }
}
