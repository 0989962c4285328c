//! End-to-end flow: queue -> pipeline -> correlator -> orchestrator.

use chrono::Utc;
use radar_core::correlation::CampaignCorrelator;
use radar_core::orchestrate::{CampaignContext, DeliveryOutcome, Orchestrator};
use radar_core::pipeline::IngestPipeline;
use radar_core::queue::{EventQueue, MemoryQueue};
use radar_core::store::{EventStore, MemoryStore};
use radar_core::{CampaignStatus, RadarConfig, SourceType};
use serde_json::json;
use std::sync::Arc;

fn config() -> RadarConfig {
    let mut cfg = RadarConfig::default();
    cfg.retry_backoff_ms = 1;
    cfg
}

async fn push(queue: &MemoryQueue, value: serde_json::Value) {
    queue.push(value.to_string()).await;
}

/// A burst of cross-signal telemetry around one brand, plus a duplicate
/// and one junk message, flows into a single scored campaign whose
/// orchestration payloads reference the ingested evidence.
#[tokio::test]
async fn test_full_flow_one_brand_one_campaign() {
    let queue = Arc::new(MemoryQueue::new());
    let store = Arc::new(MemoryStore::new());
    let cfg = config();
    let pipeline = IngestPipeline::new(queue.clone(), store.clone(), cfg.clone());
    let now = Utc::now();
    let at = now.to_rfc3339();

    // Lookalike cert, twice: dedups into one event with two sightings.
    for _ in 0..2 {
        push(
            &queue,
            json!({
                "source_type": "certstream",
                "subject": "paypa1.com",
                "observed_at": at,
                "confidence": 92,
                "payload": {"issuer": "Let's Encrypt"}
            }),
        )
        .await;
    }
    // Feed hit on a sibling lookalike.
    push(
        &queue,
        json!({
            "source_type": "feed",
            "subject": "secure-paypal.top",
            "observed_at": at,
            "confidence": 75,
            "payload": {"category": "Phishing URL"}
        }),
    )
    .await;
    // DMARC failure against the real brand domain.
    push(
        &queue,
        json!({
            "source_type": "dmarc",
            "subject": "paypal.com",
            "observed_at": at,
            "payload": {
                "reporting_org": "google.com",
                "source_ip": "203.0.113.9",
                "disposition": "reject",
                "spf_result": "fail",
                "dkim_result": "fail",
                "msg_count": 120,
                "report_date": now.format("%Y-%m-%d").to_string()
            }
        }),
    )
    .await;
    // ATO on a brand account.
    push(
        &queue,
        json!({
            "source_type": "ato",
            "subject": "jane.doe@paypal.com",
            "observed_at": at,
            "payload": {
                "risk_score": 93,
                "origin_location": "Berlin, DE",
                "login_location": "Lagos, NG",
                "action_taken": "force_reset"
            }
        }),
    )
    .await;
    // Junk: dead-letters without disturbing the rest.
    push(&queue, json!({"source_type": "feed", "confidence": 80})).await;

    pipeline.run_until_idle().await;

    let metrics = pipeline.metrics();
    assert_eq!(metrics.processed, 5);
    assert_eq!(metrics.dead_lettered, 1);
    // Both 92-confidence cert sightings and the 93 ATO cross the threshold;
    // the cooldown holds each event to one alert.
    let alerts = store
        .alerts_since(now - chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(alerts.len(), 2);
    assert!(pipeline.take_sweep_request());

    let events = store
        .events_since(now - chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(events.len(), 4);
    let cert = events
        .iter()
        .find(|e| e.source_type == SourceType::Certstream)
        .unwrap();
    assert_eq!(cert.occurrence_count, 2);

    let correlator = CampaignCorrelator::new(cfg.clone());
    let campaigns = correlator.sweep(store.as_ref(), Utc::now()).await.unwrap();
    assert_eq!(campaigns.len(), 1);

    let campaign = &campaigns[0];
    assert_eq!(campaign.anchor, "paypal");
    assert_eq!(campaign.status, CampaignStatus::Active);
    assert_eq!(campaign.member_event_ids.len(), 4);
    assert_eq!(campaign.signal_types_present.len(), 4);
    // All four signal families: the cap applies.
    assert_eq!(campaign.confidence_score, 100);
    assert!(campaign.id.starts_with("CMP-"));
    assert_eq!(campaign.triggers.len(), 3);

    let ctx = CampaignContext::load(store.as_ref(), campaign.clone(), &cfg)
        .await
        .unwrap();
    assert!(ctx.ioc_domains.contains(&"paypa1.com".to_string()));
    assert!(ctx.ioc_ips.contains(&"203.0.113.9".to_string()));
    assert_eq!(ctx.affected_accounts, vec!["jane.doe@paypal.com".to_string()]);

    // Dry-run by default: three applicable providers, nothing dispatched.
    let orchestrator = Orchestrator::new(cfg);
    let report = orchestrator.execute(&ctx, None).await;
    assert!(report.dry_run);
    assert_eq!(report.results.len(), 3);
    for result in &report.results {
        assert!(matches!(result.outcome, DeliveryOutcome::WouldSend));
    }
}

/// Unrelated brands never share a campaign, and re-running the sweep is
/// idempotent in campaign identity and score.
#[tokio::test]
async fn test_distinct_brands_distinct_campaigns() {
    let queue = Arc::new(MemoryQueue::new());
    let store = Arc::new(MemoryStore::new());
    let cfg = config();
    let pipeline = IngestPipeline::new(queue.clone(), store.clone(), cfg.clone());
    let at = Utc::now().to_rfc3339();

    for (brand, tld) in [("okta", "xyz"), ("adobe", "click")] {
        push(
            &queue,
            json!({
                "source_type": "certstream",
                "subject": format!("verify-{brand}.{tld}"),
                "observed_at": at,
                "confidence": 85,
                "payload": {}
            }),
        )
        .await;
        push(
            &queue,
            json!({
                "source_type": "feed",
                "subject": format!("{brand}-support.net"),
                "observed_at": at,
                "confidence": 60,
                "payload": {}
            }),
        )
        .await;
    }
    pipeline.run_until_idle().await;

    let correlator = CampaignCorrelator::new(cfg);
    let first = correlator.sweep(store.as_ref(), Utc::now()).await.unwrap();
    assert_eq!(first.len(), 2);
    let anchors: Vec<&str> = first.iter().map(|c| c.anchor.as_str()).collect();
    assert!(anchors.contains(&"okta"));
    assert!(anchors.contains(&"adobe"));

    let second = correlator.sweep(store.as_ref(), Utc::now()).await.unwrap();
    assert_eq!(second.len(), 2);
    for campaign in &second {
        let before = first.iter().find(|c| c.anchor == campaign.anchor).unwrap();
        assert_eq!(campaign.id, before.id);
        assert_eq!(campaign.confidence_score, before.confidence_score);
        assert_eq!(campaign.member_event_ids, before.member_event_ids);
    }
}
