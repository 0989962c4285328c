//! Route handlers

use crate::{ApiError, ApiResponse, AppState};
use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{Duration, Utc};
use radar_core::orchestrate::{CampaignContext, OrchestrationReport, ProviderPayload};
use radar_core::pipeline::PipelineMetrics;
use radar_core::store::StoreCounts;
use radar_core::{Campaign, CampaignStatus, DmarcRecord};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: String,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

#[derive(Debug, Serialize)]
pub struct DashboardResponse {
    pub counts: StoreCounts,
    pub pipeline: PipelineMetrics,
    pub alerts_last_24h: usize,
    pub dmarc_failures_last_24h: u64,
    /// Most-sighted subjects over the last 24 hours.
    pub top_targets: Vec<TargetSummary>,
    pub active_campaigns: Vec<CampaignSummary>,
}

#[derive(Debug, Serialize)]
pub struct TargetSummary {
    pub subject: String,
    pub source_type: String,
    pub occurrences: u64,
    pub confidence: u8,
}

/// Compact campaign view for listings; the member set is reduced to a
/// count to keep list payloads small.
#[derive(Debug, Serialize)]
pub struct CampaignSummary {
    pub id: String,
    pub anchor: String,
    pub brand: String,
    pub status: CampaignStatus,
    pub confidence_score: u8,
    pub member_count: usize,
    pub signal_types: Vec<String>,
    pub window_start: chrono::DateTime<Utc>,
    pub window_end: chrono::DateTime<Utc>,
    pub triggers: Vec<String>,
}

impl From<&Campaign> for CampaignSummary {
    fn from(c: &Campaign) -> Self {
        Self {
            id: c.id.clone(),
            anchor: c.anchor.clone(),
            brand: c.brand.clone(),
            status: c.status,
            confidence_score: c.confidence_score,
            member_count: c.member_event_ids.len(),
            signal_types: c
                .signal_types_present
                .iter()
                .map(|s| s.as_str().to_string())
                .collect(),
            window_start: c.window_start,
            window_end: c.window_end,
            triggers: c.triggers.clone(),
        }
    }
}

pub async fn dashboard(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ApiResponse<DashboardResponse>>, ApiError> {
    let since = Utc::now() - Duration::hours(24);
    let counts = state.store.counts().await?;
    let alerts = state.store.alerts_since(since).await?;
    let dmarc_failures: u64 = state
        .store
        .dmarc_since(since)
        .await?
        .iter()
        .filter(|r| r.is_failure())
        .map(|r| r.message_count)
        .sum();

    let mut events = state.store.events_since(since).await?;
    events.sort_by(|a, b| b.occurrence_count.cmp(&a.occurrence_count));
    let top_targets: Vec<TargetSummary> = events
        .iter()
        .take(5)
        .map(|e| TargetSummary {
            subject: e.subject.clone(),
            source_type: e.source_type.as_str().to_string(),
            occurrences: e.occurrence_count,
            confidence: e.confidence,
        })
        .collect();

    let mut campaigns: Vec<Campaign> = state
        .store
        .all_campaigns()
        .await?
        .into_iter()
        .filter(|c| c.status == CampaignStatus::Active)
        .collect();
    campaigns.sort_by(|a, b| b.confidence_score.cmp(&a.confidence_score));
    campaigns.truncate(5);

    Ok(Json(ApiResponse::success(DashboardResponse {
        counts,
        pipeline: state.pipeline.metrics(),
        alerts_last_24h: alerts.len(),
        dmarc_failures_last_24h: dmarc_failures,
        top_targets,
        active_campaigns: campaigns.iter().map(CampaignSummary::from).collect(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    /// Only campaigns whose window overlaps the last N hours.
    pub hours: Option<i64>,
    pub limit: Option<usize>,
}

pub async fn list_campaigns(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<ApiResponse<Vec<CampaignSummary>>>, ApiError> {
    let hours = params.hours.unwrap_or(state.config.correlation_window_hours).max(1);
    let since = Utc::now() - Duration::hours(hours);

    let mut campaigns: Vec<Campaign> = state
        .store
        .all_campaigns()
        .await?
        .into_iter()
        .filter(|c| c.status != CampaignStatus::Resolved && c.window_end >= since)
        .collect();
    campaigns.sort_by(|a, b| {
        b.confidence_score
            .cmp(&a.confidence_score)
            .then(a.id.cmp(&b.id))
    });
    campaigns.truncate(params.limit.unwrap_or(50));

    Ok(Json(ApiResponse::success(
        campaigns.iter().map(CampaignSummary::from).collect(),
    )))
}

async fn campaign_or_404(state: &AppState, id: &str) -> Result<Campaign, ApiError> {
    state
        .store
        .campaign(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no campaign {id}")))
}

pub async fn get_campaign(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Campaign>>, ApiError> {
    let campaign = campaign_or_404(&state, &id).await?;
    Ok(Json(ApiResponse::success(campaign)))
}

pub async fn orchestrator_payloads(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Vec<ProviderPayload>>>, ApiError> {
    let campaign = campaign_or_404(&state, &id).await?;
    let ctx = CampaignContext::load(state.store.as_ref(), campaign, &state.config).await?;
    Ok(Json(ApiResponse::success(state.orchestrator.payloads(&ctx))))
}

#[derive(Debug, Deserialize)]
pub struct OrchestrateParams {
    /// Overrides the configured dry-run default when present.
    pub dry_run: Option<bool>,
}

pub async fn orchestrate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<OrchestrateParams>,
) -> Result<Json<ApiResponse<OrchestrationReport>>, ApiError> {
    let campaign = campaign_or_404(&state, &id).await?;
    let ctx = CampaignContext::load(state.store.as_ref(), campaign, &state.config).await?;
    let report = state.orchestrator.execute(&ctx, params.dry_run).await;
    tracing::info!(campaign = %id, dry_run = report.dry_run, "orchestration requested");
    Ok(Json(ApiResponse::success(report)))
}

pub async fn dmarc_evidence(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Vec<DmarcRecord>>>, ApiError> {
    let campaign = campaign_or_404(&state, &id).await?;
    let ctx = CampaignContext::load(state.store.as_ref(), campaign, &state.config).await?;
    let mut rows = ctx.dmarc_records;
    rows.truncate(50);
    Ok(Json(ApiResponse::success(rows)))
}
