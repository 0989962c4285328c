//! Campaign correlation
//!
//! The system's central algorithm. Sweeps a sliding window of persisted
//! multi-signal events, groups them by shared identity anchors through
//! pluggable strategies, and materializes campaign records with a derived
//! confidence score. The sweep reads a snapshot and is idempotent, so it
//! can run concurrently with ingestion; events landing mid-sweep are
//! picked up on the next pass.

use crate::error::RadarError;
use crate::store::EventStore;
use crate::{Campaign, CampaignStatus, DmarcRecord, RadarConfig, SourceType, ThreatEvent};
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};

// =============================================================================
// Anchor resolution
// =============================================================================

/// Cross-event lookups available to anchor strategies.
pub struct AnchorContext {
    /// DMARC detail rows keyed by owning threat event.
    pub dmarc_by_event: HashMap<String, Vec<DmarcRecord>>,
    /// Sending-infrastructure IPs already attributed to an anchor by a
    /// previous resolution pass. Empty on the first pass.
    pub ip_anchors: HashMap<String, String>,
}

/// One anchor-matching rule. Strategies are tried in order and combined by
/// OR: the first anchor wins. New rules extend the list without touching
/// the correlation loop.
pub trait AnchorStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn anchor(&self, event: &ThreatEvent, ctx: &AnchorContext) -> Option<String>;
}

/// Lowercase alphanumerics only; the canonical form for brand keys.
pub fn normalize_token(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Reduce a domain-ish subject to its brand key: strip scheme, userinfo,
/// port and wildcard, take the first DNS label, drop non-alphanumerics.
pub fn brand_key_from_domain(subject: &str) -> String {
    let raw = subject.to_ascii_lowercase();
    let raw = raw.rsplit('@').next().unwrap_or(&raw);
    let host = match raw.split_once("://") {
        Some((_, rest)) => rest.split('/').next().unwrap_or(rest),
        None => raw,
    };
    let host = host.split(':').next().unwrap_or(host);
    let host = host.trim_start_matches("*.").trim();
    let label = host.split('.').next().unwrap_or(host);
    let cleaned = normalize_token(label);
    if cleaned.is_empty() {
        "unknown".into()
    } else {
        cleaned
    }
}

fn levenshtein(a: &str, b: &str) -> usize {
    if a == b {
        return 0;
    }
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let b_chars: Vec<char> = b.chars().collect();
    let mut previous: Vec<usize> = (0..=b_chars.len()).collect();
    for (i, ca) in a.chars().enumerate() {
        let mut current = vec![i + 1];
        for (j, cb) in b_chars.iter().enumerate() {
            let insert = current[j] + 1;
            let delete = previous[j + 1] + 1;
            let replace = previous[j] + usize::from(ca != *cb);
            current.push(insert.min(delete).min(replace));
        }
        previous = current;
    }
    previous[b_chars.len()]
}

/// Similarity in [0, 1] derived from edit distance.
fn similarity(a: &str, b: &str) -> f64 {
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / longest as f64
}

/// Match a cleaned label against the monitored-brand list: containment,
/// single-edit lookalikes for brands of length >= 4, then the similarity
/// ratio against the configured floor.
fn match_brand(label: &str, brands: &[String], floor: f64) -> Option<String> {
    let mut best: Option<(String, f64)> = None;
    for brand in brands {
        let key = normalize_token(brand);
        if key.is_empty() {
            continue;
        }
        if label.contains(&key) {
            return Some(key);
        }
        let mut ratio = similarity(&key, label);
        if key.len() >= 4 && levenshtein(&key, label) <= 1 {
            ratio = ratio.max(0.9);
        }
        if ratio >= floor && best.as_ref().map_or(true, |(_, b)| ratio > *b) {
            best = Some((key, ratio));
        }
    }
    best.map(|(key, _)| key)
}

/// Normalized-subject matching for domain-carrying signals: anchors only
/// when the lookalike domain reduces to a monitored brand key.
pub struct BrandSubjectStrategy {
    brands: Vec<String>,
    similarity_floor: f64,
}

impl BrandSubjectStrategy {
    pub fn new(config: &RadarConfig) -> Self {
        Self {
            brands: config.monitored_brands.clone(),
            similarity_floor: config.lookalike_similarity,
        }
    }
}

impl AnchorStrategy for BrandSubjectStrategy {
    fn name(&self) -> &'static str {
        "brand-subject"
    }

    fn anchor(&self, event: &ThreatEvent, _ctx: &AnchorContext) -> Option<String> {
        if event.source_type == SourceType::Ato {
            return None;
        }
        let label = brand_key_from_domain(&event.subject);
        match_brand(&label, &self.brands, self.similarity_floor)
    }
}

/// ATO signals anchor on the targeted account's email domain.
pub struct AccountDomainStrategy {
    brands: Vec<String>,
    similarity_floor: f64,
}

impl AccountDomainStrategy {
    pub fn new(config: &RadarConfig) -> Self {
        Self {
            brands: config.monitored_brands.clone(),
            similarity_floor: config.lookalike_similarity,
        }
    }
}

impl AnchorStrategy for AccountDomainStrategy {
    fn name(&self) -> &'static str {
        "account-domain"
    }

    fn anchor(&self, event: &ThreatEvent, _ctx: &AnchorContext) -> Option<String> {
        if event.source_type != SourceType::Ato {
            return None;
        }
        let domain = event.subject.rsplit('@').next().unwrap_or(&event.subject);
        let label = brand_key_from_domain(domain);
        match_brand(&label, &self.brands, self.similarity_floor)
    }
}

/// DMARC reports whose sending IP was already attributed to an anchor by
/// other members join that group even when the reported domain does not
/// reduce to a monitored brand.
pub struct InfraFingerprintStrategy;

impl AnchorStrategy for InfraFingerprintStrategy {
    fn name(&self) -> &'static str {
        "infra-fingerprint"
    }

    fn anchor(&self, event: &ThreatEvent, ctx: &AnchorContext) -> Option<String> {
        let records = ctx.dmarc_by_event.get(&event.id)?;
        records
            .iter()
            .find_map(|r| ctx.ip_anchors.get(&r.source_ip))
            .cloned()
    }
}

// =============================================================================
// Correlator
// =============================================================================

pub struct CampaignCorrelator {
    strategies: Vec<Box<dyn AnchorStrategy>>,
    config: RadarConfig,
}

impl CampaignCorrelator {
    /// Default strategy stack: subject brand key, account domain, then the
    /// infrastructure fingerprint join.
    pub fn new(config: RadarConfig) -> Self {
        let strategies: Vec<Box<dyn AnchorStrategy>> = vec![
            Box::new(BrandSubjectStrategy::new(&config)),
            Box::new(AccountDomainStrategy::new(&config)),
            Box::new(InfraFingerprintStrategy),
        ];
        Self { strategies, config }
    }

    pub fn with_strategies(config: RadarConfig, strategies: Vec<Box<dyn AnchorStrategy>>) -> Self {
        Self { strategies, config }
    }

    fn resolve(&self, event: &ThreatEvent, ctx: &AnchorContext) -> Option<String> {
        self.strategies.iter().find_map(|s| s.anchor(event, ctx))
    }

    /// Weighted sum over distinct signal types with a multiplicative bonus
    /// for cross-signal corroboration, capped at 100.
    fn score(&self, signal_types: &BTreeSet<SourceType>) -> u8 {
        let sum: u32 = signal_types
            .iter()
            .map(|s| self.config.signal_weights.weight(*s))
            .sum();
        let mut score = sum as f64;
        if signal_types.len() >= 2 {
            score *= self.config.corroboration_bonus;
        }
        score.min(100.0).round() as u8
    }

    fn triggers(&self, signal_types: &BTreeSet<SourceType>, dmarc_failures: bool) -> Vec<String> {
        let mut triggers = Vec::new();
        if signal_types.contains(&SourceType::Certstream) || signal_types.contains(&SourceType::Feed)
        {
            triggers.push("Lookalike domain activity".to_string());
        }
        if dmarc_failures {
            triggers.push("DMARC authentication failures".to_string());
        }
        if signal_types.contains(&SourceType::Ato) {
            triggers.push("ATO anomaly telemetry".to_string());
        }
        triggers
    }

    fn campaign_id(anchor: &str, indicator_hint: &str) -> String {
        let digest = Sha256::digest(format!("{anchor}:{indicator_hint}").as_bytes());
        format!("CMP-{}", hex::encode(&digest[..4]).to_uppercase())
    }

    fn brand_label(&self, anchor: &str) -> String {
        for brand in &self.config.monitored_brands {
            if normalize_token(brand) == anchor {
                let mut label = brand.replace('-', " ");
                if let Some(first) = label.get_mut(0..1) {
                    first.make_ascii_uppercase();
                }
                return label;
            }
        }
        anchor.to_string()
    }

    /// Run one correlation pass over the sliding window ending at `now`.
    /// Returns the campaigns created or updated by this pass.
    pub async fn sweep(
        &self,
        store: &dyn EventStore,
        now: DateTime<Utc>,
    ) -> Result<Vec<Campaign>, RadarError> {
        let window = Duration::hours(self.config.correlation_window_hours.max(1));
        let since = now - window;

        let events = store.events_since(since).await?;
        let dmarc_rows = store.dmarc_since(since).await?;

        let mut dmarc_by_event: HashMap<String, Vec<DmarcRecord>> = HashMap::new();
        for row in dmarc_rows {
            dmarc_by_event.entry(row.threat_event_id.clone()).or_default().push(row);
        }

        // First pass: subject/account anchors.
        let mut ctx = AnchorContext {
            dmarc_by_event,
            ip_anchors: HashMap::new(),
        };
        let mut groups: HashMap<String, Vec<&ThreatEvent>> = HashMap::new();
        let mut unanchored: Vec<&ThreatEvent> = Vec::new();
        for event in &events {
            match self.resolve(event, &ctx) {
                Some(anchor) => groups.entry(anchor).or_default().push(event),
                None => unanchored.push(event),
            }
        }

        // Attribute sending infrastructure seen by each group, then give
        // leftover events a second chance through the fingerprint join.
        for (anchor, members) in &groups {
            for event in members {
                if let Some(ip) = event.raw_payload.get("source_ip").and_then(|v| v.as_str()) {
                    ctx.ip_anchors.insert(ip.to_string(), anchor.clone());
                }
                if let Some(rows) = ctx.dmarc_by_event.get(&event.id) {
                    let ips: Vec<String> = rows.iter().map(|r| r.source_ip.clone()).collect();
                    for ip in ips {
                        ctx.ip_anchors.insert(ip, anchor.clone());
                    }
                }
            }
        }
        let mut late: Vec<(String, &ThreatEvent)> = Vec::new();
        for event in unanchored {
            // Still nothing after the fingerprint join: the event anchors
            // on its own cleaned label, so repeated sightings of an
            // unrecognized lookalike can cluster on their own.
            let anchor = self
                .resolve(event, &ctx)
                .unwrap_or_else(|| brand_key_from_domain(&event.subject));
            late.push((anchor, event));
        }
        for (anchor, event) in late {
            groups.entry(anchor).or_default().push(event);
        }

        let existing = store.all_campaigns().await?;
        let mut by_anchor: HashMap<String, Campaign> = existing
            .iter()
            .filter(|c| c.status != CampaignStatus::Resolved)
            .map(|c| (c.anchor.clone(), c.clone()))
            .collect();

        for (anchor, members) in groups {
            let high_weight = members
                .iter()
                .any(|e| self.config.high_weight_sources.contains(&e.source_type));
            let known = by_anchor.contains_key(&anchor);
            if members.len() < 2 && !high_weight && !known {
                continue;
            }

            let signal_types: BTreeSet<SourceType> =
                members.iter().map(|e| e.source_type).collect();
            let dmarc_failures = members.iter().any(|e| {
                ctx.dmarc_by_event
                    .get(&e.id)
                    .map(|rows| rows.iter().any(DmarcRecord::is_failure))
                    .unwrap_or(false)
            });
            let window_start = members.iter().map(|e| e.first_seen).min().unwrap_or(now);
            let window_end = members.iter().map(|e| e.last_seen).max().unwrap_or(now);
            let indicator_hint = members
                .iter()
                .filter(|e| e.source_type != SourceType::Ato)
                .map(|e| e.subject.as_str())
                .next()
                .unwrap_or(anchor.as_str());

            let mut campaign = by_anchor.remove(&anchor).unwrap_or_else(|| Campaign {
                id: Self::campaign_id(&anchor, indicator_hint),
                anchor: anchor.clone(),
                brand: self.brand_label(&anchor),
                member_event_ids: BTreeSet::new(),
                signal_types_present: BTreeSet::new(),
                confidence_score: 0,
                window_start,
                window_end,
                status: CampaignStatus::Active,
                created_at: now,
                triggers: Vec::new(),
            });

            let before = campaign.member_event_ids.len();
            for event in &members {
                campaign.member_event_ids.insert(event.id.clone());
            }
            let gained_member = campaign.member_event_ids.len() > before;

            campaign.signal_types_present.extend(signal_types.iter().copied());
            campaign.confidence_score = self.score(&campaign.signal_types_present);
            campaign.window_start = campaign.window_start.min(window_start);
            campaign.triggers = self.triggers(&campaign.signal_types_present, dmarc_failures);

            // A stale campaign returns to active only through new members.
            if gained_member {
                campaign.window_end = campaign.window_end.max(window_end);
                if campaign.status == CampaignStatus::Stale {
                    tracing::info!(campaign = %campaign.id, "stale campaign reactivated");
                    campaign.status = CampaignStatus::Active;
                }
            }

            by_anchor.insert(anchor, campaign);
        }

        // Merge tie-break: candidates sharing members collapse into the
        // earlier-created campaign; the other is resolved.
        let mut merged: Vec<Campaign> = Vec::new();
        let mut resolved_ids: BTreeSet<String> = BTreeSet::new();
        let mut candidates: Vec<Campaign> = by_anchor.into_values().collect();
        candidates.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        for campaign in candidates {
            if let Some(winner) = merged
                .iter_mut()
                .find(|kept| !kept.member_event_ids.is_disjoint(&campaign.member_event_ids))
            {
                let err = RadarError::CorrelationInconsistency(format!(
                    "campaigns {} and {} share members; merging into {}",
                    winner.id, campaign.id, winner.id
                ));
                tracing::warn!(error = %err, "campaign merge tie-break");
                winner.member_event_ids.extend(campaign.member_event_ids.iter().cloned());
                winner
                    .signal_types_present
                    .extend(campaign.signal_types_present.iter().copied());
                winner.confidence_score = self.score(&winner.signal_types_present);
                winner.window_start = winner.window_start.min(campaign.window_start);
                winner.window_end = winner.window_end.max(campaign.window_end);

                let mut loser = campaign;
                loser.status = CampaignStatus::Resolved;
                resolved_ids.insert(loser.id.clone());
                store.upsert_campaign(loser).await?;
            } else {
                merged.push(campaign);
            }
        }

        // Window expiry: untouched campaigns decay and go stale.
        let mut out: Vec<Campaign> = Vec::new();
        for mut campaign in merged {
            if campaign.status == CampaignStatus::Active && campaign.window_end < since {
                campaign.status = CampaignStatus::Stale;
                campaign.confidence_score =
                    (campaign.confidence_score as f64 * self.config.stale_decay).round() as u8;
                tracing::debug!(campaign = %campaign.id, "campaign went stale");
            }
            store.upsert_campaign(campaign.clone()).await?;
            out.push(campaign);
        }

        out.retain(|c| !resolved_ids.contains(&c.id));
        out.sort_by(|a, b| {
            b.confidence_score
                .cmp(&a.confidence_score)
                .then(b.window_end.cmp(&a.window_end))
        });
        Ok(out)
    }
}
