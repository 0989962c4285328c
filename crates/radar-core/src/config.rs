//! Engine configuration
//!
//! One explicit struct handed to the policies and the correlator at call
//! time; there is no process-wide mutable settings singleton. Defaults
//! match the documented environment surface and can be overridden per
//! variable via [`RadarConfig::from_env`].

use crate::dedup::BucketGranularity;
use crate::SourceType;
use chrono::Duration;
use std::collections::BTreeSet;
use std::env;

/// Per-signal-type scoring weights for campaign correlation.
#[derive(Debug, Clone, Copy)]
pub struct SignalWeights {
    pub feed: u32,
    pub certstream: u32,
    pub dmarc: u32,
    pub ato: u32,
}

impl SignalWeights {
    pub fn weight(&self, source: SourceType) -> u32 {
        match source {
            SourceType::Feed => self.feed,
            SourceType::Certstream => self.certstream,
            SourceType::Dmarc => self.dmarc,
            SourceType::Ato => self.ato,
        }
    }
}

impl Default for SignalWeights {
    fn default() -> Self {
        // Chosen so any three distinct signal types strictly outscore any
        // two-signal subset even after the 100 cap.
        Self {
            feed: 20,
            certstream: 30,
            dmarc: 25,
            ato: 35,
        }
    }
}

/// Downstream provider endpoint plus credential.
#[derive(Debug, Clone, Default)]
pub struct ProviderConfig {
    pub endpoint: Option<String>,
    pub credential: Option<String>,
    pub timeout_secs: u64,
}

impl ProviderConfig {
    fn from_env(endpoint_var: &str, credential_var: &str) -> Self {
        Self {
            endpoint: env::var(endpoint_var).ok().filter(|v| !v.is_empty()),
            credential: env::var(credential_var).ok().filter(|v| !v.is_empty()),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RadarConfig {
    /// Queue key the consumers block on.
    pub queue_name: String,
    /// Storage connection string (the store seam decides how to use it).
    pub storage_url: String,
    /// HTTP bind address for the read API.
    pub bind_addr: String,
    /// Public base URL used when rendering evidence links.
    pub public_api_base_url: String,

    /// Minimum confidence for alert escalation.
    pub alert_threshold: u8,
    /// An open alert inside this window suppresses re-arming.
    pub alert_cooldown: Duration,

    /// Sliding correlation window.
    pub correlation_window_hours: i64,
    /// Periodic sweep cadence for the server loop.
    pub sweep_interval_secs: u64,
    pub signal_weights: SignalWeights,
    /// Multiplier applied when >= 2 distinct signal types corroborate.
    pub corroboration_bonus: f64,
    /// One-shot score decay applied at the active -> stale transition.
    pub stale_decay: f64,
    /// Signal types that can seed a campaign with a single event.
    pub high_weight_sources: BTreeSet<SourceType>,

    /// Natural-key time bucket for deduplication.
    pub dedup_bucket: BucketGranularity,
    /// Bounded retries for transient persistence failures.
    pub max_ingest_retries: u32,
    /// Base backoff between ingest retries, doubled per attempt.
    pub retry_backoff_ms: u64,

    /// Brands the lookalike anchor matching is tuned for.
    pub monitored_brands: Vec<String>,
    /// Similarity ratio above which a label counts as a lookalike.
    pub lookalike_similarity: f64,

    /// Orchestration defaults to producing payloads without dispatching.
    pub dry_run_default: bool,
    pub blocklist: ProviderConfig,
    pub takedown: ProviderConfig,
    pub identity: ProviderConfig,
}

impl Default for RadarConfig {
    fn default() -> Self {
        Self {
            queue_name: "radar:raw_events".into(),
            storage_url: "memory://".into(),
            bind_addr: "127.0.0.1:8080".into(),
            public_api_base_url: "http://localhost:8080".into(),
            alert_threshold: 80,
            alert_cooldown: Duration::hours(24),
            correlation_window_hours: 48,
            sweep_interval_secs: 30,
            signal_weights: SignalWeights::default(),
            corroboration_bonus: 1.15,
            stale_decay: 0.75,
            high_weight_sources: BTreeSet::from([SourceType::Ato]),
            dedup_bucket: BucketGranularity::Day,
            max_ingest_retries: 4,
            retry_backoff_ms: 100,
            monitored_brands: [
                "microsoft",
                "google",
                "okta",
                "adobe",
                "amazon",
                "paypal",
                "bankofamerica",
                "docu-sign",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            lookalike_similarity: 0.75,
            dry_run_default: true,
            blocklist: ProviderConfig {
                timeout_secs: 10,
                ..Default::default()
            },
            takedown: ProviderConfig {
                timeout_secs: 10,
                ..Default::default()
            },
            identity: ProviderConfig {
                timeout_secs: 10,
                ..Default::default()
            },
        }
    }
}

impl RadarConfig {
    /// Build from the environment-style surface, falling back to defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = env::var("RADAR_QUEUE_NAME") {
            cfg.queue_name = v;
        }
        if let Ok(v) = env::var("RADAR_STORAGE_URL") {
            cfg.storage_url = v;
        }
        if let Ok(v) = env::var("RADAR_BIND_ADDR") {
            cfg.bind_addr = v;
        }
        if let Ok(v) = env::var("RADAR_PUBLIC_API_BASE_URL") {
            cfg.public_api_base_url = v;
        }
        if let Some(v) = parse_env("ALERT_THRESHOLD") {
            cfg.alert_threshold = v;
        }
        if let Some(v) = parse_env::<i64>("ALERT_COOLDOWN_HOURS") {
            cfg.alert_cooldown = Duration::hours(v);
        }
        if let Some(v) = parse_env("CORRELATION_WINDOW_HOURS") {
            cfg.correlation_window_hours = v;
        }
        if let Some(v) = parse_env("SWEEP_INTERVAL_SECS") {
            cfg.sweep_interval_secs = v;
        }
        if let Some(v) = parse_env("SIGNAL_WEIGHT_FEED") {
            cfg.signal_weights.feed = v;
        }
        if let Some(v) = parse_env("SIGNAL_WEIGHT_CERTSTREAM") {
            cfg.signal_weights.certstream = v;
        }
        if let Some(v) = parse_env("SIGNAL_WEIGHT_DMARC") {
            cfg.signal_weights.dmarc = v;
        }
        if let Some(v) = parse_env("SIGNAL_WEIGHT_ATO") {
            cfg.signal_weights.ato = v;
        }
        if let Ok(v) = env::var("MONITORED_BRANDS") {
            cfg.monitored_brands = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = parse_env("LOOKALIKE_SIMILARITY") {
            cfg.lookalike_similarity = v;
        }
        if let Ok(v) = env::var("DEDUP_BUCKET") {
            if let Some(b) = BucketGranularity::parse(&v) {
                cfg.dedup_bucket = b;
            }
        }
        if let Ok(v) = env::var("ORCHESTRATOR_DRY_RUN") {
            cfg.dry_run_default = v != "false" && v != "0";
        }

        cfg.blocklist = ProviderConfig::from_env("BLOCKLIST_ENDPOINT", "BLOCKLIST_API_TOKEN");
        cfg.takedown = ProviderConfig::from_env("TAKEDOWN_ENDPOINT", "TAKEDOWN_API_KEY");
        cfg.identity = ProviderConfig::from_env("IDENTITY_WORKFLOW_URL", "IDENTITY_OAUTH_TOKEN");
        if let Some(v) = parse_env("ORCHESTRATOR_TIMEOUT_SECS") {
            cfg.blocklist.timeout_secs = v;
            cfg.takedown.timeout_secs = v;
            cfg.identity.timeout_secs = v;
        }

        cfg
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_weights_reward_corroboration() {
        let cfg = RadarConfig::default();
        let w = cfg.signal_weights;
        // Any pair of weights stays under the cap after the bonus, so a
        // third signal type always moves the score.
        let pairs = [
            w.feed + w.certstream,
            w.feed + w.dmarc,
            w.feed + w.ato,
            w.certstream + w.dmarc,
            w.certstream + w.ato,
            w.dmarc + w.ato,
        ];
        for sum in pairs {
            assert!((sum as f64 * cfg.corroboration_bonus) < 100.0);
        }
    }

    #[test]
    fn test_provider_defaults_have_no_credentials() {
        let cfg = RadarConfig::default();
        assert!(cfg.blocklist.credential.is_none());
        assert!(cfg.takedown.endpoint.is_none());
        assert!(cfg.dry_run_default);
    }
}
