//! Synthetic telemetry producer
//!
//! Emits realistic-looking queue messages for all four signal families,
//! biased toward the monitored brands so the correlator has something to
//! anchor on. Used by the demo server and the end-to-end tests; never part
//! of the ingestion path itself.

use crate::queue::EventQueue;
use crate::{RadarConfig, SourceType};
use chrono::Utc;
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::json;
use std::time::Duration;

const TLDS: &[&str] = &["com", "net", "top", "xyz", "click", "info", "shop"];
const MUTATIONS: &[&str] = &["login-", "secure-", "account-", "verify-", "", "my-"];
const LOCATIONS: &[&str] = &[
    "Berlin, DE",
    "Lagos, NG",
    "Austin, US",
    "Warsaw, PL",
    "Manila, PH",
    "Kyiv, UA",
];
const REPORTERS: &[&str] = &["google.com", "outlook.com", "yahoo.com", "comcast.net"];

pub struct FeedSimulator {
    brands: Vec<String>,
}

impl FeedSimulator {
    pub fn new(config: &RadarConfig) -> Self {
        Self {
            brands: config.monitored_brands.clone(),
        }
    }

    fn brand(&self, rng: &mut impl Rng) -> String {
        self.brands
            .choose(rng)
            .cloned()
            .unwrap_or_else(|| "paypal".into())
    }

    /// A typosquat of one monitored brand, e.g. `login-paypa1.click`.
    fn lookalike_domain(&self, rng: &mut impl Rng) -> String {
        let mut brand = self.brand(rng);
        // One character swap, the classic homoglyph trick.
        if rng.gen_bool(0.5) {
            brand = brand.replace('l', "1").replace('o', "0");
        }
        format!(
            "{}{}.{}",
            MUTATIONS.choose(rng).copied().unwrap_or(""),
            brand,
            TLDS.choose(rng).copied().unwrap_or("com"),
        )
    }

    /// One serialized queue message of the given family.
    pub fn message(&self, source: SourceType, rng: &mut impl Rng) -> String {
        let now = Utc::now().to_rfc3339();
        match source {
            SourceType::Feed => json!({
                "source_type": "feed",
                "subject": self.lookalike_domain(rng),
                "observed_at": now,
                "confidence": rng.gen_range(40..=95),
                "payload": {
                    "category": "Phishing URL",
                    "reporter": "urlwatch-sim",
                }
            }),
            SourceType::Certstream => json!({
                "source_type": "certstream",
                "subject": self.lookalike_domain(rng),
                "observed_at": now,
                "confidence": rng.gen_range(70..=98),
                "payload": {
                    "issuer": "Let's Encrypt",
                    "san_count": rng.gen_range(1..=4),
                }
            }),
            SourceType::Ato => {
                let brand = self.brand(rng);
                let risk = rng.gen_range(55..=99);
                json!({
                    "source_type": "ato",
                    "subject": format!("user{}@{}.com", rng.gen_range(100..999), brand),
                    "observed_at": now,
                    "payload": {
                        "risk_score": risk,
                        "origin_location": LOCATIONS.choose(rng).copied().unwrap_or("Unknown"),
                        "login_location": LOCATIONS.choose(rng).copied().unwrap_or("Unknown"),
                        "action_taken": if risk >= 90 { "force_reset" } else { "monitor" },
                    }
                })
            }
            SourceType::Dmarc => {
                let brand = self.brand(rng);
                json!({
                    "source_type": "dmarc",
                    "subject": format!("{brand}.com"),
                    "observed_at": now,
                    "payload": {
                        "reporting_org": REPORTERS.choose(rng).copied().unwrap_or("unknown"),
                        "source_ip": format!(
                            "{}.{}.{}.{}",
                            rng.gen_range(1..=223),
                            rng.gen_range(0..=255),
                            rng.gen_range(0..=255),
                            rng.gen_range(1..=254),
                        ),
                        "disposition": (["none", "quarantine", "reject"]
                            .choose(rng)
                            .copied()
                            .unwrap_or("none")),
                        "spf_result": (["pass", "fail"].choose(rng).copied().unwrap_or("fail")),
                        "dkim_result": (["pass", "fail"].choose(rng).copied().unwrap_or("fail")),
                        "msg_count": rng.gen_range(1..=500),
                        "report_date": Utc::now().format("%Y-%m-%d").to_string(),
                    }
                })
            }
        }
        .to_string()
    }

    /// Push `n` messages with a weighted source mix: mostly feed and
    /// certstream, occasional ATO and DMARC, mirroring real volumes.
    pub async fn produce(&self, queue: &dyn EventQueue, n: usize) {
        for _ in 0..n {
            // ThreadRng is not Send; keep it scoped so the future stays
            // spawnable across the push await.
            let body = {
                let mut rng = rand::thread_rng();
                let source = match rng.gen_range(0..10) {
                    0..=3 => SourceType::Feed,
                    4..=6 => SourceType::Certstream,
                    7..=8 => SourceType::Dmarc,
                    _ => SourceType::Ato,
                };
                self.message(source, &mut rng)
            };
            queue.push(body).await;
        }
    }

    /// Producer loop for the demo server.
    pub async fn run(&self, queue: &dyn EventQueue, batch: usize, interval: Duration) {
        loop {
            self.produce(queue, batch).await;
            tracing::debug!(batch, "produced synthetic telemetry");
            tokio::time::sleep(interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::Normalizer;
    use crate::queue::MemoryQueue;

    #[test]
    fn test_messages_normalize_cleanly() {
        let sim = FeedSimulator::new(&RadarConfig::default());
        let normalizer = Normalizer::new();
        let mut rng = rand::thread_rng();
        for source in [
            SourceType::Feed,
            SourceType::Certstream,
            SourceType::Ato,
            SourceType::Dmarc,
        ] {
            for _ in 0..20 {
                let body = sim.message(source, &mut rng);
                let event = normalizer.normalize(&body).unwrap();
                assert_eq!(event.draft.source_type, source);
                assert!(!event.draft.subject.is_empty());
            }
        }
    }

    #[tokio::test]
    async fn test_produce_fills_queue() {
        let sim = FeedSimulator::new(&RadarConfig::default());
        let queue = MemoryQueue::new();
        sim.produce(&queue, 25).await;
        assert_eq!(queue.len().await, 25);
    }

    // The server spawns the producer onto the runtime, so its future must
    // be Send.
    #[tokio::test]
    async fn test_produce_runs_on_spawned_task() {
        let sim = FeedSimulator::new(&RadarConfig::default());
        let queue = std::sync::Arc::new(MemoryQueue::new());
        let q = queue.clone();
        tokio::spawn(async move { sim.produce(q.as_ref(), 5).await })
            .await
            .unwrap();
        assert_eq!(queue.len().await, 5);
    }
}
