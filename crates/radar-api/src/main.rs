//! PhishRadar server
//!
//! Wires the full engine together: synthetic producers feed the queue, the
//! pipeline consumes it, the correlator sweeps on a cadence (sooner when a
//! high-confidence upsert asks for it), and the HTTP API serves reads.

use radar_api::{build_router, AppState};
use radar_core::correlation::CampaignCorrelator;
use radar_core::feedsim::FeedSimulator;
use radar_core::orchestrate::Orchestrator;
use radar_core::pipeline::IngestPipeline;
use radar_core::queue::MemoryQueue;
use radar_core::store::MemoryStore;
use radar_core::RadarConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = RadarConfig::from_env();
    let queue = Arc::new(MemoryQueue::new());
    let store = Arc::new(MemoryStore::new());
    let pipeline = Arc::new(IngestPipeline::new(
        queue.clone(),
        store.clone(),
        config.clone(),
    ));
    let correlator = Arc::new(CampaignCorrelator::new(config.clone()));
    let orchestrator = Arc::new(Orchestrator::new(config.clone()));

    // Synthetic producer keeps the demo deployment fed.
    let simulator = FeedSimulator::new(&config);
    let producer_queue = queue.clone();
    tokio::spawn(async move {
        simulator
            .run(producer_queue.as_ref(), 8, Duration::from_secs(10))
            .await;
    });

    let consumer = pipeline.clone();
    tokio::spawn(async move { consumer.run().await });

    // Periodic sweep, pulled forward when the pipeline flags a
    // high-confidence upsert.
    let sweep_store = store.clone();
    let sweep_correlator = correlator;
    let sweep_pipeline = pipeline.clone();
    let sweep_interval = config.sweep_interval_secs.max(1);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        let mut elapsed = 0u64;
        loop {
            ticker.tick().await;
            elapsed += 1;
            if elapsed < sweep_interval && !sweep_pipeline.take_sweep_request() {
                continue;
            }
            elapsed = 0;
            match sweep_correlator
                .sweep(sweep_store.as_ref(), chrono::Utc::now())
                .await
            {
                Ok(campaigns) => {
                    tracing::debug!(campaigns = campaigns.len(), "correlation sweep complete")
                }
                Err(e) => tracing::warn!(error = %e, "correlation sweep failed"),
            }
        }
    });

    let state = AppState {
        store,
        pipeline,
        orchestrator,
        config: config.clone(),
    };
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "radar api listening");
    axum::serve(listener, router).await?;
    Ok(())
}
