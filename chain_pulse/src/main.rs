use anyhow::{Context, Result};
use chain_pulse::cache::InMemoryCache;
use chain_pulse::config::{AppConfig, Cli};
use chain_pulse::feed::HttpMarketFeed;
use chain_pulse::hub::SubscriptionHub;
use chain_pulse::model::TopicKey;
use chain_pulse::orchestrator::{AnalyticsOrchestrator, OrchestratorSettings};
use chain_pulse::render;
use chain_pulse::scheduler::TopicScheduler;
use chain_pulse::server::{self, ServerState};
use chrono::Utc;
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const ONCE_TABLE_ROWS: usize = 15;

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();
    let config = Arc::new(AppConfig::from_cli(cli)?);

    let feed = HttpMarketFeed::new(&config.feed_url, config.fetch_timeout)
        .context("failed to build market feed client")?;
    let cache = InMemoryCache::new();
    let orchestrator = Arc::new(AnalyticsOrchestrator::new(
        Arc::new(feed),
        Arc::new(cache.clone()),
        OrchestratorSettings::from_config(&config),
    ));

    if let Some(key) = config.once.clone() {
        return run_once(&config, &orchestrator, &key).await;
    }

    let hub = SubscriptionHub::new();
    let scheduler = Arc::new(TopicScheduler::new(
        hub.clone(),
        Arc::clone(&orchestrator),
        config.broadcast_interval,
    ));
    let shutdown = CancellationToken::new();

    {
        let hub_for_status = hub.clone();
        let cache_for_status = cache.clone();
        let scheduler_for_status = Arc::clone(&scheduler);
        let stats_interval = config.stats_interval;
        let stale_after = chrono::Duration::from_std(config.broadcast_interval * 3)?;
        let stop = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(stats_interval);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let purged = cache_for_status.purge_expired();
                let cache_stats = cache_for_status.entry_stats();
                let stats = hub_for_status.stats(stale_after);
                info!(
                    target: "stats",
                    topics = stats.topics,
                    workers = scheduler_for_status.active_workers(),
                    subs = stats.subscribers,
                    push = stats.push,
                    sse = stats.event_stream,
                    stale = stats.stale,
                    cached = cache_stats.live_entries,
                    purged
                );
            }
        });
    }

    {
        let stop = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(target: "server", error = %err, "failed to listen for shutdown signal");
            }
            info!(target: "server", "shutdown requested");
            stop.cancel();
        });
    }

    let state = ServerState::new(Arc::clone(&config), Arc::clone(&scheduler), orchestrator);
    let served = server::serve(config.listen_addr, state, shutdown.clone()).await;
    shutdown.cancel();
    scheduler.shutdown();
    served
}

async fn run_once(
    config: &AppConfig,
    orchestrator: &AnalyticsOrchestrator,
    key: &TopicKey,
) -> Result<()> {
    config.check_topic(key, Utc::now())?;
    info!(target: "tick", topic = %key, "computing single frame");
    let frame = orchestrator
        .tick(key)
        .await
        .with_context(|| format!("failed to compute frame for {key}"))?;

    render::print_frame(&frame, ONCE_TABLE_ROWS)?;
    if let Some(path) = &config.csv {
        render::export_csv(&frame, path)?;
    }
    Ok(())
}
