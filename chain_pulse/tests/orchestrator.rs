use assert_approx_eq::assert_approx_eq;
use chain_pulse::cache::{InMemoryCache, ResultCache, UnavailableCache};
use chain_pulse::delivery::{ChannelSink, PullDelivery, StreamEvent, Transport};
use chain_pulse::feed::{FeedError, ScriptedFeed};
use chain_pulse::hub::SubscriptionHub;
use chain_pulse::model::{OptionChainSnapshot, StrikeQuote, TopicKey};
use chain_pulse::orchestrator::{AnalyticsOrchestrator, OrchestratorSettings, TickError};
use chain_pulse::scheduler::TopicWorker;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const EXPIRY: i64 = 4_102_444_800;

fn key() -> TopicKey {
    TopicKey {
        symbol: "NIFTY".into(),
        expiry: EXPIRY,
    }
}

fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        risk_free_rate: 0.065,
        fetch_timeout: Duration::from_millis(100),
        cache_timeout: Duration::from_millis(50),
        cache_ttl: Duration::from_secs(5),
        index_symbols: ["NIFTY".to_string()].into_iter().collect(),
    }
}

fn quote(strike: f64, iv: f64) -> StrikeQuote {
    StrikeQuote {
        strike,
        call_ltp: 120.0,
        put_ltp: 110.0,
        call_oi: 5_000.0,
        put_oi: 6_000.0,
        call_iv: iv,
        put_iv: iv,
        call_volume: 100.0,
        put_volume: 90.0,
    }
}

fn snapshot(spot: f64, strikes: &[f64], iv: f64) -> OptionChainSnapshot {
    OptionChainSnapshot {
        symbol: "NIFTY".into(),
        expiry: EXPIRY,
        spot,
        timestamp: DateTime::<Utc>::from_timestamp(EXPIRY - 7 * 86_400, 0).expect("timestamp"),
        strikes: strikes.iter().map(|&s| quote(s, iv)).collect(),
    }
}

#[tokio::test]
async fn failed_tick_publishes_nothing_and_next_tick_uses_only_fresh_data() {
    let feed = Arc::new(ScriptedFeed::new());
    feed.push_error(FeedError::Invalid("exchange hiccup".into()));
    feed.push_snapshot(snapshot(24_650.0, &[24_600.0, 24_700.0], 14.0));

    let hub = SubscriptionHub::new();
    let (sink, mut rx) = ChannelSink::channel(Transport::Push, 8);
    hub.subscribe(&key(), Arc::new(sink));

    let orchestrator = Arc::new(AnalyticsOrchestrator::new(
        feed.clone(),
        Arc::new(InMemoryCache::new()),
        settings(),
    ));
    let worker = TopicWorker {
        key: key(),
        hub: hub.clone(),
        orchestrator: Arc::clone(&orchestrator),
        cancel: CancellationToken::new(),
    };

    let first = worker.step().await;
    assert_eq!(first.delivered, 1);
    assert!(matches!(rx.try_recv(), Ok(StreamEvent::Error(_))));
    assert!(rx.try_recv().is_err());
    assert!(orchestrator.baseline(&key()).is_none());

    worker.step().await;
    let frame = match rx.try_recv() {
        Ok(StreamEvent::Frame(frame)) => frame,
        other => panic!("expected a frame, got {other:?}"),
    };
    assert!(rx.try_recv().is_err());
    assert_eq!(frame.spot, 24_650.0);
    let strikes: Vec<f64> = frame.strikes.iter().map(|row| row.strike).collect();
    assert_eq!(strikes, vec![24_600.0, 24_700.0]);
    // first successful tick has nothing to diff against
    for row in &frame.strikes {
        assert_eq!(row.reversal.breakdown.contributions.gamma, 0.0);
        assert_eq!(row.reversal.breakdown.contributions.vega, 0.0);
    }
    assert_eq!(feed.calls(), 2);
}

#[tokio::test]
async fn baseline_tracks_previous_tick_only() {
    let feed = Arc::new(ScriptedFeed::new());
    feed.push_snapshot(snapshot(24_600.0, &[24_600.0], 14.0));
    feed.push_snapshot(snapshot(24_640.0, &[24_600.0], 15.0));
    feed.push_snapshot(snapshot(24_620.0, &[24_600.0], 15.5));
    let orchestrator =
        AnalyticsOrchestrator::new(feed, Arc::new(InMemoryCache::new()), settings());

    orchestrator.tick(&key()).await.expect("tick 1");
    orchestrator.tick(&key()).await.expect("tick 2");
    let third = orchestrator.tick(&key()).await.expect("tick 3");

    let row = &third.strikes[0];
    let b = row.reversal.breakdown;
    // spot 24640 -> 24620, iv 15 -> 15.5
    assert_approx_eq!(b.contributions.gamma, b.weights.gamma * 0.5 * b.net_greeks.gamma * 400.0, 1e-9);
    assert_approx_eq!(b.contributions.vega, b.weights.vega * b.net_greeks.vega * 0.5, 1e-9);
    assert_eq!(orchestrator.baseline(&key()).map(|b| b.spot), Some(24_620.0));
}

#[tokio::test]
async fn slow_feed_times_out_as_a_failed_tick() {
    let feed = Arc::new(ScriptedFeed::new().with_delay(Duration::from_millis(400)));
    feed.set_fallback(snapshot(24_600.0, &[24_600.0], 14.0));
    let orchestrator =
        AnalyticsOrchestrator::new(feed, Arc::new(InMemoryCache::new()), settings());

    let result = orchestrator.tick(&key()).await;
    assert!(matches!(result, Err(TickError::Timeout(_))));
    assert!(orchestrator.baseline(&key()).is_none());
}

#[tokio::test]
async fn feed_answering_for_another_topic_is_rejected() {
    let feed = Arc::new(ScriptedFeed::new());
    let mut wrong = snapshot(24_600.0, &[24_600.0], 14.0);
    wrong.symbol = "BANKNIFTY".into();
    feed.push_snapshot(wrong);
    let orchestrator =
        AnalyticsOrchestrator::new(feed, Arc::new(InMemoryCache::new()), settings());

    assert!(matches!(
        orchestrator.tick(&key()).await,
        Err(TickError::Mismatch { .. })
    ));
}

#[tokio::test]
async fn unavailable_cache_never_blocks_ticks_or_pulls() {
    let feed = Arc::new(ScriptedFeed::new());
    feed.set_fallback(snapshot(24_600.0, &[24_500.0, 24_600.0, 24_700.0], 14.0));
    let orchestrator = Arc::new(AnalyticsOrchestrator::new(
        feed.clone(),
        Arc::new(UnavailableCache),
        settings(),
    ));

    let frame = orchestrator.tick(&key()).await.expect("tick despite cache");
    assert_eq!(frame.strikes.len(), 3);
    assert!(orchestrator.cached(&key()).await.is_none());

    let pull = PullDelivery::new(Arc::clone(&orchestrator));
    let pulled = pull.snapshot(&key()).await.expect("pull falls back to refresh");
    assert_eq!(pulled.strikes.len(), 3);
    assert_eq!(feed.calls(), 2);
}

#[tokio::test]
async fn pull_prefers_cache_and_refresh_leaves_baseline_alone() {
    let feed = Arc::new(ScriptedFeed::new());
    feed.push_snapshot(snapshot(24_600.0, &[24_600.0], 14.0));
    feed.set_fallback(snapshot(24_900.0, &[24_600.0], 18.0));
    let cache = Arc::new(InMemoryCache::new());
    let orchestrator = Arc::new(AnalyticsOrchestrator::new(
        feed.clone(),
        cache.clone(),
        settings(),
    ));
    let pull = PullDelivery::new(Arc::clone(&orchestrator));

    orchestrator.tick(&key()).await.expect("tick");
    let cached = pull.snapshot(&key()).await.expect("cached");
    assert_eq!(cached.spot, 24_600.0);
    assert_eq!(feed.calls(), 1);

    let refreshed = orchestrator.refresh(&key()).await.expect("refresh");
    assert_eq!(refreshed.spot, 24_900.0);
    assert_eq!(orchestrator.baseline(&key()).map(|b| b.spot), Some(24_600.0));
    assert_eq!(
        cache.get(&key()).await.expect("cache").map(|f| f.spot),
        Some(24_900.0)
    );

    orchestrator.forget(&key());
    assert!(orchestrator.baseline(&key()).is_none());
}

#[tokio::test]
async fn pull_reports_unavailable_when_nothing_can_be_fetched() {
    let orchestrator = Arc::new(AnalyticsOrchestrator::new(
        Arc::new(ScriptedFeed::new()),
        Arc::new(InMemoryCache::new()),
        settings(),
    ));
    let pull = PullDelivery::new(orchestrator);
    assert!(pull.snapshot(&key()).await.is_err());
}

#[tokio::test]
async fn concurrent_pulls_on_a_cold_topic_share_one_fetch() {
    let feed = Arc::new(ScriptedFeed::new().with_delay(Duration::from_millis(50)));
    feed.set_fallback(snapshot(24_600.0, &[24_600.0, 24_700.0], 14.0));
    let orchestrator = Arc::new(AnalyticsOrchestrator::new(
        feed.clone(),
        Arc::new(UnavailableCache),
        settings(),
    ));
    let pull = PullDelivery::new(orchestrator);

    let topic = key();
    let pulls = (0..10).map(|_| pull.snapshot(&topic));
    let frames = futures::future::join_all(pulls).await;
    assert!(frames.iter().all(|frame| frame.is_ok()));
    assert_eq!(feed.calls(), 1);
    assert_eq!(pull.refreshes_in_flight(), 0);

    // once settled, the next miss fetches again
    pull.snapshot(&key()).await.expect("second pull");
    assert_eq!(feed.calls(), 2);
}

#[tokio::test]
async fn shared_pull_failure_reaches_every_waiter() {
    let feed = Arc::new(ScriptedFeed::new().with_delay(Duration::from_millis(20)));
    let orchestrator = Arc::new(AnalyticsOrchestrator::new(
        feed.clone(),
        Arc::new(InMemoryCache::new()),
        settings(),
    ));
    let pull = PullDelivery::new(orchestrator);

    let (key_a, key_b) = (key(), key());
    let (a, b) = tokio::join!(pull.snapshot(&key_a), pull.snapshot(&key_b));
    assert!(a.is_err() && b.is_err());
    assert_eq!(feed.calls(), 1);
}

#[tokio::test]
async fn cancelled_tick_leaves_no_baseline_behind() {
    let feed = Arc::new(ScriptedFeed::new());
    feed.set_fallback(snapshot(24_600.0, &[24_600.0], 14.0));
    let orchestrator =
        AnalyticsOrchestrator::new(feed, Arc::new(InMemoryCache::new()), settings());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let frame = orchestrator
        .tick_until(&key(), &cancel)
        .await
        .expect("frame still computed");
    assert_eq!(frame.spot, 24_600.0);
    assert!(orchestrator.baseline(&key()).is_none());

    orchestrator
        .tick_until(&key(), &CancellationToken::new())
        .await
        .expect("live tick");
    assert_eq!(orchestrator.baseline(&key()).map(|b| b.spot), Some(24_600.0));
}
