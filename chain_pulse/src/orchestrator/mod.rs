use crate::cache::{bounded, CacheStats, ResultCache};
use crate::config::AppConfig;
use crate::feed::{FeedError, MarketFeed};
use crate::greeks::greeks;
use crate::model::{
    AnalyticsFrame, InstrumentClass, OptionChainSnapshot, OptionKind, StrikeAnalytics,
    StrikeQuote, TopicKey,
};
use crate::pricing::{implied_vol, theoretical_price};
use crate::reversal::{reversal_point, ReversalInputs};
use crate::summary::summarize;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const DAYS_PER_YEAR: f64 = 365.0;

#[derive(Debug, Error)]
pub enum TickError {
    #[error("snapshot fetch failed: {0}")]
    Fetch(#[from] FeedError),
    #[error("snapshot fetch exceeded {0:?}")]
    Timeout(Duration),
    #[error("feed answered {received} for topic {expected}")]
    Mismatch {
        expected: TopicKey,
        received: TopicKey,
    },
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub risk_free_rate: f64,
    pub fetch_timeout: Duration,
    pub cache_timeout: Duration,
    pub cache_ttl: Duration,
    pub index_symbols: HashSet<String>,
}

impl OrchestratorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            risk_free_rate: config.risk_free_rate,
            fetch_timeout: config.fetch_timeout,
            cache_timeout: config.cache_timeout,
            cache_ttl: config.cache_ttl(),
            index_symbols: config.index_symbols.iter().cloned().collect(),
        }
    }

    pub fn instrument_class(&self, symbol: &str) -> InstrumentClass {
        if self.index_symbols.contains(symbol) {
            InstrumentClass::Index
        } else {
            InstrumentClass::Stock
        }
    }
}

/// Previous tick's spot and per-strike IVs (percent points); the reference
/// for the spot/IV changes fed into the reversal model.
#[derive(Debug, Clone, PartialEq)]
pub struct Baseline {
    pub spot: f64,
    ivs: HashMap<u64, (f64, f64)>,
}

impl Baseline {
    pub fn from_frame(frame: &AnalyticsFrame) -> Self {
        Self {
            spot: frame.spot,
            ivs: frame
                .strikes
                .iter()
                .map(|row| (row.strike.to_bits(), (row.call_iv, row.put_iv)))
                .collect(),
        }
    }

    pub fn ivs_at(&self, strike: f64) -> Option<(f64, f64)> {
        self.ivs.get(&strike.to_bits()).copied()
    }
}

/// Per-topic unit of work: fetch, price, assemble, cache.
pub struct AnalyticsOrchestrator {
    feed: Arc<dyn MarketFeed>,
    cache: Arc<dyn ResultCache>,
    settings: OrchestratorSettings,
    baselines: Mutex<HashMap<TopicKey, Baseline>>,
}

impl AnalyticsOrchestrator {
    pub fn new(
        feed: Arc<dyn MarketFeed>,
        cache: Arc<dyn ResultCache>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            feed,
            cache,
            settings,
            baselines: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// One scheduled cycle. On success the topic baseline moves to this
    /// frame and the frame is written through to the cache.
    pub async fn tick(&self, key: &TopicKey) -> Result<Arc<AnalyticsFrame>, TickError> {
        self.tick_until(key, &CancellationToken::new()).await
    }

    /// [`Self::tick`] for a worker that may be stopped mid-cycle. Once `cancel`
    /// fires the baseline is left alone, so a torn-down topic restarts clean.
    pub async fn tick_until(
        &self,
        key: &TopicKey,
        cancel: &CancellationToken,
    ) -> Result<Arc<AnalyticsFrame>, TickError> {
        let started = Instant::now();
        let snapshot = self.fetch(key).await?;
        let baseline = self.baselines.lock().get(key).cloned();
        let frame = Arc::new(self.compute_frame(&snapshot, baseline.as_ref()));
        {
            // checked under the lock `forget` takes after cancelling
            let mut baselines = self.baselines.lock();
            if !cancel.is_cancelled() {
                baselines.insert(key.clone(), Baseline::from_frame(&frame));
            }
        }
        self.write_through(key, &frame).await;
        debug!(
            target: "tick",
            topic = %key,
            strikes = frame.strikes.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "frame computed"
        );
        Ok(frame)
    }

    /// Immediate out-of-schedule cycle for pull clients. Reads the baseline
    /// but leaves it where the scheduled ticks put it.
    pub async fn refresh(&self, key: &TopicKey) -> Result<Arc<AnalyticsFrame>, TickError> {
        let snapshot = self.fetch(key).await?;
        let baseline = self.baselines.lock().get(key).cloned();
        let frame = Arc::new(self.compute_frame(&snapshot, baseline.as_ref()));
        self.write_through(key, &frame).await;
        info!(target: "tick", topic = %key, "on-demand frame computed");
        Ok(frame)
    }

    pub async fn cached(&self, key: &TopicKey) -> Option<Arc<AnalyticsFrame>> {
        bounded(
            self.settings.cache_timeout,
            "get",
            key,
            self.cache.get(key),
        )
        .await
        .flatten()
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.stats()
    }

    pub fn forget(&self, key: &TopicKey) {
        self.baselines.lock().remove(key);
    }

    pub fn baseline(&self, key: &TopicKey) -> Option<Baseline> {
        self.baselines.lock().get(key).cloned()
    }

    async fn fetch(&self, key: &TopicKey) -> Result<OptionChainSnapshot, TickError> {
        let limit = self.settings.fetch_timeout;
        let snapshot = tokio::time::timeout(limit, self.feed.fetch_snapshot(&key.symbol, key.expiry))
            .await
            .map_err(|_| TickError::Timeout(limit))??;
        let received = snapshot.topic();
        if &received != key {
            return Err(TickError::Mismatch {
                expected: key.clone(),
                received,
            });
        }
        Ok(snapshot)
    }

    async fn write_through(&self, key: &TopicKey, frame: &Arc<AnalyticsFrame>) {
        bounded(
            self.settings.cache_timeout,
            "set",
            key,
            self.cache.set(key, Arc::clone(frame), self.settings.cache_ttl),
        )
        .await;
    }

    /// Pure part of a tick: every strike priced from this snapshot only.
    pub fn compute_frame(
        &self,
        snapshot: &OptionChainSnapshot,
        baseline: Option<&Baseline>,
    ) -> AnalyticsFrame {
        let days = snapshot.days_to_expiry();
        let t_years = days / DAYS_PER_YEAR;
        let class = self.settings.instrument_class(&snapshot.symbol);
        let spot_change = baseline.map(|b| snapshot.spot - b.spot).unwrap_or(0.0);

        let strikes = snapshot
            .strikes
            .iter()
            .map(|row| {
                self.analyze_strike(snapshot.spot, row, t_years, days, spot_change, class, baseline)
            })
            .collect();

        AnalyticsFrame {
            symbol: snapshot.symbol.clone(),
            expiry: snapshot.expiry,
            snapshot_timestamp: snapshot.timestamp,
            spot: snapshot.spot,
            strikes,
            summary: summarize(snapshot.spot, &snapshot.strikes),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn analyze_strike(
        &self,
        spot: f64,
        row: &StrikeQuote,
        t_years: f64,
        days: f64,
        spot_change: f64,
        class: InstrumentClass,
        baseline: Option<&Baseline>,
    ) -> StrikeAnalytics {
        let rate = self.settings.risk_free_rate;
        let call_iv = self.leg_iv(spot, row.strike, t_years, row.call_iv, row.call_ltp, OptionKind::Call);
        let put_iv = self.leg_iv(spot, row.strike, t_years, row.put_iv, row.put_ltp, OptionKind::Put);

        let call_greeks = greeks(spot, row.strike, t_years, rate, call_iv / 100.0, OptionKind::Call);
        let put_greeks = greeks(spot, row.strike, t_years, rate, put_iv / 100.0, OptionKind::Put);
        let call_theoretical =
            theoretical_price(spot, row.strike, t_years, rate, call_iv / 100.0, OptionKind::Call);
        let put_theoretical =
            theoretical_price(spot, row.strike, t_years, rate, put_iv / 100.0, OptionKind::Put);

        let current_iv = mean_positive(call_iv, put_iv);
        let iv_change = baseline
            .and_then(|b| b.ivs_at(row.strike))
            .map(|(prev_call, prev_put)| current_iv - mean_positive(prev_call, prev_put))
            .unwrap_or(0.0);

        // An untraded leg carries no mispricing signal.
        let observed = |ltp: f64, theoretical: f64| if ltp > 0.0 { ltp } else { theoretical };

        let reversal = reversal_point(&ReversalInputs {
            strike: row.strike,
            call_greeks,
            put_greeks,
            iv_change,
            days_to_expiry: days,
            spot_change,
            current_call_price: observed(row.call_ltp, call_theoretical),
            current_put_price: observed(row.put_ltp, put_theoretical),
            theoretical_call_price: call_theoretical,
            theoretical_put_price: put_theoretical,
            instrument_class: class,
            current_iv,
        });

        StrikeAnalytics {
            strike: row.strike,
            call_greeks,
            put_greeks,
            reversal,
            call_price: row.call_ltp,
            put_price: row.put_ltp,
            call_theoretical,
            put_theoretical,
            call_iv,
            put_iv,
            call_oi: row.call_oi,
            put_oi: row.put_oi,
        }
    }

    /// Feed IV when quoted, otherwise backed out of the last traded price.
    /// Percent points; zero when neither is usable.
    fn leg_iv(
        &self,
        spot: f64,
        strike: f64,
        t_years: f64,
        quoted_iv: f64,
        ltp: f64,
        kind: OptionKind,
    ) -> f64 {
        if quoted_iv.is_finite() && quoted_iv > 0.0 {
            quoted_iv
        } else if ltp.is_finite() && ltp > 0.0 {
            implied_vol(ltp, spot, strike, t_years, self.settings.risk_free_rate, kind) * 100.0
        } else {
            0.0
        }
    }
}

fn mean_positive(a: f64, b: f64) -> f64 {
    match (a > 0.0, b > 0.0) {
        (true, true) => 0.5 * (a + b),
        (true, false) => a,
        (false, true) => b,
        (false, false) => 0.0,
    }
}
