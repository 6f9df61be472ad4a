use crate::model::{OptionChainSnapshot, StrikeQuote, TopicKey};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use parking_lot::Mutex;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr, PickFirst};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Exchange local time (IST) used by the `dd-Mon-yyyy HH:MM:SS` stamps.
const EXCHANGE_UTC_OFFSET_SECS: i32 = 5 * 3_600 + 30 * 60;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("upstream returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to decode chain payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid chain payload: {0}")]
    Invalid(String),
    #[error("invalid feed url: {0}")]
    Url(#[from] url::ParseError),
    #[error("no snapshot available for {0}")]
    Unavailable(TopicKey),
}

/// The only thing the engine needs from an upstream market-data source.
#[async_trait]
pub trait MarketFeed: Send + Sync {
    async fn fetch_snapshot(&self, symbol: &str, expiry: i64)
        -> Result<OptionChainSnapshot, FeedError>;
}

#[derive(Debug)]
pub struct HttpMarketFeed {
    http: HttpClient,
    base: Url,
}

impl HttpMarketFeed {
    pub fn new(base: &str, request_timeout: Duration) -> Result<Self, FeedError> {
        let http = HttpClient::builder()
            .user_agent("chain_pulse/0.1")
            .timeout(request_timeout)
            .build()?;
        let mut base = Url::parse(base)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self { http, base })
    }

    pub fn chain_url(&self, symbol: &str, expiry: i64) -> Result<Url, FeedError> {
        let mut url = self.base.join("option-chain")?;
        url.query_pairs_mut()
            .append_pair("symbol", symbol)
            .append_pair("expiry", &expiry.to_string());
        Ok(url)
    }
}

#[async_trait]
impl MarketFeed for HttpMarketFeed {
    async fn fetch_snapshot(
        &self,
        symbol: &str,
        expiry: i64,
    ) -> Result<OptionChainSnapshot, FeedError> {
        let url = self.chain_url(symbol, expiry)?;
        debug!(target: "feed", %url, "fetching chain");
        let res = self.http.get(url).send().await?;
        let status = res.status();
        let text = res.text().await?;
        if !status.is_success() {
            return Err(FeedError::Status {
                status: status.as_u16(),
                body: text.chars().take(256).collect(),
            });
        }
        parse_chain_payload(symbol, expiry, &text)
    }
}

#[derive(Deserialize)]
struct ChainEnvelopeDto {
    records: RecordsDto,
}

#[derive(Deserialize)]
struct RecordsDto {
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(rename = "underlyingValue")]
    underlying_value: f64,
    #[serde(default)]
    data: Vec<StrikeRowDto>,
}

#[serde_as]
#[derive(Deserialize)]
struct StrikeRowDto {
    #[serde(rename = "strikePrice")]
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    strike_price: f64,
    #[serde(rename = "CE", default)]
    call: Option<LegDto>,
    #[serde(rename = "PE", default)]
    put: Option<LegDto>,
}

#[derive(Deserialize, Default)]
struct LegDto {
    #[serde(rename = "lastPrice", default)]
    last_price: f64,
    #[serde(rename = "openInterest", default)]
    open_interest: f64,
    #[serde(rename = "impliedVolatility", default)]
    implied_volatility: f64,
    #[serde(rename = "totalTradedVolume", default)]
    total_traded_volume: f64,
}

/// Parses an upstream chain body into a typed snapshot. Strikes come out
/// sorted and unique; rows with unusable strikes are dropped.
pub fn parse_chain_payload(
    symbol: &str,
    expiry: i64,
    body: &str,
) -> Result<OptionChainSnapshot, FeedError> {
    let dto: ChainEnvelopeDto = serde_json::from_str(body)?;
    let records = dto.records;
    if !(records.underlying_value.is_finite() && records.underlying_value > 0.0) {
        return Err(FeedError::Invalid(format!(
            "non-positive spot {}",
            records.underlying_value
        )));
    }
    let timestamp = records
        .timestamp
        .as_deref()
        .and_then(parse_upstream_timestamp)
        .unwrap_or_else(Utc::now);

    let mut strikes: Vec<StrikeQuote> = records
        .data
        .into_iter()
        .filter(|row| row.strike_price.is_finite() && row.strike_price > 0.0)
        .map(|row| {
            let call = row.call.unwrap_or_default();
            let put = row.put.unwrap_or_default();
            StrikeQuote {
                strike: row.strike_price,
                call_ltp: call.last_price,
                put_ltp: put.last_price,
                call_oi: call.open_interest,
                put_oi: put.open_interest,
                call_iv: call.implied_volatility,
                put_iv: put.implied_volatility,
                call_volume: call.total_traded_volume,
                put_volume: put.total_traded_volume,
            }
        })
        .collect();
    strikes.sort_by(|a, b| a.strike.total_cmp(&b.strike));
    strikes.dedup_by(|a, b| a.strike == b.strike);

    Ok(OptionChainSnapshot {
        symbol: symbol.to_string(),
        expiry,
        spot: records.underlying_value,
        timestamp,
        strikes,
    })
}

fn parse_upstream_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(epoch) = raw.parse::<i64>() {
        return DateTime::<Utc>::from_timestamp(epoch, 0);
    }
    // e.g. 24-Dec-2024 15:30:00, carries no zone
    let offset = FixedOffset::east_opt(EXCHANGE_UTC_OFFSET_SECS)?;
    NaiveDateTime::parse_from_str(raw, "%d-%b-%Y %H:%M:%S")
        .ok()?
        .and_local_timezone(offset)
        .single()
        .map(|local| local.with_timezone(&Utc))
}

/// In-process feed that replays queued responses, then repeats a fallback
/// snapshot if one is set. Used by tests and the offline demo path.
pub struct ScriptedFeed {
    responses: Mutex<VecDeque<Result<OptionChainSnapshot, FeedError>>>,
    fallback: Mutex<Option<OptionChainSnapshot>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedFeed {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(None),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_snapshot(&self, snapshot: OptionChainSnapshot) {
        self.responses.lock().push_back(Ok(snapshot));
    }

    pub fn push_error(&self, error: FeedError) {
        self.responses.lock().push_back(Err(error));
    }

    pub fn set_fallback(&self, snapshot: OptionChainSnapshot) {
        *self.fallback.lock() = Some(snapshot);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketFeed for ScriptedFeed {
    async fn fetch_snapshot(
        &self,
        symbol: &str,
        expiry: i64,
    ) -> Result<OptionChainSnapshot, FeedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.responses.lock().pop_front();
        match next {
            Some(result) => result,
            None => self.fallback.lock().clone().ok_or_else(|| {
                FeedError::Unavailable(TopicKey {
                    symbol: symbol.to_string(),
                    expiry,
                })
            }),
        }
    }
}
