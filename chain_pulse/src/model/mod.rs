use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OptionKind {
    Call,
    Put,
}

impl Display for OptionKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            OptionKind::Call => write!(f, "CE"),
            OptionKind::Put => write!(f, "PE"),
        }
    }
}

/// Index underlyings get a wider reversal band than single stocks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentClass {
    Index,
    Stock,
}

impl Display for InstrumentClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            InstrumentClass::Index => write!(f, "index"),
            InstrumentClass::Stock => write!(f, "stock"),
        }
    }
}

/// Fan-out key shared by every subscriber of one (symbol, expiry) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicKey {
    pub symbol: String,
    /// Expiry as epoch seconds.
    pub expiry: i64,
}

impl TopicKey {
    pub const MAX_SYMBOL_LEN: usize = 20;

    /// Parses raw path parameters. Only shape is checked here; allow-lists and
    /// expiry freshness live in [`crate::config::AppConfig::check_topic`].
    pub fn parse(symbol: &str, expiry: &str) -> Result<Self, TopicError> {
        let symbol = symbol.trim().to_ascii_uppercase();
        if symbol.is_empty() || symbol.len() > Self::MAX_SYMBOL_LEN {
            return Err(TopicError::InvalidSymbol(symbol));
        }
        if !symbol
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '&' | '-' | '_'))
        {
            return Err(TopicError::InvalidSymbol(symbol));
        }
        let expiry: i64 = expiry
            .trim()
            .parse()
            .map_err(|_| TopicError::InvalidExpiry(expiry.to_string()))?;
        if expiry <= 0 {
            return Err(TopicError::InvalidExpiry(expiry.to_string()));
        }
        Ok(Self { symbol, expiry })
    }

    pub fn expiry_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp(self.expiry, 0)
    }
}

impl Display for TopicKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.symbol, self.expiry)
    }
}

impl FromStr for TopicKey {
    type Err = TopicError;

    // Format e.g. NIFTY:1735117200
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (symbol, expiry) = s
            .split_once(':')
            .ok_or_else(|| TopicError::InvalidFormat(s.to_string()))?;
        Self::parse(symbol, expiry)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopicError {
    #[error("invalid topic format: {0}")]
    InvalidFormat(String),
    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),
    #[error("unsupported symbol: {0}")]
    UnsupportedSymbol(String),
    #[error("invalid expiry: {0}")]
    InvalidExpiry(String),
    #[error("expiry already passed: {0}")]
    ExpiredContract(i64),
}

/// One strike row of an upstream chain. IVs are in percent points.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StrikeQuote {
    pub strike: f64,
    pub call_ltp: f64,
    pub put_ltp: f64,
    pub call_oi: f64,
    pub put_oi: f64,
    pub call_iv: f64,
    pub put_iv: f64,
    pub call_volume: f64,
    pub put_volume: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptionChainSnapshot {
    pub symbol: String,
    pub expiry: i64,
    pub spot: f64,
    pub timestamp: DateTime<Utc>,
    pub strikes: Vec<StrikeQuote>,
}

impl OptionChainSnapshot {
    pub fn topic(&self) -> TopicKey {
        TopicKey {
            symbol: self.symbol.clone(),
            expiry: self.expiry,
        }
    }

    /// Fractional days between the snapshot and expiry, never negative.
    pub fn days_to_expiry(&self) -> f64 {
        let seconds = self.expiry - self.timestamp.timestamp();
        (seconds.max(0) as f64) / 86_400.0
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct GreeksSet {
    pub delta: f64,
    pub gamma: f64,
    /// Per one volatility point.
    pub vega: f64,
    /// Per calendar day.
    pub theta: f64,
}

impl GreeksSet {
    pub const fn zero() -> Self {
        Self {
            delta: 0.0,
            gamma: 0.0,
            vega: 0.0,
            theta: 0.0,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.delta == 0.0 && self.gamma == 0.0 && self.vega == 0.0 && self.theta == 0.0
    }

    pub fn net(&self, other: &GreeksSet) -> GreeksSet {
        GreeksSet {
            delta: self.delta + other.delta,
            gamma: self.gamma + other.gamma,
            vega: self.vega + other.vega,
            theta: self.theta + other.theta,
        }
    }

    pub fn abs_sum(&self) -> f64 {
        self.delta.abs() + self.gamma.abs() + self.vega.abs() + self.theta.abs()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct GreekWeights {
    pub delta: f64,
    pub gamma: f64,
    pub vega: f64,
    pub theta: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct GreekContributions {
    pub delta: f64,
    pub gamma: f64,
    pub vega: f64,
    pub theta: f64,
}

impl GreekContributions {
    pub fn total(&self) -> f64 {
        self.delta + self.gamma + self.vega + self.theta
    }
}

/// Every intermediate of the reversal computation. Rendered by clients.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ReversalBreakdown {
    pub net_greeks: GreeksSet,
    pub weights: GreekWeights,
    pub contributions: GreekContributions,
    pub raw_adjustment: f64,
    pub time_sensitivity: f64,
    pub vol_sensitivity: f64,
    pub normalized_adjustment: f64,
    pub max_dynamic_shift: f64,
    pub scaled_adjustment: f64,
    pub price_weight: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ReversalPoint {
    pub strike: f64,
    pub predicted_reversal_price: f64,
    pub confidence_score: u8,
    pub breakdown: ReversalBreakdown,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ChainSummary {
    pub total_call_oi: f64,
    pub total_put_oi: f64,
    pub total_call_volume: f64,
    pub total_put_volume: f64,
    pub put_call_ratio: Option<f64>,
    pub atm_strike: Option<f64>,
    pub max_pain_strike: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StrikeAnalytics {
    pub strike: f64,
    pub call_greeks: GreeksSet,
    pub put_greeks: GreeksSet,
    pub reversal: ReversalPoint,
    pub call_price: f64,
    pub put_price: f64,
    pub call_theoretical: f64,
    pub put_theoretical: f64,
    pub call_iv: f64,
    pub put_iv: f64,
    pub call_oi: f64,
    pub put_oi: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalyticsFrame {
    pub symbol: String,
    pub expiry: i64,
    pub snapshot_timestamp: DateTime<Utc>,
    pub spot: f64,
    pub strikes: Vec<StrikeAnalytics>,
    pub summary: ChainSummary,
}

impl AnalyticsFrame {
    pub fn topic(&self) -> TopicKey {
        TopicKey {
            symbol: self.symbol.clone(),
            expiry: self.expiry,
        }
    }

    pub fn strike(&self, strike: f64) -> Option<&StrikeAnalytics> {
        self.strikes.iter().find(|row| row.strike == strike)
    }
}
