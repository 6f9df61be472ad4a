use crate::model::{TopicError, TopicKey};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use url::Url;

#[derive(Debug, Parser, Clone)]
#[command(name = "chain_pulse", author, version, about = "Live option-chain analytics streamer", long_about = None)]
pub struct Cli {
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    #[arg(long, env = "FEED_URL", default_value = "http://127.0.0.1:9000")]
    pub feed_url: String,

    #[arg(long, env = "BROADCAST_INTERVAL", default_value = "2s", value_parser = humantime::parse_duration)]
    pub broadcast_interval: Duration,

    #[arg(long, env = "FETCH_TIMEOUT", default_value = "1500ms", value_parser = humantime::parse_duration)]
    pub fetch_timeout: Duration,

    #[arg(long, env = "CACHE_TIMEOUT", default_value = "250ms", value_parser = humantime::parse_duration)]
    pub cache_timeout: Duration,

    #[arg(long, env = "CACHE_TTL_GRACE", default_value = "1s", value_parser = humantime::parse_duration)]
    pub cache_ttl_grace: Duration,

    #[arg(long, env = "RISK_FREE_RATE", default_value_t = 0.065)]
    pub risk_free_rate: f64,

    #[arg(
        long,
        env = "INDEX_SYMBOLS",
        default_value = "NIFTY,BANKNIFTY,FINNIFTY,MIDCPNIFTY,SENSEX",
        value_delimiter = ','
    )]
    pub index_symbols: Vec<String>,

    #[arg(long, env = "ALLOWED_SYMBOLS", value_delimiter = ',')]
    pub allowed_symbols: Vec<String>,

    #[arg(long, env = "SUBSCRIBER_BUFFER", default_value_t = 64usize)]
    pub subscriber_buffer: usize,

    #[arg(long, env = "STATS_INTERVAL", default_value = "30s", value_parser = humantime::parse_duration)]
    pub stats_interval: Duration,

    /// Compute one frame for SYMBOL:EXPIRY, print it and exit.
    #[arg(long)]
    pub once: Option<String>,

    /// With --once, also write the frame as CSV.
    #[arg(long, requires = "once")]
    pub csv: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub feed_url: String,
    pub broadcast_interval: Duration,
    pub fetch_timeout: Duration,
    pub cache_timeout: Duration,
    pub cache_ttl_grace: Duration,
    pub risk_free_rate: f64,
    pub index_symbols: Vec<String>,
    pub allowed_symbols: Vec<String>,
    pub subscriber_buffer: usize,
    pub stats_interval: Duration,
    pub once: Option<TopicKey>,
    pub csv: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;

        Url::parse(&cli.feed_url).with_context(|| format!("invalid feed url: {}", cli.feed_url))?;

        if cli.broadcast_interval.is_zero() {
            return Err(anyhow!("broadcast interval must be positive"));
        }
        if cli.fetch_timeout.is_zero() || cli.cache_timeout.is_zero() {
            return Err(anyhow!("timeouts must be positive"));
        }
        if !cli.risk_free_rate.is_finite() {
            return Err(anyhow!("risk free rate must be finite"));
        }
        if cli.subscriber_buffer == 0 {
            return Err(anyhow!("subscriber buffer must hold at least one frame"));
        }

        let normalize = |symbols: &[String]| -> Vec<String> {
            symbols
                .iter()
                .map(|s| s.trim().to_ascii_uppercase())
                .filter(|s| !s.is_empty())
                .collect()
        };

        let once = cli
            .once
            .as_deref()
            .map(|raw| raw.parse::<TopicKey>().with_context(|| format!("invalid --once topic: {raw}")))
            .transpose()?;

        let config = AppConfig {
            listen_addr,
            feed_url: cli.feed_url,
            broadcast_interval: cli.broadcast_interval,
            fetch_timeout: cli.fetch_timeout,
            cache_timeout: cli.cache_timeout,
            cache_ttl_grace: cli.cache_ttl_grace,
            risk_free_rate: cli.risk_free_rate,
            index_symbols: normalize(&cli.index_symbols),
            allowed_symbols: normalize(&cli.allowed_symbols),
            subscriber_buffer: cli.subscriber_buffer,
            stats_interval: cli.stats_interval,
            once,
            csv: cli.csv,
        };

        info!(
            "config" = serde_json::to_string(&config).unwrap_or_default(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Frames outlive one broadcast interval so late joiners still find one.
    pub fn cache_ttl(&self) -> Duration {
        self.broadcast_interval + self.cache_ttl_grace
    }

    /// Rejects topics that must never reach the orchestrator.
    pub fn check_topic(&self, key: &TopicKey, now: DateTime<Utc>) -> Result<(), TopicError> {
        if !self.allowed_symbols.is_empty() && !self.allowed_symbols.contains(&key.symbol) {
            return Err(TopicError::UnsupportedSymbol(key.symbol.clone()));
        }
        if key.expiry <= now.timestamp() {
            return Err(TopicError::ExpiredContract(key.expiry));
        }
        Ok(())
    }
}
