//! Node configuration.

use std::time::Duration;

use swaprail_aggregator::AggregatorConfig;
use swaprail_common::time::{constants, paging};
use swaprail_messaging::MessagingConfig;

/// Currency synchronization configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Catalog refresh interval.
    pub catalog_interval: Duration,
    /// Price refresh interval.
    pub price_interval: Duration,
    /// Delay before the first price run, so the catalog is loaded first.
    pub price_start_delay: Duration,
    /// Pause between price pages.
    pub page_delay: Duration,
    /// Tickers requested per page.
    pub page_size: u32,
    /// Upper bound on pages per price run.
    pub max_pages: u32,
    /// Currency prices are quoted in.
    pub target_currency: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            catalog_interval: constants::catalog_sync_interval(),
            price_interval: constants::price_sync_interval(),
            price_start_delay: constants::price_sync_start_delay(),
            page_delay: constants::price_page_delay(),
            page_size: paging::PAGE_SIZE,
            max_pages: paging::MAX_PAGES,
            target_currency: paging::TARGET_CURRENCY.to_string(),
        }
    }
}

/// Pacing for swaps the exchange has not finished yet.
///
/// The consumer waits before handing an in-progress swap back to the broker,
/// doubling the wait per redelivery up to `max_delay`.
#[derive(Debug, Clone)]
pub struct SwapRetryConfig {
    pub delay: Duration,
    pub max_delay: Duration,
}

impl Default for SwapRetryConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl SwapRetryConfig {
    /// Wait before the `attempt`-th redelivery, starting at 1.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// CoinGecko price feed configuration.
#[derive(Debug, Clone)]
pub struct CoinGeckoConfig {
    /// API base URL. Pro keys need the pro host.
    pub base_url: String,
    pub api_key: Option<String>,
    /// Request timeout.
    pub request_timeout: Duration,
}

impl Default for CoinGeckoConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.coingecko.com/api/v3".to_string(),
            api_key: None,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Main node configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Database URL.
    pub database_url: String,
    /// Run the currency synchronization daemon.
    pub daemon_enabled: bool,
    /// Log level used when `RUST_LOG` is unset.
    pub log_level: String,
    /// Routing key swap notifications are published with.
    pub swap_routing_key: String,
    /// Prices older than this are ignored when scoring quotes.
    pub price_staleness: Duration,
    /// How often the node logs its metrics.
    pub metrics_interval: Duration,
    pub aggregator: AggregatorConfig,
    pub sync: SyncConfig,
    pub swap_retry: SwapRetryConfig,
    pub messaging: MessagingConfig,
    pub coingecko: CoinGeckoConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/swaprail".to_string(),
            daemon_enabled: true,
            log_level: "info".to_string(),
            swap_routing_key: "swaprail.swap".to_string(),
            price_staleness: constants::price_staleness(),
            metrics_interval: Duration::from_secs(60),
            aggregator: AggregatorConfig::default(),
            sync: SyncConfig::default(),
            swap_retry: SwapRetryConfig::default(),
            messaging: MessagingConfig::default(),
            coingecko: CoinGeckoConfig::default(),
        }
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
}

fn env_millis(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
}

impl ServiceConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self {
            messaging: MessagingConfig::from_env(),
            ..Self::default()
        };

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = url;
        }

        if let Ok(enabled) = std::env::var("DAEMON_ENABLED") {
            config.daemon_enabled = enabled.eq_ignore_ascii_case("true") || enabled == "1";
        }

        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.log_level = level;
        }

        if let Ok(key) = std::env::var("SWAP_ROUTING_KEY") {
            config.swap_routing_key = key;
        }

        if let Some(staleness) = env_secs("PRICE_STALENESS_SECS") {
            config.price_staleness = staleness;
        }

        if let Some(interval) = env_secs("METRICS_INTERVAL_SECS") {
            config.metrics_interval = interval;
        }

        if let Some(timeout) = env_secs("EXCHANGE_TIMEOUT_SECS") {
            config.aggregator.exchange_timeout = timeout;
        }

        if let Some(interval) = env_secs("CATALOG_SYNC_INTERVAL_SECS") {
            config.sync.catalog_interval = interval;
        }

        if let Some(interval) = env_secs("PRICE_SYNC_INTERVAL_SECS") {
            config.sync.price_interval = interval;
        }

        if let Some(delay) = env_secs("PRICE_PAGE_DELAY_SECS") {
            config.sync.page_delay = delay;
        }

        if let Ok(pages) = std::env::var("PRICE_MAX_PAGES") {
            if let Ok(pages) = pages.parse() {
                config.sync.max_pages = pages;
            }
        }

        if let Some(delay) = env_millis("SWAP_RETRY_DELAY_MS") {
            config.swap_retry.delay = delay;
        }

        if let Some(delay) = env_millis("SWAP_RETRY_MAX_DELAY_MS") {
            config.swap_retry.max_delay = delay;
        }

        if let Ok(url) = std::env::var("COINGECKO_BASE_URL") {
            config.coingecko.base_url = url;
        }

        if let Ok(key) = std::env::var("COINGECKO_API_KEY") {
            if !key.is_empty() {
                config.coingecko.api_key = Some(key);
            }
        }

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.database_url.is_empty() {
            return Err("Database URL cannot be empty".to_string());
        }

        if self.swap_routing_key.is_empty() {
            return Err("Swap routing key cannot be empty".to_string());
        }

        if self.metrics_interval.is_zero() {
            return Err("Metrics interval cannot be zero".to_string());
        }

        if self.sync.catalog_interval.is_zero() || self.sync.price_interval.is_zero() {
            return Err("Sync intervals cannot be zero".to_string());
        }

        if self.sync.page_size == 0 || self.sync.page_size > paging::PAGE_SIZE {
            return Err(format!("Page size must be between 1 and {}", paging::PAGE_SIZE));
        }

        if self.sync.max_pages == 0 {
            return Err("Max pages must be at least 1".to_string());
        }

        if self.swap_retry.delay > self.swap_retry.max_delay {
            return Err("Swap retry delay cannot exceed its maximum".to_string());
        }

        // The wait runs inside the message handler and must finish before it
        // is cancelled.
        if self.swap_retry.max_delay >= self.messaging.handler_timeout {
            return Err("Swap retry max delay must be shorter than the handler timeout".to_string());
        }

        if self.coingecko.base_url.is_empty() {
            return Err("CoinGecko base URL cannot be empty".to_string());
        }

        self.aggregator.validate()?;
        self.messaging.validate()?;

        Ok(())
    }
}
