//! CoinGecko market data price feed.

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, warn};

use swaprail_aggregator::{FetchError, FetchResult, PriceFeed};
use swaprail_common::Ticker;

use crate::config::CoinGeckoConfig;

const PRO_HOST: &str = "pro-api.coingecko.com";
const PRO_KEY_HEADER: &str = "x-cg-pro-api-key";
const DEMO_KEY_HEADER: &str = "x-cg-demo-api-key";

#[derive(Debug, Deserialize)]
struct MarketCoin {
    symbol: String,
    current_price: Option<Decimal>,
    price_change_percentage_24h: Option<Decimal>,
}

/// `PriceFeed` backed by the `/coins/markets` endpoint.
pub struct CoinGeckoFeed {
    http: HttpClient,
    base_url: String,
    api_key: Option<String>,
}

impl CoinGeckoFeed {
    pub fn new(config: &CoinGeckoConfig) -> Self {
        let http = HttpClient::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_else(|err| {
                warn!(error = %err, "Failed to build HTTP client, using defaults");
                HttpClient::new()
            });

        Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
        }
    }

    /// Header the API key goes in; pro keys only work against the pro host.
    fn key_header(&self) -> &'static str {
        if self.base_url.to_lowercase().contains(PRO_HOST) {
            PRO_KEY_HEADER
        } else {
            DEMO_KEY_HEADER
        }
    }
}

#[async_trait]
impl PriceFeed for CoinGeckoFeed {
    async fn top_tickers(&self, target: &str, page_size: u32, page: u32) -> FetchResult<Vec<Ticker>> {
        let url = format!("{}/coins/markets", self.base_url);
        let page_size = page_size.to_string();
        let page = page.to_string();

        let mut request = self
            .http
            .get(&url)
            .header("accept", "application/json")
            .query(&[
                ("vs_currency", target.to_lowercase().as_str()),
                ("order", "market_cap_desc"),
                ("per_page", page_size.as_str()),
                ("page", page.as_str()),
                ("price_change_percentage", "24h"),
            ]);
        if let Some(key) = &self.api_key {
            request = request.header(self.key_header(), key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(format!("coingecko: {}", e))
            } else {
                FetchError::Provider(format!("coingecko: {}", e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Provider(format!(
                "coingecko returned {}: {}",
                status, body
            )));
        }

        let coins: Vec<MarketCoin> = response
            .json()
            .await
            .map_err(|e| FetchError::Provider(format!("coingecko: invalid response: {}", e)))?;

        let tickers: Vec<Ticker> = coins
            .into_iter()
            .filter_map(|coin| {
                let price = coin.current_price?;
                Some(Ticker::new(
                    coin.symbol.to_uppercase(),
                    price,
                    coin.price_change_percentage_24h.unwrap_or_default(),
                ))
            })
            .collect();

        debug!(page = %page, count = tickers.len(), "Fetched tickers");
        Ok(tickers)
    }
}
