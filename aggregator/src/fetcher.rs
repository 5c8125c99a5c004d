//! Exchange adapter and price feed traits.

use async_trait::async_trait;
use rust_decimal::Decimal;
use swaprail_common::{Currency, ExchangeStatus, NetworkPair, Quote, SwapRequest, SwapResponse, Ticker};

use crate::error::{FetchError, FetchResult};

/// An exchange adapter.
///
/// Only `name` and `get_currencies` are mandatory; the other operations
/// default to "unsupported" so that catalog-only sources can be registered.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Provider name, unique within an engine.
    fn name(&self) -> &str;

    /// Currencies this exchange can route.
    async fn get_currencies(&self) -> FetchResult<Vec<Currency>>;

    /// Quote `amount` of `from` into `to`.
    ///
    /// `Ok(None)` means the exchange does not handle the pair.
    async fn get_quote(
        &self,
        _from: &NetworkPair,
        _to: &NetworkPair,
        _amount: Decimal,
    ) -> FetchResult<Option<Quote>> {
        Ok(None)
    }

    /// Smallest amount of `from` the exchange accepts for the pair.
    async fn get_min_amount(&self, _from: &NetworkPair, _to: &NetworkPair) -> FetchResult<Decimal> {
        Err(FetchError::Unsupported(self.name().to_string()))
    }

    /// Create an order for the request.
    async fn create_exchange(&self, _request: &SwapRequest) -> FetchResult<SwapResponse> {
        Err(FetchError::Unsupported(self.name().to_string()))
    }

    /// Current state of an order created earlier.
    async fn get_exchange_status(&self, _external_id: &str) -> FetchResult<ExchangeStatus> {
        Err(FetchError::Unsupported(self.name().to_string()))
    }
}

/// Source of market price tickers.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// One page of tickers priced in `target`, ordered by market cap.
    ///
    /// Pages start at 1. An empty page means the feed is exhausted.
    async fn top_tickers(&self, target: &str, page_size: u32, page: u32) -> FetchResult<Vec<Ticker>>;
}

/// Mock exchange adapter for testing.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use chrono::Utc;
    use dashmap::DashMap;
    use parking_lot::RwLock;

    use super::*;

    fn pair_key(from: &NetworkPair, to: &NetworkPair) -> String {
        format!("{}/{}", from, to)
    }

    /// Configurable in-memory `Fetcher`.
    pub struct MockFetcher {
        name: String,
        currencies: RwLock<Vec<Currency>>,
        rates: DashMap<String, Decimal>,
        min_amounts: DashMap<String, Decimal>,
        statuses: DashMap<String, ExchangeStatus>,
        delay: RwLock<Option<Duration>>,
        failing: RwLock<Option<String>>,
        currency_calls: AtomicUsize,
        quote_calls: AtomicUsize,
        orders: AtomicUsize,
    }

    impl MockFetcher {
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                currencies: RwLock::new(Vec::new()),
                rates: DashMap::new(),
                min_amounts: DashMap::new(),
                statuses: DashMap::new(),
                delay: RwLock::new(None),
                failing: RwLock::new(None),
                currency_calls: AtomicUsize::new(0),
                quote_calls: AtomicUsize::new(0),
                orders: AtomicUsize::new(0),
            }
        }

        pub fn with_currencies(self, currencies: Vec<Currency>) -> Self {
            *self.currencies.write() = currencies;
            self
        }

        /// Quote the pair at `rate` (output per unit of input).
        pub fn with_rate(self, from: &NetworkPair, to: &NetworkPair, rate: Decimal) -> Self {
            self.rates.insert(pair_key(from, to), rate);
            self
        }

        pub fn with_min_amount(self, from: &NetworkPair, to: &NetworkPair, min: Decimal) -> Self {
            self.min_amounts.insert(pair_key(from, to), min);
            self
        }

        /// Delay every call by `delay`.
        pub fn with_delay(self, delay: Duration) -> Self {
            *self.delay.write() = Some(delay);
            self
        }

        /// Fail every call with `message`.
        pub fn failing(self, message: impl Into<String>) -> Self {
            *self.failing.write() = Some(message.into());
            self
        }

        pub fn set_status(&self, external_id: impl Into<String>, status: ExchangeStatus) {
            self.statuses.insert(external_id.into(), status);
        }

        pub fn currency_calls(&self) -> usize {
            self.currency_calls.load(Ordering::SeqCst)
        }

        pub fn quote_calls(&self) -> usize {
            self.quote_calls.load(Ordering::SeqCst)
        }

        pub fn orders_created(&self) -> usize {
            self.orders.load(Ordering::SeqCst)
        }

        async fn simulate(&self) -> FetchResult<()> {
            let delay = *self.delay.read();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            match self.failing.read().clone() {
                Some(message) => Err(FetchError::Provider(message)),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl Fetcher for MockFetcher {
        fn name(&self) -> &str {
            &self.name
        }

        async fn get_currencies(&self) -> FetchResult<Vec<Currency>> {
            self.currency_calls.fetch_add(1, Ordering::SeqCst);
            self.simulate().await?;
            let provider = self.name.clone();
            Ok(self
                .currencies
                .read()
                .iter()
                .cloned()
                .map(|c| c.with_provider(provider.clone()))
                .collect())
        }

        async fn get_quote(
            &self,
            from: &NetworkPair,
            to: &NetworkPair,
            amount: Decimal,
        ) -> FetchResult<Option<Quote>> {
            self.quote_calls.fetch_add(1, Ordering::SeqCst);
            self.simulate().await?;
            let key = pair_key(from, to);
            let Some(rate) = self.rates.get(&key).map(|r| *r) else {
                return Ok(None);
            };
            let min = self.min_amounts.get(&key).map(|m| *m);
            Ok(Some(
                Quote::new(&self.name, from.clone(), to.clone(), amount, amount * rate)
                    .with_limits(min, None),
            ))
        }

        async fn get_min_amount(&self, from: &NetworkPair, to: &NetworkPair) -> FetchResult<Decimal> {
            self.simulate().await?;
            self.min_amounts
                .get(&pair_key(from, to))
                .map(|m| *m)
                .ok_or_else(|| FetchError::Unsupported(self.name.clone()))
        }

        async fn create_exchange(&self, request: &SwapRequest) -> FetchResult<SwapResponse> {
            self.simulate().await?;
            let rate = self
                .rates
                .get(&pair_key(&request.from, &request.to))
                .map(|r| *r)
                .ok_or_else(|| FetchError::Provider(format!("pair {} -> {} not offered", request.from, request.to)))?;
            let n = self.orders.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(SwapResponse {
                id: format!("{}-{}", self.name, n),
                status: "waiting".to_string(),
                from: request.from.clone(),
                to: request.to.clone(),
                payin_address: format!("{}-deposit-{}", self.name, n),
                payin_amount: request.amount,
                payout_amount: request.amount * rate,
                payout_address: request.to_address.clone(),
                exchange: self.name.clone(),
                created_at: Utc::now(),
            })
        }

        async fn get_exchange_status(&self, external_id: &str) -> FetchResult<ExchangeStatus> {
            self.simulate().await?;
            Ok(self
                .statuses
                .get(external_id)
                .map(|s| s.clone())
                .unwrap_or(ExchangeStatus::InProgress))
        }
    }

    /// Paged in-memory `PriceFeed`.
    pub struct MockPriceFeed {
        tickers: Vec<Ticker>,
        failing_pages: DashMap<u32, String>,
        calls: AtomicUsize,
    }

    impl MockPriceFeed {
        pub fn new(tickers: Vec<Ticker>) -> Self {
            Self {
                tickers,
                failing_pages: DashMap::new(),
                calls: AtomicUsize::new(0),
            }
        }

        /// Make `page` return an error.
        pub fn fail_page(self, page: u32, message: impl Into<String>) -> Self {
            self.failing_pages.insert(page, message.into());
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PriceFeed for MockPriceFeed {
        async fn top_tickers(&self, _target: &str, page_size: u32, page: u32) -> FetchResult<Vec<Ticker>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(message) = self.failing_pages.get(&page) {
                return Err(FetchError::Provider(message.clone()));
            }
            let size = page_size as usize;
            let start = (page.saturating_sub(1) as usize).saturating_mul(size);
            Ok(self.tickers.iter().skip(start).take(size).cloned().collect())
        }
    }
}
