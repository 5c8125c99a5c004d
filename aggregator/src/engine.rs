//! Quote aggregation engine.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use swaprail_common::time::constants;
use swaprail_common::{
    is_popular_symbol, rank_quotes, Currency, ExchangeStatus, NetworkPair, Quote, SwapRequest,
    SwapResponse,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheStats, TtlCache};
use crate::error::{AggregatorError, AggregatorResult, FetchError, FetchResult};
use crate::fetcher::Fetcher;

const POPULAR_KEY: &str = "currencies_popular";
const OTHERS_KEY: &str = "currencies_others";

/// Configuration for the aggregation engine.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Lifetime of cached currency listings.
    pub catalog_ttl: Duration,
    /// Lifetime of cached quote lists.
    pub quote_ttl: Duration,
    /// Bound on each exchange call in a quote, min-amount or order fan-out.
    pub exchange_timeout: Duration,
    /// Bound on each `get_currencies` call.
    pub catalog_timeout: Duration,
    /// How often expired cache entries are swept.
    pub sweep_interval: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            catalog_ttl: constants::catalog_ttl(),
            quote_ttl: constants::quote_ttl(),
            exchange_timeout: constants::exchange_timeout(),
            catalog_timeout: constants::catalog_fetch_timeout(),
            sweep_interval: constants::sweep_interval(),
        }
    }
}

impl AggregatorConfig {
    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.exchange_timeout.is_zero() {
            return Err("exchange_timeout must be positive".to_string());
        }
        if self.catalog_timeout.is_zero() {
            return Err("catalog_timeout must be positive".to_string());
        }
        if self.sweep_interval.is_zero() {
            return Err("sweep_interval must be positive".to_string());
        }
        Ok(())
    }
}

/// Values stored in the engine cache.
#[derive(Debug, Clone)]
enum CachedValue {
    Currencies(Arc<[Currency]>),
    Quotes(Arc<[Quote]>),
}

/// Currency listing split by the popular allow-list.
///
/// Each entry is restricted to a single network and both lists are ordered
/// by symbol, then network.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CurrencyBuckets {
    pub popular: Vec<Currency>,
    pub others: Vec<Currency>,
}

/// Engine statistics.
#[derive(Debug, Clone)]
pub struct AggregatorStats {
    pub exchanges: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache: CacheStats,
}

/// Queries every registered exchange concurrently and ranks the results.
pub struct QuoteAggregator {
    fetchers: RwLock<BTreeMap<String, Arc<dyn Fetcher>>>,
    cache: Arc<TtlCache<CachedValue>>,
    config: AggregatorConfig,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl QuoteAggregator {
    /// Create an engine with no exchanges registered.
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            fetchers: RwLock::new(BTreeMap::new()),
            cache: Arc::new(TtlCache::new()),
            config,
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Start the background cache sweeper.
    pub fn spawn_cache_sweeper(&self) -> JoinHandle<()> {
        self.cache.spawn_sweeper(self.config.sweep_interval)
    }

    /// Register an exchange. Returns `false` if the name is already taken.
    pub fn add_exchange(&self, fetcher: Arc<dyn Fetcher>) -> bool {
        let name = fetcher.name().to_string();
        let mut fetchers = self.fetchers.write();
        if fetchers.contains_key(&name) {
            warn!(exchange = %name, "Exchange already registered, ignoring");
            return false;
        }
        info!(exchange = %name, "Registered exchange");
        fetchers.insert(name, fetcher);
        true
    }

    /// Registered exchange names, sorted.
    pub fn exchanges(&self) -> Vec<String> {
        self.fetchers.read().keys().cloned().collect()
    }

    pub fn exchange(&self, name: &str) -> Option<Arc<dyn Fetcher>> {
        self.fetchers.read().get(name).cloned()
    }

    /// Every currency any exchange offers, split into popular and other.
    #[instrument(skip(self))]
    pub async fn get_all_currencies(&self) -> CurrencyBuckets {
        if let (Some(CachedValue::Currencies(popular)), Some(CachedValue::Currencies(others))) =
            (self.cache.get(POPULAR_KEY), self.cache.get(OTHERS_KEY))
        {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!("Using cached currency listing");
            return CurrencyBuckets {
                popular: popular.to_vec(),
                others: others.to_vec(),
            };
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        let reports = self.fetch_currency_reports().await;

        let mut popular: BTreeMap<(String, String), Currency> = BTreeMap::new();
        let mut others: BTreeMap<(String, String), Currency> = BTreeMap::new();

        // Reports arrive in exchange-name order, which fixes merge precedence.
        for (_, currencies) in reports {
            for currency in currencies {
                let is_popular = is_popular_symbol(&currency.symbol);
                let bucket = if is_popular { &mut popular } else { &mut others };
                for pair in &currency.networks {
                    let mut entry = currency.on_network(pair);
                    entry.popular = is_popular;
                    match bucket.get_mut(&pair.display_key()) {
                        Some(existing) => existing.merge(entry),
                        None => {
                            bucket.insert(pair.display_key(), entry);
                        }
                    }
                }
            }
        }

        let buckets = CurrencyBuckets {
            popular: popular.into_values().collect(),
            others: others.into_values().collect(),
        };

        let ttl = self.config.catalog_ttl;
        self.cache.set(
            POPULAR_KEY,
            CachedValue::Currencies(buckets.popular.clone().into()),
            ttl,
        );
        self.cache.set(
            OTHERS_KEY,
            CachedValue::Currencies(buckets.others.clone().into()),
            ttl,
        );

        info!(
            popular = buckets.popular.len(),
            others = buckets.others.len(),
            "Refreshed currency listing"
        );

        buckets
    }

    /// Raw currency reports from every exchange, bypassing the cache.
    ///
    /// Reports come back grouped by exchange name; exchanges that fail or
    /// time out are skipped.
    #[instrument(skip(self))]
    pub async fn fetch_currency_reports(&self) -> Vec<(String, Vec<Currency>)> {
        self.fan_out("get_currencies", self.config.catalog_timeout, |fetcher| async move {
            fetcher.get_currencies().await
        })
        .await
    }

    /// Quotes from every exchange that can serve the pair, best first.
    #[instrument(skip(self, from, to), fields(from = %from, to = %to))]
    pub async fn get_all_quotes(
        &self,
        from: &NetworkPair,
        to: &NetworkPair,
        amount: Decimal,
    ) -> Vec<Quote> {
        if from == to {
            return Vec::new();
        }

        let key = Self::quote_key(from, to, amount);
        if let Some(CachedValue::Quotes(quotes)) = self.cache.get(&key) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!("Using cached quotes");
            return quotes.to_vec();
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        let (from_pair, to_pair) = (from.clone(), to.clone());
        let results = self
            .fan_out("get_quote", self.config.exchange_timeout, move |fetcher| {
                let (from, to) = (from_pair.clone(), to_pair.clone());
                async move { fetcher.get_quote(&from, &to, amount).await }
            })
            .await;

        let quotes = rank_quotes(results.into_iter().filter_map(|(name, quote)| {
            if quote.is_none() {
                debug!(exchange = %name, "Pair not supported");
            }
            quote
        }));

        if !quotes.is_empty() {
            self.cache.set(
                key,
                CachedValue::Quotes(quotes.clone().into()),
                self.config.quote_ttl,
            );
        }

        info!(count = quotes.len(), "Aggregated quotes");
        quotes
    }

    /// The single best quote for the pair.
    pub async fn get_best_quote(
        &self,
        from: &NetworkPair,
        to: &NetworkPair,
        amount: Decimal,
    ) -> AggregatorResult<Quote> {
        self.get_all_quotes(from, to, amount)
            .await
            .into_iter()
            .next()
            .ok_or_else(|| AggregatorError::NoQuotes {
                from: from.clone(),
                to: to.clone(),
            })
    }

    /// Minimum accepted amount per exchange. Exchanges that fail are omitted.
    #[instrument(skip(self, from, to), fields(from = %from, to = %to))]
    pub async fn get_min_amounts(
        &self,
        from: &NetworkPair,
        to: &NetworkPair,
    ) -> BTreeMap<String, Decimal> {
        let (from_pair, to_pair) = (from.clone(), to.clone());
        self.fan_out("get_min_amount", self.config.exchange_timeout, move |fetcher| {
            let (from, to) = (from_pair.clone(), to_pair.clone());
            async move { fetcher.get_min_amount(&from, &to).await }
        })
        .await
        .into_iter()
        .collect()
    }

    /// Create an order on the exchange named in the request.
    #[instrument(skip(self, request), fields(exchange = %request.exchange))]
    pub async fn create_exchange(&self, request: &SwapRequest) -> AggregatorResult<SwapResponse> {
        let fetcher = self
            .exchange(&request.exchange)
            .ok_or_else(|| AggregatorError::ExchangeNotFound(request.exchange.clone()))?;

        let mut response = self
            .call_one(&request.exchange, "create_exchange", fetcher.create_exchange(request))
            .await?;
        response.exchange = fetcher.name().to_string();

        info!(external_id = %response.id, "Created exchange order");
        Ok(response)
    }

    /// Current state of an order on `exchange`.
    #[instrument(skip(self))]
    pub async fn get_exchange_status(
        &self,
        exchange: &str,
        external_id: &str,
    ) -> AggregatorResult<ExchangeStatus> {
        let fetcher = self
            .exchange(exchange)
            .ok_or_else(|| AggregatorError::ExchangeNotFound(exchange.to_string()))?;

        self.call_one(exchange, "get_exchange_status", fetcher.get_exchange_status(external_id))
            .await
    }

    /// Get engine statistics.
    pub fn stats(&self) -> AggregatorStats {
        AggregatorStats {
            exchanges: self.fetchers.read().len(),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache: self.cache.stats(),
        }
    }

    /// Drop every cached listing and quote list.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    fn quote_key(from: &NetworkPair, to: &NetworkPair, amount: Decimal) -> String {
        format!("quotes_{}_{}_{:.8}", from, to, amount)
    }

    /// Run `call` against every exchange on its own task.
    ///
    /// Each task is bounded by `timeout` and aborted when it runs over.
    /// Failures and timeouts are logged and left out of the result, which is
    /// ordered by exchange name.
    async fn fan_out<T, F, Fut>(
        &self,
        operation: &'static str,
        timeout: Duration,
        call: F,
    ) -> Vec<(String, T)>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn Fetcher>) -> Fut,
        Fut: Future<Output = FetchResult<T>> + Send + 'static,
    {
        let fetchers: Vec<Arc<dyn Fetcher>> = self.fetchers.read().values().cloned().collect();

        let calls = fetchers.into_iter().map(|fetcher| {
            let name = fetcher.name().to_string();
            let mut handle = tokio::spawn(call(fetcher));
            async move {
                match tokio::time::timeout(timeout, &mut handle).await {
                    Ok(Ok(Ok(value))) => Some((name, value)),
                    Ok(Ok(Err(e))) => {
                        warn!(exchange = %name, operation, error = %e, "Exchange call failed");
                        None
                    }
                    Ok(Err(e)) => {
                        warn!(exchange = %name, operation, error = %e, "Exchange task panicked");
                        None
                    }
                    Err(_) => {
                        handle.abort();
                        warn!(
                            exchange = %name,
                            operation,
                            timeout_ms = timeout.as_millis() as u64,
                            "Exchange call timed out"
                        );
                        None
                    }
                }
            }
        });

        join_all(calls).await.into_iter().flatten().collect()
    }

    async fn call_one<T>(
        &self,
        exchange: &str,
        operation: &'static str,
        call: impl Future<Output = FetchResult<T>>,
    ) -> AggregatorResult<T> {
        let result = match tokio::time::timeout(self.config.exchange_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(operation.to_string())),
        };
        result.map_err(|source| AggregatorError::Provider {
            exchange: exchange.to_string(),
            source,
        })
    }
}

impl Default for QuoteAggregator {
    fn default() -> Self {
        Self::new(AggregatorConfig::default())
    }
}
