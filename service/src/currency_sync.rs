//! Background catalog and price synchronization.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, info_span, warn, Instrument};

use swaprail_aggregator::{PriceFeed, QuoteAggregator};
use swaprail_common::{CurrencyCatalog, PriceTracker, RequestId, SwapRailResult};

use crate::config::SyncConfig;
use crate::metrics::SharedMetrics;
use crate::repository::{CurrencyFilters, CurrencyRepository};

/// Why a price run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Every tracked currency received a price.
    AllPriced,
    /// The feed returned an empty page.
    EmptyPage,
    /// `max_pages` pages were requested.
    MaxPages,
    /// Shutdown was signalled mid-run.
    Shutdown,
}

/// Outcome of one catalog run.
#[derive(Debug, Clone)]
pub struct CatalogSyncReport {
    pub request_id: RequestId,
    /// Exchanges that reported currencies.
    pub providers: usize,
    /// Currencies written after merging.
    pub currencies: usize,
}

/// Outcome of one price run.
#[derive(Debug, Clone)]
pub struct PriceSyncReport {
    pub request_id: RequestId,
    /// Pages requested from the feed.
    pub pages: u32,
    /// Pages the feed failed to serve.
    pub failed_pages: u32,
    /// Currencies priced and written.
    pub priced: usize,
    /// Currencies still without a price.
    pub remaining: usize,
    pub stop_reason: StopReason,
}

/// Sleep for `duration` unless shutdown is signalled first.
///
/// Returns `true` on shutdown. A dropped sender counts as shutdown.
pub(crate) async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }

    let sleep = tokio::time::sleep(duration);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    return true;
                }
            }
        }
    }
}

/// Keeps the stored currency catalog and prices fresh.
pub struct CurrencySyncDaemon {
    engine: Arc<QuoteAggregator>,
    feed: Arc<dyn PriceFeed>,
    repository: Arc<dyn CurrencyRepository>,
    config: SyncConfig,
    metrics: SharedMetrics,
}

impl CurrencySyncDaemon {
    pub fn new(
        engine: Arc<QuoteAggregator>,
        feed: Arc<dyn PriceFeed>,
        repository: Arc<dyn CurrencyRepository>,
        config: SyncConfig,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            engine,
            feed,
            repository,
            config,
            metrics,
        }
    }

    /// Start the catalog and price loops.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let catalog = tokio::spawn(Arc::clone(self).run_catalog_loop(shutdown.clone()));
        let prices = tokio::spawn(Arc::clone(self).run_price_loop(shutdown));
        vec![catalog, prices]
    }

    /// Fetch every exchange's currencies, merge them and replace the stored catalog.
    ///
    /// Nothing is written when no exchange answered, so an outage never
    /// empties the catalog.
    pub async fn sync_catalog(&self) -> SwapRailResult<CatalogSyncReport> {
        let request_id = RequestId::new();
        let span = info_span!("catalog_sync", request_id = %request_id);

        async move {
            let reports = self.engine.fetch_currency_reports().await;
            let providers = reports.len();

            if providers == 0 {
                warn!("No exchange reported currencies, keeping stored catalog");
                return Ok(CatalogSyncReport {
                    request_id,
                    providers,
                    currencies: 0,
                });
            }

            let catalog =
                CurrencyCatalog::from_reports(reports.into_iter().flat_map(|(_, currencies)| currencies));
            let currencies = catalog.into_currencies();
            self.repository.insert_currencies(&currencies).await?;
            self.metrics.catalog_synced();

            info!(providers, currencies = currencies.len(), "Catalog synchronized");
            Ok(CatalogSyncReport {
                request_id,
                providers,
                currencies: currencies.len(),
            })
        }
        .instrument(span)
        .await
    }

    /// Page through the price feed until every stored currency is priced.
    ///
    /// Feed and repository errors on a page are logged and the run moves
    /// on to the next page.
    pub async fn sync_prices(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SwapRailResult<PriceSyncReport> {
        let request_id = RequestId::new();
        let span = info_span!("price_sync", request_id = %request_id);

        async move {
            let currencies = self
                .repository
                .get_currencies(&CurrencyFilters::default())
                .await?;
            let mut tracker = PriceTracker::new(currencies);

            let mut pages = 0;
            let mut failed_pages = 0;
            let mut priced = 0;
            let mut stop_reason = StopReason::AllPriced;

            for page in 1..=self.config.max_pages {
                if !tracker.has_pending() {
                    stop_reason = StopReason::AllPriced;
                    break;
                }
                if *shutdown.borrow() {
                    stop_reason = StopReason::Shutdown;
                    break;
                }

                pages += 1;
                match self
                    .feed
                    .top_tickers(&self.config.target_currency, self.config.page_size, page)
                    .await
                {
                    Ok(tickers) if tickers.is_empty() => {
                        stop_reason = StopReason::EmptyPage;
                        break;
                    }
                    Ok(tickers) => {
                        let now = Utc::now();
                        for ticker in &tickers {
                            tracker.record_price(&ticker.symbol, ticker.price, now);
                        }

                        let updated = tracker.take_updated();
                        if !updated.is_empty() {
                            match self.repository.update_prices(&updated).await {
                                Ok(()) => priced += updated.len(),
                                Err(e) => warn!(page, error = %e, "Failed to store prices"),
                            }
                        }
                    }
                    Err(e) => {
                        failed_pages += 1;
                        warn!(page, error = %e, "Price page failed");
                    }
                }

                if !tracker.has_pending() {
                    stop_reason = StopReason::AllPriced;
                    break;
                }
                if page == self.config.max_pages {
                    stop_reason = StopReason::MaxPages;
                    break;
                }
                if sleep_or_shutdown(self.config.page_delay, shutdown).await {
                    stop_reason = StopReason::Shutdown;
                    break;
                }
            }

            self.metrics.prices_synced(priced as u64);

            let report = PriceSyncReport {
                request_id,
                pages,
                failed_pages,
                priced,
                remaining: tracker.pending_count(),
                stop_reason,
            };
            info!(
                pages = report.pages,
                failed_pages = report.failed_pages,
                priced = report.priced,
                remaining = report.remaining,
                stop_reason = ?report.stop_reason,
                "Prices synchronized"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    async fn run_catalog_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.catalog_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.config.catalog_interval.as_secs(), "Catalog sync loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if let Err(e) = self.sync_catalog().await {
                error!(error = %e, "Catalog sync failed");
            }
        }

        info!("Catalog sync loop stopped");
    }

    async fn run_price_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if sleep_or_shutdown(self.config.price_start_delay, &mut shutdown).await {
            info!("Price sync loop stopped before start");
            return;
        }

        let mut ticker = tokio::time::interval(self.config.price_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.config.price_interval.as_secs(), "Price sync loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if let Err(e) = self.sync_prices(&mut shutdown).await {
                error!(error = %e, "Price sync failed");
            }
        }

        info!("Price sync loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::repository::InMemoryRepository;
    use rust_decimal_macros::dec;
    use swaprail_aggregator::{AggregatorConfig, MockFetcher, MockPriceFeed};
    use swaprail_common::{Currency, NetworkPair, Ticker};

    fn fast_config() -> SyncConfig {
        SyncConfig {
            catalog_interval: Duration::from_secs(3600),
            price_interval: Duration::from_secs(3600),
            price_start_delay: Duration::from_millis(1),
            page_delay: Duration::from_millis(1),
            page_size: 2,
            max_pages: 3,
            ..SyncConfig::default()
        }
    }

    fn engine_with(fetchers: Vec<MockFetcher>) -> Arc<QuoteAggregator> {
        let engine = QuoteAggregator::new(AggregatorConfig {
            catalog_timeout: Duration::from_millis(200),
            ..AggregatorConfig::default()
        });
        for fetcher in fetchers {
            engine.add_exchange(Arc::new(fetcher));
        }
        Arc::new(engine)
    }

    fn daemon(
        engine: Arc<QuoteAggregator>,
        feed: Arc<MockPriceFeed>,
        repository: Arc<InMemoryRepository>,
        config: SyncConfig,
    ) -> CurrencySyncDaemon {
        CurrencySyncDaemon::new(engine, feed, repository, config, Arc::new(Metrics::new()))
    }

    fn seeded(symbols: &[&str]) -> Arc<InMemoryRepository> {
        Arc::new(InMemoryRepository::new().with_currencies(
            symbols
                .iter()
                .map(|s| Currency::new(*s, *s).with_network(*s))
                .collect(),
        ))
    }

    fn tickers(symbols: &[&str]) -> Vec<Ticker> {
        symbols
            .iter()
            .map(|s| Ticker::new(s.to_uppercase(), dec!(2), dec!(0)))
            .collect()
    }

    #[tokio::test]
    async fn test_catalog_sync_merges_networks() {
        let engine = engine_with(vec![
            MockFetcher::new("alpha").with_currencies(vec![Currency::new("USDT", "Tether").with_network("eth")]),
            MockFetcher::new("beta").with_currencies(vec![
                Currency::new("usdt", "Tether").with_network("bsc"),
                Currency::new("doge", "Dogecoin").with_network("doge"),
            ]),
        ]);
        let repository = Arc::new(InMemoryRepository::new());
        let daemon = daemon(engine, Arc::new(MockPriceFeed::new(vec![])), Arc::clone(&repository), fast_config());

        let report = daemon.sync_catalog().await.unwrap();
        assert_eq!(report.providers, 2);
        assert_eq!(report.currencies, 2);

        let usdt = repository.currency("usdt").unwrap();
        assert!(usdt.supports(&NetworkPair::new("usdt", "eth")));
        assert!(usdt.supports(&NetworkPair::new("usdt", "bsc")));
        assert!(usdt.popular);
        assert!(!repository.currency("doge").unwrap().popular);
    }

    #[tokio::test]
    async fn test_catalog_sync_keeps_catalog_when_all_fail() {
        let engine = engine_with(vec![MockFetcher::new("alpha").failing("down")]);
        let repository = seeded(&["btc"]);
        let daemon = daemon(engine, Arc::new(MockPriceFeed::new(vec![])), Arc::clone(&repository), fast_config());

        let report = daemon.sync_catalog().await.unwrap();
        assert_eq!(report.providers, 0);
        assert_eq!(repository.catalog_writes(), 0);
        assert_eq!(repository.currency("btc").unwrap().networks.len(), 1);
    }

    #[tokio::test]
    async fn test_price_sync_stops_when_all_priced() {
        let repository = seeded(&["btc", "eth"]);
        let feed = Arc::new(MockPriceFeed::new(tickers(&["btc", "eth", "sol", "ada"])));
        let daemon = daemon(engine_with(vec![]), Arc::clone(&feed), Arc::clone(&repository), fast_config());
        let (_tx, mut rx) = watch::channel(false);

        let report = daemon.sync_prices(&mut rx).await.unwrap();

        assert_eq!(report.stop_reason, StopReason::AllPriced);
        assert_eq!(report.pages, 1);
        assert_eq!(report.priced, 2);
        assert_eq!(feed.calls(), 1);
        assert_eq!(repository.currency("btc").unwrap().price, Some(dec!(2)));
    }

    #[tokio::test]
    async fn test_price_sync_flushes_each_page() {
        let repository = seeded(&["btc", "sol"]);
        let feed = Arc::new(MockPriceFeed::new(tickers(&["btc", "eth", "sol"])));
        let daemon = daemon(engine_with(vec![]), Arc::clone(&feed), Arc::clone(&repository), fast_config());
        let (_tx, mut rx) = watch::channel(false);

        let report = daemon.sync_prices(&mut rx).await.unwrap();

        assert_eq!(report.stop_reason, StopReason::AllPriced);
        assert_eq!(report.pages, 2);
        assert_eq!(repository.price_updates(), 2);
    }

    #[tokio::test]
    async fn test_price_sync_stops_at_max_pages() {
        let repository = seeded(&["unlisted"]);
        let feed = Arc::new(MockPriceFeed::new(tickers(&["a", "b", "c", "d", "e", "f", "g", "h"])));
        let daemon = daemon(engine_with(vec![]), Arc::clone(&feed), Arc::clone(&repository), fast_config());
        let (_tx, mut rx) = watch::channel(false);

        let report = daemon.sync_prices(&mut rx).await.unwrap();

        assert_eq!(report.stop_reason, StopReason::MaxPages);
        assert_eq!(report.pages, 3);
        assert_eq!(report.remaining, 1);
        assert_eq!(feed.calls(), 3);
    }

    #[tokio::test]
    async fn test_price_sync_stops_on_empty_page() {
        let repository = seeded(&["unlisted"]);
        let feed = Arc::new(MockPriceFeed::new(tickers(&["a", "b"])));
        let daemon = daemon(engine_with(vec![]), Arc::clone(&feed), Arc::clone(&repository), fast_config());
        let (_tx, mut rx) = watch::channel(false);

        let report = daemon.sync_prices(&mut rx).await.unwrap();

        assert_eq!(report.stop_reason, StopReason::EmptyPage);
        assert_eq!(feed.calls(), 2);
    }

    #[tokio::test]
    async fn test_price_sync_skips_failed_page() {
        let repository = seeded(&["sol"]);
        let feed = Arc::new(MockPriceFeed::new(tickers(&["btc", "eth", "sol"])).fail_page(1, "rate limited"));
        let daemon = daemon(engine_with(vec![]), Arc::clone(&feed), Arc::clone(&repository), fast_config());
        let (_tx, mut rx) = watch::channel(false);

        let report = daemon.sync_prices(&mut rx).await.unwrap();

        assert_eq!(report.failed_pages, 1);
        assert_eq!(report.priced, 1);
        assert_eq!(report.stop_reason, StopReason::AllPriced);
    }

    #[tokio::test]
    async fn test_price_sync_stops_on_shutdown() {
        let repository = seeded(&["unlisted"]);
        let feed = Arc::new(MockPriceFeed::new(tickers(&["a", "b", "c", "d"])));
        let config = SyncConfig {
            page_delay: Duration::from_secs(30),
            ..fast_config()
        };
        let daemon = daemon(engine_with(vec![]), Arc::clone(&feed), repository, config);
        let (tx, mut rx) = watch::channel(false);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = tx.send(true);
        });

        let report = tokio::time::timeout(Duration::from_secs(2), daemon.sync_prices(&mut rx))
            .await
            .expect("price run should stop on shutdown")
            .unwrap();
        assert_eq!(report.stop_reason, StopReason::Shutdown);
        assert_eq!(feed.calls(), 1);
    }

    #[tokio::test]
    async fn test_price_sync_fails_when_repository_fails() {
        let repository = seeded(&["btc"]);
        repository.set_failing(Some("connection refused"));
        let feed = Arc::new(MockPriceFeed::new(tickers(&["btc"])));
        let daemon = daemon(engine_with(vec![]), Arc::clone(&feed), repository, fast_config());
        let (_tx, mut rx) = watch::channel(false);

        assert!(daemon.sync_prices(&mut rx).await.is_err());
        assert_eq!(feed.calls(), 0);
    }

    #[tokio::test]
    async fn test_loops_run_and_stop_on_shutdown() {
        let engine = engine_with(vec![
            MockFetcher::new("alpha").with_currencies(vec![Currency::new("btc", "Bitcoin").with_network("btc")]),
        ]);
        let repository = Arc::new(InMemoryRepository::new());
        let feed = Arc::new(MockPriceFeed::new(tickers(&["btc"])));
        let daemon = Arc::new(daemon(engine, Arc::clone(&feed), Arc::clone(&repository), fast_config()));
        let (tx, rx) = watch::channel(false);

        let tasks = daemon.spawn(rx);

        for _ in 0..200 {
            if repository.catalog_writes() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(repository.catalog_writes(), 1);

        tx.send(true).unwrap();
        for task in tasks {
            tokio::time::timeout(Duration::from_secs(1), task)
                .await
                .expect("loop should stop on shutdown")
                .unwrap();
        }
    }
}
