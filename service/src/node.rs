//! The SwapRail node: builds every component and runs the background work.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, instrument, warn};

use swaprail_aggregator::{PriceFeed, QuoteAggregator};
use swaprail_common::{SwapRailError, SwapRailResult};
use swaprail_messaging::{AmqpTransport, BrokerConnection};

use crate::coingecko::CoinGeckoFeed;
use crate::config::ServiceConfig;
use crate::consumer::SwapConsumer;
use crate::currency_sync::CurrencySyncDaemon;
use crate::metrics::{Metrics, MetricsSnapshot, SharedMetrics};
use crate::notifier::{messaging_err, BrokerNotifier};
use crate::postgres::PgRepository;
use crate::quote_service::QuoteService;
use crate::repository::{CurrencyRepository, SwapRepository};
use crate::state::NodeState;
use crate::swap_service::SwapService;

/// Bound on waiting for background tasks during `stop`.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Collaborators the node is assembled from.
pub struct NodeParts {
    pub engine: Arc<QuoteAggregator>,
    pub feed: Arc<dyn PriceFeed>,
    pub currencies: Arc<dyn CurrencyRepository>,
    pub swaps: Arc<dyn SwapRepository>,
    pub broker: BrokerConnection,
}

/// A running SwapRail node.
pub struct SwapRail {
    config: ServiceConfig,
    state: Arc<RwLock<NodeState>>,
    engine: Arc<QuoteAggregator>,
    broker: BrokerConnection,
    metrics: SharedMetrics,
    quotes: Arc<QuoteService>,
    swaps: Arc<SwapService>,
    daemon: Option<Arc<CurrencySyncDaemon>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SwapRail {
    /// Connect to Postgres, the broker and CoinGecko, and build the node.
    ///
    /// Exchange adapters are registered afterwards through [`SwapRail::engine`].
    #[instrument(skip_all)]
    pub async fn connect(config: ServiceConfig) -> SwapRailResult<Self> {
        let repository = Arc::new(PgRepository::connect(&config.database_url).await?);
        repository.apply_schema().await?;
        info!("Database ready");

        let broker = BrokerConnection::connect(config.messaging.clone(), Arc::new(AmqpTransport::new()))
            .await
            .map_err(messaging_err)?;
        info!("Broker connected");

        let parts = NodeParts {
            engine: Arc::new(QuoteAggregator::new(config.aggregator.clone())),
            feed: Arc::new(CoinGeckoFeed::new(&config.coingecko)),
            currencies: repository.clone(),
            swaps: repository,
            broker,
        };

        Ok(Self::new(config, parts))
    }

    /// Build the node from already-connected collaborators.
    pub fn new(config: ServiceConfig, parts: NodeParts) -> Self {
        let NodeParts {
            engine,
            feed,
            currencies,
            swaps,
            broker,
        } = parts;

        let metrics: SharedMetrics = Arc::new(Metrics::new());
        let (shutdown_tx, _) = watch::channel(false);

        let quotes = Arc::new(QuoteService::new(
            Arc::clone(&engine),
            Arc::clone(&currencies),
            config.price_staleness,
            Arc::clone(&metrics),
        ));

        let notifier = Arc::new(BrokerNotifier::new(
            Arc::new(broker.clone()),
            config.swap_routing_key.clone(),
        ));
        let swap_service = Arc::new(SwapService::new(
            Arc::clone(&engine),
            Arc::clone(&currencies),
            swaps,
            notifier,
            Arc::clone(&metrics),
        ));

        let daemon = config.daemon_enabled.then(|| {
            Arc::new(CurrencySyncDaemon::new(
                Arc::clone(&engine),
                feed,
                currencies,
                config.sync.clone(),
                Arc::clone(&metrics),
            ))
        });

        Self {
            config,
            state: Arc::new(RwLock::new(NodeState::Starting)),
            engine,
            broker,
            metrics,
            quotes,
            swaps: swap_service,
            daemon,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            sweeper: Mutex::new(None),
        }
    }

    /// Start the cache sweeper, the sync daemon, the swap consumer and the
    /// metrics reporter.
    #[instrument(skip(self))]
    pub async fn start(&self) -> SwapRailResult<()> {
        {
            let mut state = self.state.write();
            if *state != NodeState::Starting {
                return Err(SwapRailError::Internal(format!(
                    "cannot start node in state {:?}",
                    *state
                )));
            }
            *state = NodeState::Running;
        }
        info!(daemon_enabled = self.daemon.is_some(), "Starting SwapRail node");

        *self.sweeper.lock() = Some(self.engine.spawn_cache_sweeper());

        let mut tasks = Vec::new();
        if let Some(daemon) = &self.daemon {
            tasks.extend(daemon.spawn(self.shutdown_tx.subscribe()));
        }

        let consumer = Arc::new(SwapConsumer::new(
            Arc::clone(&self.swaps),
            self.config.swap_retry.clone(),
        ));
        match self.broker.consume(consumer, self.shutdown_tx.subscribe()).await {
            Ok(consumers) => tasks.extend(consumers),
            Err(e) => {
                *self.state.write() = NodeState::Stopped;
                let _ = self.shutdown_tx.send(true);
                return Err(messaging_err(e));
            }
        }

        tasks.push(tokio::spawn(report_metrics(
            Arc::clone(&self.metrics),
            Arc::clone(&self.engine),
            self.broker.clone(),
            self.config.metrics_interval,
            self.shutdown_tx.subscribe(),
        )));

        self.tasks.lock().extend(tasks);
        info!("SwapRail node started");
        Ok(())
    }

    /// Signal shutdown, wait for background work and close the broker.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> SwapRailResult<()> {
        {
            let mut state = self.state.write();
            if matches!(*state, NodeState::ShuttingDown | NodeState::Stopped) {
                return Ok(());
            }
            *state = NodeState::ShuttingDown;
        }
        info!("Stopping SwapRail node");

        let _ = self.shutdown_tx.send(true);

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        if tokio::time::timeout(DRAIN_TIMEOUT, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            warn!(timeout_secs = DRAIN_TIMEOUT.as_secs(), "Background tasks did not stop in time");
        }

        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }

        if let Err(e) = self.broker.close().await {
            warn!(error = %e, "Error closing broker connection");
        }

        self.metrics_snapshot().log();
        *self.state.write() = NodeState::Stopped;
        info!("SwapRail node stopped");
        Ok(())
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// The aggregation engine, for registering exchange adapters.
    pub fn engine(&self) -> &Arc<QuoteAggregator> {
        &self.engine
    }

    pub fn quotes(&self) -> &Arc<QuoteService> {
        &self.quotes
    }

    pub fn swaps(&self) -> &Arc<SwapService> {
        &self.swaps
    }

    pub fn daemon(&self) -> Option<&Arc<CurrencySyncDaemon>> {
        self.daemon.as_ref()
    }

    /// Node counters together with engine cache and consumer figures.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        snapshot(&self.metrics, &self.engine, &self.broker)
    }
}

fn snapshot(metrics: &Metrics, engine: &QuoteAggregator, broker: &BrokerConnection) -> MetricsSnapshot {
    let stats = engine.stats();
    let consumers = broker.consumer_stats();
    MetricsSnapshot {
        quote_cache_hits: stats.cache_hits,
        quote_cache_misses: stats.cache_misses,
        messages_acked: consumers.acked,
        messages_requeued: consumers.requeued,
        ..metrics.snapshot()
    }
}

async fn report_metrics(
    metrics: SharedMetrics,
    engine: Arc<QuoteAggregator>,
    broker: BrokerConnection,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => snapshot(&metrics, &engine, &broker).log(),
            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use swaprail_aggregator::{AggregatorConfig, MockFetcher, MockPriceFeed};
    use swaprail_common::{Currency, ExchangeStatus, NetworkPair, SwapRequest, SwapStatus, Ticker};
    use swaprail_messaging::{ConnectionState, MemoryBroker, MessagingConfig};

    use crate::config::{SwapRetryConfig, SyncConfig};
    use crate::repository::InMemoryRepository;

    const ROUTING_KEY: &str = "swaprail.swap";
    const QUEUE: &str = "swaprail.swaps";

    struct Harness {
        node: SwapRail,
        broker: MemoryBroker,
        fetcher: Arc<MockFetcher>,
        repository: Arc<InMemoryRepository>,
    }

    fn test_config(daemon_enabled: bool) -> ServiceConfig {
        ServiceConfig {
            daemon_enabled,
            swap_routing_key: ROUTING_KEY.to_string(),
            metrics_interval: Duration::from_millis(50),
            sync: SyncConfig {
                catalog_interval: Duration::from_secs(3600),
                price_interval: Duration::from_secs(3600),
                price_start_delay: Duration::from_millis(100),
                page_delay: Duration::from_millis(1),
                ..SyncConfig::default()
            },
            swap_retry: SwapRetryConfig {
                delay: Duration::from_millis(20),
                max_delay: Duration::from_millis(100),
            },
            messaging: MessagingConfig {
                queues: vec![QUEUE.to_string()],
                handler_timeout: Duration::from_millis(500),
                confirm_timeout: Duration::from_millis(100),
                ..MessagingConfig::default()
            },
            ..ServiceConfig::default()
        }
    }

    async fn harness(daemon_enabled: bool) -> Harness {
        let broker = MemoryBroker::new();
        broker.bind(ROUTING_KEY, QUEUE);
        let config = test_config(daemon_enabled);
        let connection = BrokerConnection::connect(config.messaging.clone(), Arc::new(broker.clone()))
            .await
            .unwrap();

        let btc = NetworkPair::new("btc", "btc");
        let usdt = NetworkPair::new("usdt", "eth");
        let fetcher = Arc::new(
            MockFetcher::new("alpha")
                .with_currencies(vec![
                    Currency::new("btc", "Bitcoin").with_network("btc"),
                    Currency::new("usdt", "Tether").with_network("eth"),
                ])
                .with_rate(&btc, &usdt, dec!(64000)),
        );
        let engine = Arc::new(QuoteAggregator::new(AggregatorConfig::default()));
        engine.add_exchange(fetcher.clone());

        let repository = Arc::new(InMemoryRepository::new());
        let feed = Arc::new(MockPriceFeed::new(vec![
            Ticker::new("BTC", dec!(64000), dec!(1.5)),
            Ticker::new("USDT", dec!(1), dec!(0)),
        ]));

        let node = SwapRail::new(
            config,
            NodeParts {
                engine,
                feed,
                currencies: repository.clone(),
                swaps: repository.clone(),
                broker: connection,
            },
        );

        Harness {
            node,
            broker,
            fetcher,
            repository,
        }
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..300 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_start_stop() {
        let h = harness(false).await;
        assert_eq!(h.node.state(), NodeState::Starting);
        assert!(h.node.daemon().is_none());

        h.node.start().await.unwrap();
        assert!(h.node.is_running());

        h.node.stop().await.unwrap();
        assert_eq!(h.node.state(), NodeState::Stopped);
        assert_eq!(h.broker.connects(), 1);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let h = harness(false).await;
        h.node.start().await.unwrap();
        assert!(h.node.start().await.is_err());
        h.node.stop().await.unwrap();
        // Stopping again is a no-op.
        h.node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_swap_flows_from_catalog_to_completion() {
        let h = harness(true).await;
        h.node.start().await.unwrap();

        wait_for(|| h.repository.currency("usdt").is_some()).await;
        wait_for(|| {
            h.repository
                .currency("btc")
                .and_then(|c| c.price)
                .is_some()
        })
        .await;

        h.fetcher.set_status(
            "alpha-1",
            ExchangeStatus::Finished {
                payout_amount: Some(dec!(31990)),
            },
        );
        let swap = h
            .node
            .swaps()
            .create_swap(SwapRequest {
                from: NetworkPair::new("btc", "btc"),
                to: NetworkPair::new("usdt", "eth"),
                amount: dec!(0.5),
                to_address: "0xdestination".to_string(),
                refund_address: "bc1qrefund".to_string(),
                exchange: "alpha".to_string(),
            })
            .await
            .unwrap();

        wait_for(|| h.broker.acked() == 1).await;
        let stored = h.node.swaps().get_swap(&swap.id).await.unwrap();
        assert_eq!(stored.status, SwapStatus::Completed);

        let quotes = h
            .node
            .quotes()
            .get_quotes(&NetworkPair::new("btc", "btc"), &NetworkPair::new("usdt", "eth"), dec!(1))
            .await
            .unwrap();
        assert_eq!(quotes.len(), 1);
        assert_eq!(quotes[0].difference, Some(dec!(0)));

        h.node.stop().await.unwrap();

        let snapshot = h.node.metrics_snapshot();
        assert_eq!(snapshot.swaps_created, 1);
        assert_eq!(snapshot.swaps_completed, 1);
        assert_eq!(snapshot.messages_acked, 1);
        assert!(snapshot.catalog_syncs >= 1);
        assert_eq!(snapshot.quotes_requested, 1);
    }

    #[tokio::test]
    async fn test_stop_closes_broker() {
        let h = harness(true).await;
        h.node.start().await.unwrap();
        h.node.stop().await.unwrap();

        let err = h.node.swaps().get_swap(&swaprail_common::SwapId::new()).await.unwrap_err();
        assert!(matches!(err, SwapRailError::NotFound(_)));
        assert_eq!(h.node.broker.state(), ConnectionState::Closed);
    }
}
