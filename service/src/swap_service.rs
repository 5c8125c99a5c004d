//! Swap creation and status processing.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use swaprail_aggregator::QuoteAggregator;
use swaprail_common::{
    ExchangeStatus, Swap, SwapId, SwapRailError, SwapRailResult, SwapRequest, SwapStatus,
};

use crate::metrics::SharedMetrics;
use crate::notifier::SwapNotifier;
use crate::repository::{CurrencyRepository, SwapRepository};

/// Creates swaps on exchanges and drives them to a terminal state.
pub struct SwapService {
    engine: Arc<QuoteAggregator>,
    currencies: Arc<dyn CurrencyRepository>,
    swaps: Arc<dyn SwapRepository>,
    notifier: Arc<dyn SwapNotifier>,
    metrics: SharedMetrics,
}

impl SwapService {
    pub fn new(
        engine: Arc<QuoteAggregator>,
        currencies: Arc<dyn CurrencyRepository>,
        swaps: Arc<dyn SwapRepository>,
        notifier: Arc<dyn SwapNotifier>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            engine,
            currencies,
            swaps,
            notifier,
            metrics,
        }
    }

    /// Validate the request, place the order, store the swap as pending and
    /// hand it off for processing.
    #[instrument(skip(self, request), fields(from = %request.from, to = %request.to, exchange = %request.exchange))]
    pub async fn create_swap(&self, request: SwapRequest) -> SwapRailResult<Swap> {
        request.validate()?;

        let known = self
            .currencies
            .get_currencies_by_pairs(&[request.from.clone(), request.to.clone()])
            .await?;
        if !known.iter().any(|c| c.supports(&request.from)) {
            return Err(SwapRailError::NotFound(format!("currency {}", request.from)));
        }
        let destination = known
            .iter()
            .find(|c| c.supports(&request.to))
            .ok_or_else(|| SwapRailError::NotFound(format!("currency {}", request.to)))?;
        destination.validate_address(&request.to_address)?;

        let order = self.engine.create_exchange(&request).await?;
        let swap = Swap::from_order(&request, &order);

        self.swaps.insert_swap(&swap).await?;
        self.metrics.swap_created();
        info!(swap_id = %swap.id, external_id = %swap.exchange_id, "Swap created");

        self.notifier.notify_swap(&swap).await?;
        self.metrics.notification_sent();

        Ok(swap)
    }

    pub async fn get_swap(&self, id: &SwapId) -> SwapRailResult<Swap> {
        self.swaps.get_swap(id).await
    }

    /// Poll the exchange for a swap and record a terminal outcome.
    ///
    /// Swaps already completed or failed are returned unchanged, so a
    /// redelivered message never applies its transition twice. When two
    /// deliveries race, only the first write lands and the loser returns the
    /// stored swap. A swap the exchange is still working on yields
    /// `SwapInProgress`.
    #[instrument(skip(self, swap), fields(swap_id = %swap.id))]
    pub async fn process_swap(&self, swap: Swap) -> SwapRailResult<Swap> {
        let mut current = match self.swaps.get_swap(&swap.id).await {
            Ok(stored) => stored,
            Err(SwapRailError::NotFound(_)) => {
                warn!("Swap not stored, processing message copy");
                swap
            }
            Err(e) => return Err(e),
        };

        if current.is_terminal() {
            debug!(status = current.status.as_str(), "Swap already settled");
            return Ok(current);
        }

        let status = self
            .engine
            .get_exchange_status(&current.exchange, &current.exchange_id)
            .await?;

        match status {
            ExchangeStatus::InProgress => {
                return Err(SwapRailError::SwapInProgress(current.id.to_string()));
            }
            ExchangeStatus::Finished { payout_amount } => current.complete(payout_amount)?,
            ExchangeStatus::Failed { reason } => current.fail(reason)?,
        }

        if !self.swaps.update_swap(&current).await? {
            let stored = self.swaps.get_swap(&current.id).await?;
            debug!(status = stored.status.as_str(), "Swap settled by another delivery");
            return Ok(stored);
        }

        match current.status {
            SwapStatus::Completed => {
                self.metrics.swap_completed();
                info!(payout_amount = %current.payout_amount, "Swap completed");
            }
            _ => {
                self.metrics.swap_failed();
                warn!(reason = current.reason.as_deref().unwrap_or_default(), "Swap failed");
            }
        }

        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::notifier::RecordingNotifier;
    use crate::repository::InMemoryRepository;
    use rust_decimal_macros::dec;
    use swaprail_aggregator::{AggregatorConfig, MockFetcher};
    use std::time::Duration;
    use swaprail_common::{Currency, ErrorKind, NetworkPair};
    use tokio_test::{assert_err, assert_ok};

    struct Fixture {
        service: SwapService,
        fetcher: Arc<MockFetcher>,
        repository: Arc<InMemoryRepository>,
        notifier: Arc<RecordingNotifier>,
        metrics: Arc<Metrics>,
    }

    fn btc() -> NetworkPair {
        NetworkPair::new("btc", "btc")
    }

    fn usdt() -> NetworkPair {
        NetworkPair::new("usdt", "eth")
    }

    fn fixture() -> Fixture {
        let fetcher = Arc::new(MockFetcher::new("alpha").with_rate(&btc(), &usdt(), dec!(64000)));
        let engine = QuoteAggregator::new(AggregatorConfig::default());
        engine.add_exchange(fetcher.clone());

        let repository = Arc::new(InMemoryRepository::new().with_currencies(vec![
            Currency::new("btc", "Bitcoin").with_network("btc"),
            Currency::new("usdt", "Tether")
                .with_network("eth")
                .with_address_validation("^0x[0-9a-fA-F]{40}$"),
        ]));
        let notifier = Arc::new(RecordingNotifier::new());
        let metrics = Arc::new(Metrics::new());

        let service = SwapService::new(
            Arc::new(engine),
            repository.clone(),
            repository.clone(),
            notifier.clone(),
            metrics.clone(),
        );

        Fixture {
            service,
            fetcher,
            repository,
            notifier,
            metrics,
        }
    }

    fn request() -> SwapRequest {
        SwapRequest {
            from: btc(),
            to: usdt(),
            amount: dec!(0.5),
            to_address: format!("0x{}", "a".repeat(40)),
            refund_address: "bc1qrefund".to_string(),
            exchange: "alpha".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_swap() {
        let f = fixture();

        let swap = assert_ok!(f.service.create_swap(request()).await);

        assert_eq!(swap.status, SwapStatus::Pending);
        assert_eq!(swap.exchange_id, "alpha-1");
        assert_eq!(swap.payin_address, "alpha-deposit-1");
        assert_eq!(swap.payout_amount, dec!(32000));
        assert_eq!(f.repository.swaps(), vec![swap.clone()]);
        assert_eq!(f.notifier.notified(), vec![swap]);
        assert_eq!(f.metrics.snapshot().swaps_created, 1);
    }

    #[tokio::test]
    async fn test_create_swap_rejects_bad_address() {
        let f = fixture();
        let mut request = request();
        request.to_address = "not-an-address".to_string();

        let err = f.service.create_swap(request).await.unwrap_err();

        assert!(matches!(err, SwapRailError::Validation { ref field, .. } if field.as_deref() == Some("to_address")));
        assert_eq!(f.fetcher.orders_created(), 0);
        assert!(f.repository.swaps().is_empty());
    }

    #[tokio::test]
    async fn test_create_swap_requires_known_pairs() {
        let f = fixture();
        let mut request = request();
        request.to = NetworkPair::new("usdt", "trx");

        let err = f.service.create_swap(request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(f.fetcher.orders_created(), 0);
    }

    #[tokio::test]
    async fn test_create_swap_validates_request() {
        let f = fixture();
        let mut request = request();
        request.amount = dec!(0);

        let err = f.service.create_swap(request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Client);
    }

    #[tokio::test]
    async fn test_create_swap_unknown_exchange() {
        let f = fixture();
        let mut request = request();
        request.exchange = "nowhere".to_string();

        let err = f.service.create_swap(request).await.unwrap_err();
        assert!(matches!(err, SwapRailError::ExchangeNotFound(_)));
    }

    #[tokio::test]
    async fn test_notify_failure_is_reported() {
        let f = fixture();
        f.notifier.set_failing(Some("broker down"));

        let err = f.service.create_swap(request()).await.unwrap_err();
        assert!(matches!(err, SwapRailError::Messaging(_)));
        assert_eq!(f.repository.swaps().len(), 1);
    }

    #[tokio::test]
    async fn test_process_swap_in_progress() {
        let f = fixture();
        let swap = f.service.create_swap(request()).await.unwrap();

        let err = assert_err!(f.service.process_swap(swap.clone()).await);

        assert!(matches!(err, SwapRailError::SwapInProgress(_)));
        assert!(err.is_retryable());
        assert_eq!(f.service.get_swap(&swap.id).await.unwrap().status, SwapStatus::Pending);
    }

    #[tokio::test]
    async fn test_process_swap_completes_once() {
        let f = fixture();
        let swap = f.service.create_swap(request()).await.unwrap();
        f.fetcher.set_status(
            swap.exchange_id.clone(),
            ExchangeStatus::Finished {
                payout_amount: Some(dec!(31950)),
            },
        );

        let processed = f.service.process_swap(swap.clone()).await.unwrap();
        assert_eq!(processed.status, SwapStatus::Completed);
        assert_eq!(processed.payout_amount, dec!(31950));

        // Redelivery of the original message leaves the stored swap alone.
        f.fetcher.set_status(
            swap.exchange_id.clone(),
            ExchangeStatus::Failed {
                reason: "late failure".to_string(),
            },
        );
        let again = f.service.process_swap(swap.clone()).await.unwrap();
        assert_eq!(again.status, SwapStatus::Completed);
        assert_eq!(f.metrics.snapshot().swaps_completed, 1);
        assert_eq!(f.metrics.snapshot().swaps_failed, 0);
    }

    #[tokio::test]
    async fn test_concurrent_deliveries_settle_once() {
        let f = fixture();
        let swap = f.service.create_swap(request()).await.unwrap();
        let slow = Arc::new(MockFetcher::new("alpha").with_delay(Duration::from_millis(100)));
        slow.set_status(
            swap.exchange_id.clone(),
            ExchangeStatus::Finished {
                payout_amount: Some(dec!(31950)),
            },
        );
        let service = Arc::new(SwapService::new(
            {
                let engine = QuoteAggregator::new(AggregatorConfig::default());
                engine.add_exchange(slow.clone());
                Arc::new(engine)
            },
            f.repository.clone(),
            f.repository.clone(),
            f.notifier.clone(),
            f.metrics.clone(),
        ));

        let spawn = |service: Arc<SwapService>, swap: Swap| {
            tokio::spawn(async move { service.process_swap(swap).await })
        };
        let first = spawn(service.clone(), swap.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = spawn(service.clone(), swap.clone());

        // The second delivery read the swap while it was still pending and
        // polls the exchange after the first one has written.
        let first = first.await.unwrap().unwrap();
        slow.set_status(
            swap.exchange_id.clone(),
            ExchangeStatus::Failed {
                reason: "late failure".to_string(),
            },
        );
        let second = second.await.unwrap().unwrap();

        assert_eq!(first.status, SwapStatus::Completed);
        assert_eq!(second.status, SwapStatus::Completed);
        let stored = f.service.get_swap(&swap.id).await.unwrap();
        assert_eq!(stored.status, SwapStatus::Completed);
        assert_eq!(stored.reason, None);

        let snapshot = f.metrics.snapshot();
        assert_eq!(snapshot.swaps_completed, 1);
        assert_eq!(snapshot.swaps_failed, 0);
    }

    #[tokio::test]
    async fn test_process_swap_failed() {
        let f = fixture();
        let swap = f.service.create_swap(request()).await.unwrap();
        f.fetcher.set_status(
            swap.exchange_id.clone(),
            ExchangeStatus::Failed {
                reason: "refunded".to_string(),
            },
        );

        let processed = f.service.process_swap(swap.clone()).await.unwrap();

        assert_eq!(processed.status, SwapStatus::Failed);
        let stored = f.service.get_swap(&swap.id).await.unwrap();
        assert_eq!(stored.reason.as_deref(), Some("refunded"));
    }
}
