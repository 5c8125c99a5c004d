//! Quote lookups scored against stored prices.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{instrument, warn};

use swaprail_aggregator::{CurrencyBuckets, QuoteAggregator};
use swaprail_common::{
    to_chrono, Currency, NetworkPair, Quote, SwapRailError, SwapRailResult,
};

use crate::metrics::SharedMetrics;
use crate::repository::{CurrencyFilters, CurrencyRepository};

/// Serves quotes and currency listings.
pub struct QuoteService {
    engine: Arc<QuoteAggregator>,
    repository: Arc<dyn CurrencyRepository>,
    price_staleness: Duration,
    metrics: SharedMetrics,
}

impl QuoteService {
    pub fn new(
        engine: Arc<QuoteAggregator>,
        repository: Arc<dyn CurrencyRepository>,
        price_staleness: Duration,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            engine,
            repository,
            price_staleness,
            metrics,
        }
    }

    /// Every quote for the pair, best first, with their deviation from the
    /// stored market price when both prices are fresh.
    #[instrument(skip(self, from, to), fields(from = %from, to = %to))]
    pub async fn get_quotes(
        &self,
        from: &NetworkPair,
        to: &NetworkPair,
        amount: Decimal,
    ) -> SwapRailResult<Vec<Quote>> {
        if amount <= Decimal::ZERO {
            return Err(SwapRailError::validation("amount must be positive", "amount"));
        }

        let quotes = self.engine.get_all_quotes(from, to, amount).await;
        self.metrics.quote_requested(!quotes.is_empty());

        if quotes.is_empty() {
            return Ok(quotes);
        }
        Ok(self.score(from, to, quotes).await)
    }

    /// The best quote, or `NoQuotes` when no exchange can serve the pair.
    pub async fn get_best_quote(
        &self,
        from: &NetworkPair,
        to: &NetworkPair,
        amount: Decimal,
    ) -> SwapRailResult<Quote> {
        self.get_quotes(from, to, amount)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SwapRailError::NoQuotes {
                from: from.clone(),
                to: to.clone(),
            })
    }

    /// Minimum accepted amount per exchange.
    pub async fn get_min_amounts(
        &self,
        from: &NetworkPair,
        to: &NetworkPair,
    ) -> SwapRailResult<BTreeMap<String, Decimal>> {
        if from == to {
            return Err(SwapRailError::validation(
                "source and destination must be different",
                "to",
            ));
        }
        Ok(self.engine.get_min_amounts(from, to).await)
    }

    /// Stored currencies matching `filters`.
    pub async fn get_currencies(&self, filters: &CurrencyFilters) -> SwapRailResult<Vec<Currency>> {
        self.repository.get_currencies(filters).await
    }

    /// Live per-network listing from the exchanges, split into popular and other.
    pub async fn get_exchange_currencies(&self) -> CurrencyBuckets {
        self.engine.get_all_currencies().await
    }

    async fn score(&self, from: &NetworkPair, to: &NetworkPair, quotes: Vec<Quote>) -> Vec<Quote> {
        let currencies = match self
            .repository
            .get_currencies_by_pairs(&[from.clone(), to.clone()])
            .await
        {
            Ok(currencies) => currencies,
            Err(e) => {
                warn!(error = %e, "Could not load prices, returning unscored quotes");
                return quotes;
            }
        };

        let now = Utc::now();
        let max_age = to_chrono(self.price_staleness);
        let fresh_price = |pair: &NetworkPair| {
            currencies
                .iter()
                .find(|c| c.key() == pair.symbol)
                .filter(|c| c.has_fresh_price(now, max_age))
                .and_then(|c| c.price)
        };

        match (fresh_price(from), fresh_price(to)) {
            (Some(from_price), Some(to_price)) => quotes
                .into_iter()
                .map(|q| q.with_price_difference(from_price, to_price))
                .collect(),
            _ => quotes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::repository::InMemoryRepository;
    use rust_decimal_macros::dec;
    use swaprail_aggregator::{AggregatorConfig, MockFetcher};
    use swaprail_common::ErrorKind;

    fn btc() -> NetworkPair {
        NetworkPair::new("btc", "btc")
    }

    fn usdt() -> NetworkPair {
        NetworkPair::new("usdt", "eth")
    }

    fn priced(symbol: &str, network: &str, price: Decimal, age: chrono::Duration) -> Currency {
        Currency::new(symbol, symbol)
            .with_network(network)
            .with_price(price, Utc::now() - age)
    }

    fn service(repository: Arc<InMemoryRepository>) -> (QuoteService, Arc<Metrics>) {
        let engine = QuoteAggregator::new(AggregatorConfig::default());
        engine.add_exchange(Arc::new(MockFetcher::new("alpha").with_rate(&btc(), &usdt(), dec!(99))));
        engine.add_exchange(Arc::new(MockFetcher::new("beta").with_rate(&btc(), &usdt(), dec!(101))));
        let metrics = Arc::new(Metrics::new());
        let service = QuoteService::new(
            Arc::new(engine),
            repository,
            Duration::from_secs(15 * 60),
            Arc::clone(&metrics),
        );
        (service, metrics)
    }

    #[tokio::test]
    async fn test_rejects_non_positive_amount() {
        let (service, _) = service(Arc::new(InMemoryRepository::new()));
        let err = service.get_quotes(&btc(), &usdt(), dec!(0)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Client);
    }

    #[tokio::test]
    async fn test_quotes_scored_with_fresh_prices() {
        let repository = Arc::new(InMemoryRepository::new().with_currencies(vec![
            priced("btc", "btc", dec!(100), chrono::Duration::minutes(1)),
            priced("usdt", "eth", dec!(1), chrono::Duration::minutes(1)),
        ]));
        let (service, metrics) = service(repository);

        let quotes = service.get_quotes(&btc(), &usdt(), dec!(1)).await.unwrap();

        assert_eq!(quotes.len(), 2);
        assert_eq!(quotes[0].exchange, "beta");
        assert_eq!(quotes[0].difference, Some(dec!(1)));
        assert_eq!(quotes[1].difference, Some(dec!(-1)));
        assert_eq!(metrics.snapshot().quotes_requested, 1);
    }

    #[tokio::test]
    async fn test_stale_price_leaves_quotes_unscored() {
        let repository = Arc::new(InMemoryRepository::new().with_currencies(vec![
            priced("btc", "btc", dec!(100), chrono::Duration::hours(2)),
            priced("usdt", "eth", dec!(1), chrono::Duration::minutes(1)),
        ]));
        let (service, _) = service(repository);

        let quotes = service.get_quotes(&btc(), &usdt(), dec!(1)).await.unwrap();
        assert!(quotes.iter().all(|q| q.difference.is_none()));
    }

    #[tokio::test]
    async fn test_repository_failure_leaves_quotes_unscored() {
        let repository = Arc::new(InMemoryRepository::new());
        repository.set_failing(Some("down"));
        let (service, _) = service(repository);

        let quotes = service.get_quotes(&btc(), &usdt(), dec!(1)).await.unwrap();
        assert_eq!(quotes.len(), 2);
        assert!(quotes[0].difference.is_none());
    }

    #[tokio::test]
    async fn test_best_quote_not_found() {
        let (service, metrics) = service(Arc::new(InMemoryRepository::new()));
        let eth = NetworkPair::new("eth", "eth");

        let err = service.get_best_quote(&eth, &usdt(), dec!(1)).await.unwrap_err();

        assert!(matches!(err, SwapRailError::NoQuotes { .. }));
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(metrics.snapshot().quotes_empty, 1);
    }

    #[tokio::test]
    async fn test_best_quote() {
        let (service, _) = service(Arc::new(InMemoryRepository::new()));
        let best = service.get_best_quote(&btc(), &usdt(), dec!(2)).await.unwrap();
        assert_eq!(best.exchange, "beta");
        assert_eq!(best.to_amount, dec!(202));
    }

    #[tokio::test]
    async fn test_min_amounts_same_pair_rejected() {
        let (service, _) = service(Arc::new(InMemoryRepository::new()));
        let err = service.get_min_amounts(&btc(), &btc()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Client);
    }
}
