//! SwapRail Quote Aggregator
//!
//! Queries every registered exchange adapter concurrently and returns the
//! best conversion rates.
//!
//! # Features
//!
//! - Pluggable exchange adapters behind the [`Fetcher`] trait
//! - Per-exchange timeouts so a slow exchange never stalls a request
//! - TTL caching of currency listings and quote lists
//! - Ranking of quotes by output amount
//!
//! # Example
//!
//! ```rust,ignore
//! use swaprail_aggregator::{AggregatorConfig, QuoteAggregator};
//! use swaprail_common::NetworkPair;
//!
//! let engine = QuoteAggregator::new(AggregatorConfig::default());
//! engine.add_exchange(Arc::new(my_exchange));
//!
//! let from = NetworkPair::new("btc", "btc");
//! let to = NetworkPair::new("usdt", "eth");
//! let best = engine.get_best_quote(&from, &to, dec!(0.5)).await?;
//! ```

pub mod cache;
pub mod engine;
pub mod error;
pub mod fetcher;

pub use cache::{CacheStats, TtlCache};
pub use engine::{AggregatorConfig, AggregatorStats, CurrencyBuckets, QuoteAggregator};
pub use error::{AggregatorError, AggregatorResult, FetchError, FetchResult};
pub use fetcher::{Fetcher, PriceFeed};

#[cfg(any(test, feature = "test-utils"))]
pub use fetcher::mock::{MockFetcher, MockPriceFeed};
