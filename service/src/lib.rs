//! SwapRail Node
//!
//! Wires the quote aggregation engine, the currency synchronization daemon
//! and the messaging layer into a single service. Quotes are scored against
//! locally stored prices; swaps are created on the chosen exchange, stored,
//! and handed to a broker consumer that drives them to a terminal state.

pub mod coingecko;
pub mod config;
pub mod consumer;
pub mod currency_sync;
pub mod metrics;
pub mod node;
pub mod notifier;
pub mod postgres;
pub mod quote_service;
pub mod repository;
pub mod state;
pub mod swap_service;

pub use coingecko::CoinGeckoFeed;
pub use config::{CoinGeckoConfig, ServiceConfig, SwapRetryConfig, SyncConfig};
pub use consumer::SwapConsumer;
pub use currency_sync::{CatalogSyncReport, CurrencySyncDaemon, PriceSyncReport, StopReason};
pub use metrics::{Metrics, MetricsSnapshot, SharedMetrics};
pub use node::{NodeParts, SwapRail};
pub use notifier::{BrokerNotifier, SwapNotifier};
pub use postgres::PgRepository;
pub use quote_service::QuoteService;
pub use repository::{CurrencyFilters, CurrencyRepository, SwapRepository};
pub use state::NodeState;
pub use swap_service::SwapService;

#[cfg(any(test, feature = "test-utils"))]
pub use notifier::RecordingNotifier;
#[cfg(any(test, feature = "test-utils"))]
pub use repository::InMemoryRepository;
