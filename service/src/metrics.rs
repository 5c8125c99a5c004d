//! Metrics collection for node monitoring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::info;

/// Node metrics.
#[derive(Default)]
pub struct Metrics {
    /// Quote requests served.
    pub quotes_requested: AtomicU64,
    /// Quote requests answered with no quotes.
    pub quotes_empty: AtomicU64,
    /// Swaps created.
    pub swaps_created: AtomicU64,
    /// Swaps moved to completed.
    pub swaps_completed: AtomicU64,
    /// Swaps moved to failed.
    pub swaps_failed: AtomicU64,
    /// Swap notifications published.
    pub notifications_sent: AtomicU64,
    /// Catalog sync runs finished.
    pub catalog_syncs: AtomicU64,
    /// Price sync runs finished.
    pub price_syncs: AtomicU64,
    /// Currencies priced across all price runs.
    pub prices_updated: AtomicU64,
}

impl Metrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn quote_requested(&self, found: bool) {
        self.quotes_requested.fetch_add(1, Ordering::Relaxed);
        if !found {
            self.quotes_empty.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn swap_created(&self) {
        self.swaps_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn swap_completed(&self) {
        self.swaps_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn swap_failed(&self) {
        self.swaps_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn notification_sent(&self) {
        self.notifications_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn catalog_synced(&self) {
        self.catalog_syncs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn prices_synced(&self, priced: u64) {
        self.price_syncs.fetch_add(1, Ordering::Relaxed);
        self.prices_updated.fetch_add(priced, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            quotes_requested: self.quotes_requested.load(Ordering::Relaxed),
            quotes_empty: self.quotes_empty.load(Ordering::Relaxed),
            swaps_created: self.swaps_created.load(Ordering::Relaxed),
            swaps_completed: self.swaps_completed.load(Ordering::Relaxed),
            swaps_failed: self.swaps_failed.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            catalog_syncs: self.catalog_syncs.load(Ordering::Relaxed),
            price_syncs: self.price_syncs.load(Ordering::Relaxed),
            prices_updated: self.prices_updated.load(Ordering::Relaxed),
            ..MetricsSnapshot::default()
        }
    }
}

/// Snapshot of metrics at a point in time.
///
/// Cache and consumer figures are owned by the engine and the broker
/// connection; the node fills them in when it logs a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub quotes_requested: u64,
    pub quotes_empty: u64,
    pub quote_cache_hits: u64,
    pub quote_cache_misses: u64,
    pub swaps_created: u64,
    pub swaps_completed: u64,
    pub swaps_failed: u64,
    pub notifications_sent: u64,
    pub messages_acked: u64,
    pub messages_requeued: u64,
    pub catalog_syncs: u64,
    pub price_syncs: u64,
    pub prices_updated: u64,
}

impl MetricsSnapshot {
    pub fn log(&self) {
        info!(
            quotes_requested = self.quotes_requested,
            quotes_empty = self.quotes_empty,
            quote_cache_hits = self.quote_cache_hits,
            quote_cache_misses = self.quote_cache_misses,
            swaps_created = self.swaps_created,
            swaps_completed = self.swaps_completed,
            swaps_failed = self.swaps_failed,
            notifications_sent = self.notifications_sent,
            messages_acked = self.messages_acked,
            messages_requeued = self.messages_requeued,
            catalog_syncs = self.catalog_syncs,
            price_syncs = self.price_syncs,
            prices_updated = self.prices_updated,
            "Metrics"
        );
    }
}

/// Shared metrics instance.
pub type SharedMetrics = Arc<Metrics>;
