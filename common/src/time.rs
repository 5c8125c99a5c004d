//! Timing constants for SwapRail.

use std::time::Duration;

/// Default intervals and bounds.
pub mod constants {
    use super::Duration;

    /// Currency listing cache lifetime (5 minutes).
    pub fn catalog_ttl() -> Duration {
        Duration::from_secs(5 * 60)
    }

    /// Quote list cache lifetime (30 seconds).
    pub fn quote_ttl() -> Duration {
        Duration::from_secs(30)
    }

    /// Bound on a single exchange call during a quote fan-out (5 seconds).
    pub fn exchange_timeout() -> Duration {
        Duration::from_secs(5)
    }

    /// Bound on a single `get_currencies` call (30 seconds).
    pub fn catalog_fetch_timeout() -> Duration {
        Duration::from_secs(30)
    }

    /// Cache sweep interval (60 seconds).
    pub fn sweep_interval() -> Duration {
        Duration::from_secs(60)
    }

    /// Catalog sync interval (5 minutes).
    pub fn catalog_sync_interval() -> Duration {
        Duration::from_secs(5 * 60)
    }

    /// Price sync interval (1 minute).
    pub fn price_sync_interval() -> Duration {
        Duration::from_secs(60)
    }

    /// Delay before the first price sync (10 seconds).
    pub fn price_sync_start_delay() -> Duration {
        Duration::from_secs(10)
    }

    /// Pause between price feed pages (10 seconds).
    pub fn price_page_delay() -> Duration {
        Duration::from_secs(10)
    }

    /// Bound on handling one consumed message (30 seconds).
    pub fn handler_timeout() -> Duration {
        Duration::from_secs(30)
    }

    /// Bound on waiting for a publisher confirm (30 seconds).
    pub fn confirm_timeout() -> Duration {
        Duration::from_secs(30)
    }

    /// Fixed delay between reconnect attempts (5 seconds).
    pub fn reconnect_delay() -> Duration {
        Duration::from_secs(5)
    }

    /// Age after which a stored price is ignored for deviation (15 minutes).
    pub fn price_staleness() -> Duration {
        Duration::from_secs(15 * 60)
    }
}

/// Price feed paging defaults.
pub mod paging {
    /// Tickers per page.
    pub const PAGE_SIZE: u32 = 250;

    /// Last page requested in one run.
    pub const MAX_PAGES: u32 = 100;

    /// Currency prices are quoted in.
    pub const TARGET_CURRENCY: &str = "usd";
}

/// Broker defaults.
pub mod broker {
    /// Reconnect attempts before the watcher gives up.
    pub const MAX_RECONNECTS: u32 = 10;

    /// Unacknowledged deliveries per consumer.
    pub const PREFETCH: u16 = 1;
}

/// Convert a std duration into a chrono one, saturating on overflow.
pub fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
