//! Catalog merging and price tracking used by the synchronization daemon.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::currency::{is_popular_symbol, Currency};

/// Canonical set of currencies keyed by lower-cased symbol.
///
/// Reports from several providers fold into one entry per symbol: networks
/// are unioned and the first non-empty address pattern is kept.
#[derive(Debug, Clone, Default)]
pub struct CurrencyCatalog {
    currencies: BTreeMap<String, Currency>,
}

impl CurrencyCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog from provider reports, merging duplicates.
    pub fn from_reports<I>(reports: I) -> Self
    where
        I: IntoIterator<Item = Currency>,
    {
        let mut catalog = Self::new();
        for currency in reports {
            catalog.insert(currency);
        }
        catalog
    }

    /// Add one report, merging into an existing entry with the same symbol.
    pub fn insert(&mut self, mut currency: Currency) {
        let key = currency.key();
        match self.currencies.get_mut(&key) {
            Some(existing) => existing.merge(currency),
            None => {
                currency.popular = is_popular_symbol(&key);
                self.currencies.insert(key, currency);
            }
        }
    }

    pub fn get(&self, symbol: &str) -> Option<&Currency> {
        self.currencies.get(&symbol.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.currencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.currencies.is_empty()
    }

    /// Merged currencies ordered by symbol.
    pub fn into_currencies(self) -> Vec<Currency> {
        self.currencies.into_values().collect()
    }
}

/// Tracks which known currencies still need a fresh price during one run of
/// the price loop.
///
/// Owned by a single run; it is rebuilt from the repository on every tick.
#[derive(Debug, Default)]
pub struct PriceTracker {
    unpriced: HashMap<String, Currency>,
    updated: HashMap<String, Currency>,
}

impl PriceTracker {
    pub fn new<I>(currencies: I) -> Self
    where
        I: IntoIterator<Item = Currency>,
    {
        let unpriced = currencies
            .into_iter()
            .map(|currency| (currency.key(), currency))
            .collect();
        Self {
            unpriced,
            updated: HashMap::new(),
        }
    }

    /// Whether some tracked currency has not been priced yet.
    pub fn has_pending(&self) -> bool {
        !self.unpriced.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.unpriced.len()
    }

    pub fn is_tracked(&self, symbol: &str) -> bool {
        self.unpriced.contains_key(&symbol.to_lowercase())
    }

    /// Record a price for `symbol` if it is still unpriced.
    ///
    /// Returns `false` for unknown or already priced symbols.
    pub fn record_price(&mut self, symbol: &str, price: Decimal, at: DateTime<Utc>) -> bool {
        let key = symbol.to_lowercase();
        match self.unpriced.remove(&key) {
            Some(currency) => {
                self.updated.insert(key, currency.with_price(price, at));
                true
            }
            None => false,
        }
    }

    /// Drain the currencies priced since the previous call.
    pub fn take_updated(&mut self) -> Vec<Currency> {
        let mut updated: Vec<Currency> = self.updated.drain().map(|(_, c)| c).collect();
        updated.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_catalog_merges_by_symbol() {
        let catalog = CurrencyCatalog::from_reports(vec![
            Currency::new("USDT", "Tether").with_network("eth").with_provider("a"),
            Currency::new("usdt", "Tether").with_network("bsc").with_provider("b"),
            Currency::new("doge", "Dogecoin").with_network("doge"),
        ]);

        assert_eq!(catalog.len(), 2);
        let usdt = catalog.get("usdt").unwrap();
        assert_eq!(usdt.networks.len(), 2);
        assert!(usdt.popular);
        assert!(!catalog.get("DOGE").unwrap().popular);
    }

    #[test]
    fn test_price_tracker_records_once() {
        let now = Utc::now();
        let mut tracker = PriceTracker::new(vec![
            Currency::new("btc", "Bitcoin"),
            Currency::new("eth", "Ethereum"),
        ]);

        assert!(tracker.record_price("BTC", dec!(65000), now));
        assert!(!tracker.record_price("btc", dec!(1), now));
        assert!(!tracker.record_price("sol", dec!(150), now));
        assert_eq!(tracker.pending_count(), 1);

        let updated = tracker.take_updated();
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].price, Some(dec!(65000)));
        assert!(tracker.take_updated().is_empty());

        assert!(tracker.record_price("eth", dec!(3000), now));
        assert!(!tracker.has_pending());
    }

    proptest! {
        #[test]
        fn catalog_networks_are_union_of_reports(
            networks in proptest::collection::vec("[a-z]{2,5}", 1..8),
        ) {
            let reports = networks
                .iter()
                .map(|n| Currency::new("usdt", "Tether").with_network(n));
            let catalog = CurrencyCatalog::from_reports(reports);

            prop_assert_eq!(catalog.len(), 1);
            let merged = catalog.get("usdt").unwrap();
            for network in &networks {
                prop_assert!(merged.networks.iter().any(|p| &p.network == network));
            }
            let mut distinct = networks.clone();
            distinct.sort();
            distinct.dedup();
            prop_assert_eq!(merged.networks.len(), distinct.len());
        }
    }
}
