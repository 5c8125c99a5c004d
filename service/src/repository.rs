//! Persistence seams for currencies and swaps.

use async_trait::async_trait;
use swaprail_common::{Currency, NetworkPair, Swap, SwapId, SwapRailResult};

/// Filters for listing stored currencies. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CurrencyFilters {
    /// Symbols to include, case-insensitive.
    pub symbols: Option<Vec<String>>,
    pub popular: Option<bool>,
    pub available: Option<bool>,
}

impl CurrencyFilters {
    pub fn symbols<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            symbols: Some(
                symbols
                    .into_iter()
                    .map(|s| s.as_ref().to_lowercase())
                    .collect(),
            ),
            ..Self::default()
        }
    }

    pub fn popular(mut self, popular: bool) -> Self {
        self.popular = Some(popular);
        self
    }

    pub fn available(mut self, available: bool) -> Self {
        self.available = Some(available);
        self
    }

    /// Lower-cased symbol list, if any.
    pub fn symbol_keys(&self) -> Option<Vec<String>> {
        self.symbols
            .as_ref()
            .map(|symbols| symbols.iter().map(|s| s.to_lowercase()).collect())
    }

    pub fn matches(&self, currency: &Currency) -> bool {
        if let Some(symbols) = self.symbol_keys() {
            if !symbols.contains(&currency.key()) {
                return false;
            }
        }
        if let Some(popular) = self.popular {
            if currency.popular != popular {
                return false;
            }
        }
        if let Some(available) = self.available {
            if currency.available != available {
                return false;
            }
        }
        true
    }
}

/// Stored currency catalog.
#[async_trait]
pub trait CurrencyRepository: Send + Sync {
    /// Currencies matching `filters`, ordered by symbol.
    async fn get_currencies(&self, filters: &CurrencyFilters) -> SwapRailResult<Vec<Currency>>;

    /// Currencies reachable on any of `pairs`, with all their networks.
    async fn get_currencies_by_pairs(&self, pairs: &[NetworkPair]) -> SwapRailResult<Vec<Currency>>;

    /// Upsert the merged catalog and replace every stored network.
    ///
    /// Runs as one transaction. Stored prices are kept; stored currencies
    /// missing from `currencies` are marked unavailable.
    async fn insert_currencies(&self, currencies: &[Currency]) -> SwapRailResult<()>;

    /// Upsert prices only.
    async fn update_prices(&self, currencies: &[Currency]) -> SwapRailResult<()>;
}

/// Stored swaps.
#[async_trait]
pub trait SwapRepository: Send + Sync {
    /// Fails with `NotFound` for unknown ids.
    async fn get_swap(&self, id: &SwapId) -> SwapRailResult<Swap>;

    async fn insert_swap(&self, swap: &Swap) -> SwapRailResult<()>;

    /// Write a settled swap over its stored row, but only while the stored
    /// row is still pending.
    ///
    /// Returns `false` when another writer already settled the swap, in
    /// which case nothing is written. Fails with `NotFound` for unknown ids.
    async fn update_swap(&self, swap: &Swap) -> SwapRailResult<bool>;
}

#[cfg(any(test, feature = "test-utils"))]
pub use memory::InMemoryRepository;

#[cfg(any(test, feature = "test-utils"))]
mod memory {
    use std::collections::{BTreeMap, BTreeSet, HashMap};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::RwLock;
    use swaprail_common::{SwapRailError, SwapStatus};

    use super::*;

    /// In-memory implementation of both repositories.
    #[derive(Default)]
    pub struct InMemoryRepository {
        currencies: RwLock<BTreeMap<String, Currency>>,
        swaps: RwLock<HashMap<SwapId, Swap>>,
        failing: RwLock<Option<String>>,
        price_updates: AtomicUsize,
        catalog_writes: AtomicUsize,
    }

    impl InMemoryRepository {
        pub fn new() -> Self {
            Self::default()
        }

        /// Seed currencies without going through a catalog write.
        pub fn with_currencies(self, currencies: Vec<Currency>) -> Self {
            {
                let mut stored = self.currencies.write();
                for currency in currencies {
                    stored.insert(currency.key(), currency);
                }
            }
            self
        }

        /// Make every call fail with a database error until cleared.
        pub fn set_failing(&self, message: Option<&str>) {
            *self.failing.write() = message.map(str::to_string);
        }

        /// Number of non-empty `update_prices` calls.
        pub fn price_updates(&self) -> usize {
            self.price_updates.load(Ordering::SeqCst)
        }

        pub fn catalog_writes(&self) -> usize {
            self.catalog_writes.load(Ordering::SeqCst)
        }

        pub fn currency(&self, symbol: &str) -> Option<Currency> {
            self.currencies.read().get(&symbol.to_lowercase()).cloned()
        }

        pub fn swaps(&self) -> Vec<Swap> {
            let mut swaps: Vec<Swap> = self.swaps.read().values().cloned().collect();
            swaps.sort_by_key(|s| s.id);
            swaps
        }

        fn check(&self) -> SwapRailResult<()> {
            match self.failing.read().as_ref() {
                Some(message) => Err(SwapRailError::Database(message.clone())),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl CurrencyRepository for InMemoryRepository {
        async fn get_currencies(&self, filters: &CurrencyFilters) -> SwapRailResult<Vec<Currency>> {
            self.check()?;
            Ok(self
                .currencies
                .read()
                .values()
                .filter(|c| filters.matches(c))
                .cloned()
                .collect())
        }

        async fn get_currencies_by_pairs(
            &self,
            pairs: &[NetworkPair],
        ) -> SwapRailResult<Vec<Currency>> {
            self.check()?;
            Ok(self
                .currencies
                .read()
                .values()
                .filter(|c| pairs.iter().any(|p| c.supports(p)))
                .cloned()
                .collect())
        }

        async fn insert_currencies(&self, currencies: &[Currency]) -> SwapRailResult<()> {
            self.check()?;
            self.catalog_writes.fetch_add(1, Ordering::SeqCst);

            let mut stored = self.currencies.write();
            let incoming: BTreeSet<String> = currencies.iter().map(Currency::key).collect();

            for (key, currency) in stored.iter_mut() {
                currency.networks.clear();
                if !incoming.contains(key) {
                    currency.available = false;
                }
            }

            for currency in currencies {
                let mut next = currency.clone();
                if let Some(existing) = stored.get(&currency.key()) {
                    next.price = existing.price;
                    next.priced_at = existing.priced_at;
                }
                stored.insert(currency.key(), next);
            }

            Ok(())
        }

        async fn update_prices(&self, currencies: &[Currency]) -> SwapRailResult<()> {
            self.check()?;
            if currencies.is_empty() {
                return Ok(());
            }
            self.price_updates.fetch_add(1, Ordering::SeqCst);

            let mut stored = self.currencies.write();
            for currency in currencies {
                match stored.get_mut(&currency.key()) {
                    Some(existing) => {
                        existing.price = currency.price;
                        existing.priced_at = currency.priced_at;
                    }
                    None => {
                        stored.insert(currency.key(), currency.clone());
                    }
                }
            }
            Ok(())
        }
    }

    #[async_trait]
    impl SwapRepository for InMemoryRepository {
        async fn get_swap(&self, id: &SwapId) -> SwapRailResult<Swap> {
            self.check()?;
            self.swaps
                .read()
                .get(id)
                .cloned()
                .ok_or_else(|| SwapRailError::NotFound(format!("swap {}", id)))
        }

        async fn insert_swap(&self, swap: &Swap) -> SwapRailResult<()> {
            self.check()?;
            let mut swaps = self.swaps.write();
            if swaps.contains_key(&swap.id) {
                return Err(SwapRailError::Database(format!("swap {} already exists", swap.id)));
            }
            swaps.insert(swap.id, swap.clone());
            Ok(())
        }

        async fn update_swap(&self, swap: &Swap) -> SwapRailResult<bool> {
            self.check()?;
            match self.swaps.write().get_mut(&swap.id) {
                Some(stored) if stored.status == SwapStatus::Pending => {
                    *stored = swap.clone();
                    Ok(true)
                }
                Some(_) => Ok(false),
                None => Err(SwapRailError::NotFound(format!("swap {}", swap.id))),
            }
        }
    }
}
