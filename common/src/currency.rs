//! Currency, network pair and ticker types.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{SwapRailError, SwapRailResult};

/// Symbols promoted to the "popular" bucket when listing currencies.
pub const POPULAR_SYMBOLS: &[&str] = &[
    "btc", "eth", "usdt", "usdc", "bnb", "sol", "ada", "dot", "matic", "avax", "link", "uni",
    "xrp", "ltc", "atom", "near",
];

/// Check whether a symbol belongs to the popular allow-list (case-insensitive).
pub fn is_popular_symbol(symbol: &str) -> bool {
    let lower = symbol.to_lowercase();
    POPULAR_SYMBOLS.contains(&lower.as_str())
}

/// A (symbol, network) tuple identifying one routable asset instance.
///
/// Both parts are lower-cased on construction so that reports from
/// different providers compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetworkPair {
    pub symbol: String,
    pub network: String,
}

impl NetworkPair {
    /// Create a normalized network pair.
    pub fn new(symbol: impl AsRef<str>, network: impl AsRef<str>) -> Self {
        Self {
            symbol: symbol.as_ref().trim().to_lowercase(),
            network: network.as_ref().trim().to_lowercase(),
        }
    }

    /// Upper-cased (SYMBOL, NETWORK) key used for display bucketing.
    pub fn display_key(&self) -> (String, String) {
        (self.symbol.to_uppercase(), self.network.to_uppercase())
    }
}

impl fmt::Display for NetworkPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.symbol, self.network)
    }
}

impl FromStr for NetworkPair {
    type Err = SwapRailError;

    /// Parse `symbol-network`; a bare symbol maps to the network of the same name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(SwapRailError::validation("currency pair is required", "pair"));
        }
        match s.split_once('-') {
            Some((symbol, network)) if !symbol.is_empty() && !network.is_empty() => {
                Ok(Self::new(symbol, network))
            }
            Some(_) => Err(SwapRailError::validation(
                format!("malformed currency pair: {}", s),
                "pair",
            )),
            None => Ok(Self::new(s, s)),
        }
    }
}

/// A currency as reported by a provider and stored in the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Currency {
    /// Ticker symbol, case-insensitive.
    pub symbol: String,
    /// Display name.
    pub name: String,
    /// Icon reference.
    pub image: Option<String>,
    /// Networks this currency can be routed on.
    pub networks: BTreeSet<NetworkPair>,
    /// Regex that destination addresses must match.
    pub address_validation: Option<String>,
    /// Last known price in the feed's target currency.
    pub price: Option<Decimal>,
    /// When `price` was recorded.
    pub priced_at: Option<DateTime<Utc>>,
    /// Member of the popular allow-list.
    pub popular: bool,
    /// Whether the currency is currently offered.
    pub available: bool,
    /// Provider that reported the currency.
    pub provider: Option<String>,
}

impl Currency {
    /// Create a currency with no networks.
    pub fn new(symbol: impl Into<String>, name: impl Into<String>) -> Self {
        let symbol = symbol.into();
        let popular = is_popular_symbol(&symbol);
        Self {
            symbol,
            name: name.into(),
            image: None,
            networks: BTreeSet::new(),
            address_validation: None,
            price: None,
            priced_at: None,
            popular,
            available: true,
            provider: None,
        }
    }

    pub fn with_network(mut self, network: impl AsRef<str>) -> Self {
        self.networks.insert(NetworkPair::new(&self.symbol, network));
        self
    }

    pub fn with_networks<I, S>(mut self, networks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for network in networks {
            self.networks.insert(NetworkPair::new(&self.symbol, network));
        }
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// Set the address pattern unless one is already present.
    pub fn with_address_validation(mut self, pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        if !self.has_address_validation() && !pattern.is_empty() {
            self.address_validation = Some(pattern);
        }
        self
    }

    pub fn with_price(mut self, price: Decimal, priced_at: DateTime<Utc>) -> Self {
        self.price = Some(price);
        self.priced_at = Some(priced_at);
        self
    }

    /// Lower-cased symbol, the catalog key.
    pub fn key(&self) -> String {
        self.symbol.to_lowercase()
    }

    pub fn upper_symbol(&self) -> String {
        self.symbol.to_uppercase()
    }

    pub fn has_address_validation(&self) -> bool {
        self.address_validation
            .as_deref()
            .map(|p| !p.is_empty())
            .unwrap_or(false)
    }

    /// Fold another report of the same symbol into this one.
    ///
    /// Networks are unioned; the first non-empty address pattern wins.
    pub fn merge(&mut self, other: Currency) {
        self.networks.extend(other.networks);
        if !self.has_address_validation() {
            if let Some(pattern) = other.address_validation.filter(|p| !p.is_empty()) {
                self.address_validation = Some(pattern);
            }
        }
        if self.image.is_none() {
            self.image = other.image;
        }
        if self.name.is_empty() {
            self.name = other.name;
        }
        self.available |= other.available;
    }

    /// Copy of this currency restricted to a single network.
    pub fn on_network(&self, pair: &NetworkPair) -> Currency {
        let mut currency = self.clone();
        currency.networks = BTreeSet::from([pair.clone()]);
        currency
    }

    pub fn supports(&self, pair: &NetworkPair) -> bool {
        self.networks.contains(pair)
    }

    /// Check a destination address against this currency's pattern.
    ///
    /// Currencies without a pattern accept any non-empty address.
    pub fn validate_address(&self, address: &str) -> SwapRailResult<()> {
        if address.trim().is_empty() {
            return Err(SwapRailError::validation("address is required", "to_address"));
        }

        let Some(pattern) = self.address_validation.as_deref().filter(|p| !p.is_empty()) else {
            return Ok(());
        };

        let regex = Regex::new(pattern).map_err(|e| {
            SwapRailError::Internal(format!(
                "invalid address pattern for {}: {}",
                self.upper_symbol(),
                e
            ))
        })?;

        if regex.is_match(address) {
            Ok(())
        } else {
            Err(SwapRailError::validation(
                format!("address is not valid for {}", self.upper_symbol()),
                "to_address",
            ))
        }
    }

    /// A price is fresh when it exists and was recorded within `max_age`.
    pub fn has_fresh_price(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        match (self.price, self.priced_at) {
            (Some(price), Some(at)) => price > Decimal::ZERO && now - at <= max_age,
            _ => false,
        }
    }
}

/// Price ticker returned by a price feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub price: Decimal,
    #[serde(rename = "change_24h")]
    pub change_24h: Decimal,
}

impl Ticker {
    pub fn new(symbol: impl Into<String>, price: Decimal, change_24h: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            change_24h,
        }
    }
}
