//! Quote types and ranking.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::currency::NetworkPair;

/// A conversion quote from one exchange.
///
/// Quotes are built fresh per request and only ever live in the short-TTL
/// quote cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    /// Exchange that produced the quote.
    pub exchange: String,
    pub from: NetworkPair,
    pub to: NetworkPair,
    /// Input amount in `from` units.
    pub from_amount: Decimal,
    /// Output amount in `to` units.
    pub to_amount: Decimal,
    /// Implied rate, `to_amount / from_amount`.
    pub rate: Decimal,
    pub min_amount: Option<Decimal>,
    pub max_amount: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
    /// Percentage deviation from the theoretical price derived from catalog
    /// prices. Informational only.
    pub difference: Option<Decimal>,
}

impl Quote {
    /// Create a new quote; the rate is derived from the amounts.
    pub fn new(
        exchange: impl Into<String>,
        from: NetworkPair,
        to: NetworkPair,
        from_amount: Decimal,
        to_amount: Decimal,
    ) -> Self {
        let rate = if from_amount.is_zero() {
            Decimal::ZERO
        } else {
            to_amount / from_amount
        };

        Self {
            exchange: exchange.into(),
            from,
            to,
            from_amount,
            to_amount,
            rate,
            min_amount: None,
            max_amount: None,
            timestamp: Utc::now(),
            difference: None,
        }
    }

    pub fn with_limits(mut self, min_amount: Option<Decimal>, max_amount: Option<Decimal>) -> Self {
        self.min_amount = min_amount;
        self.max_amount = max_amount;
        self
    }

    /// Only quotes with a positive output can be cached or ranked.
    pub fn is_usable(&self) -> bool {
        self.to_amount > Decimal::ZERO
    }

    /// Annotate with the deviation from `from_amount * from_price / to_price`.
    ///
    /// Leaves `difference` unset when either price is not positive.
    pub fn with_price_difference(mut self, from_price: Decimal, to_price: Decimal) -> Self {
        if from_price <= Decimal::ZERO || to_price <= Decimal::ZERO {
            self.difference = None;
            return self;
        }

        let theoretical = self.from_amount * from_price / to_price;
        if theoretical.is_zero() {
            self.difference = None;
            return self;
        }

        let difference = (self.to_amount - theoretical) / theoretical * Decimal::ONE_HUNDRED;
        self.difference = Some(difference.round_dp(4));
        self
    }
}

/// Drop unusable quotes and order the rest best-first.
///
/// More output is better; ties are broken by exchange name so the order
/// does not depend on which provider answered first.
pub fn rank_quotes(quotes: impl IntoIterator<Item = Quote>) -> Vec<Quote> {
    let mut ranked: Vec<Quote> = quotes.into_iter().filter(Quote::is_usable).collect();
    ranked.sort_by(|a, b| match b.to_amount.cmp(&a.to_amount) {
        Ordering::Equal => a.exchange.cmp(&b.exchange),
        other => other,
    });
    ranked
}
