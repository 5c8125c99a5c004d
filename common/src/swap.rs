//! Swap types and state machine.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::currency::NetworkPair;
use crate::error::{SwapRailError, SwapRailResult};
use crate::identifiers::SwapId;

/// Swap status representing the lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SwapStatus {
    /// Order created on the exchange, awaiting completion.
    Pending,
    /// Payout sent.
    Completed,
    /// Exchange reported a failure.
    Failed,
}

impl SwapStatus {
    /// Check if this is a final state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SwapStatus::Completed | SwapStatus::Failed)
    }

    /// Get valid next states from current state.
    pub fn valid_transitions(&self) -> &[SwapStatus] {
        match self {
            SwapStatus::Pending => &[SwapStatus::Completed, SwapStatus::Failed],
            SwapStatus::Completed => &[],
            SwapStatus::Failed => &[],
        }
    }

    /// Check if transition to given state is valid.
    pub fn can_transition_to(&self, next: SwapStatus) -> bool {
        self.valid_transitions().contains(&next)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SwapStatus::Pending => "PENDING",
            SwapStatus::Completed => "COMPLETED",
            SwapStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PENDING" => Some(SwapStatus::Pending),
            "COMPLETED" => Some(SwapStatus::Completed),
            "FAILED" => Some(SwapStatus::Failed),
            _ => None,
        }
    }
}

/// Swap request submitted by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapRequest {
    pub from: NetworkPair,
    pub to: NetworkPair,
    /// Amount the caller will pay in.
    pub amount: Decimal,
    /// Destination address for the payout.
    pub to_address: String,
    pub refund_address: String,
    /// Exchange chosen from the quote list.
    pub exchange: String,
}

impl SwapRequest {
    /// Check required fields; address patterns are checked separately.
    pub fn validate(&self) -> SwapRailResult<()> {
        if self.amount <= Decimal::ZERO {
            return Err(SwapRailError::validation("amount must be positive", "amount"));
        }
        if self.from == self.to {
            return Err(SwapRailError::validation(
                "source and destination must be different",
                "to",
            ));
        }
        if self.to_address.trim().is_empty() {
            return Err(SwapRailError::validation("destination address is required", "to_address"));
        }
        if self.refund_address.trim().is_empty() {
            return Err(SwapRailError::validation("refund address is required", "refund_address"));
        }
        if self.exchange.trim().is_empty() {
            return Err(SwapRailError::validation("exchange is required", "exchange"));
        }
        Ok(())
    }
}

/// Order created on an exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapResponse {
    /// Exchange-assigned id.
    pub id: String,
    pub status: String,
    pub from: NetworkPair,
    pub to: NetworkPair,
    /// Deposit address the caller pays into.
    pub payin_address: String,
    pub payin_amount: Decimal,
    pub payout_amount: Decimal,
    pub payout_address: String,
    /// Exchange that served the order.
    pub exchange: String,
    pub created_at: DateTime<Utc>,
}

/// Progress of an order as reported by the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ExchangeStatus {
    InProgress,
    Finished { payout_amount: Option<Decimal> },
    Failed { reason: String },
}

/// A swap tracked by SwapRail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Swap {
    pub id: SwapId,
    pub from: NetworkPair,
    pub to: NetworkPair,
    pub payin_amount: Decimal,
    pub payin_address: String,
    pub payout_amount: Decimal,
    pub payout_address: String,
    pub refund_address: String,
    pub exchange: String,
    /// Id assigned by the exchange.
    pub exchange_id: String,
    pub status: SwapStatus,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Swap {
    /// Create a pending swap from the exchange's order.
    pub fn from_order(request: &SwapRequest, order: &SwapResponse) -> Self {
        let now = Utc::now();
        Self {
            id: SwapId::new(),
            from: request.from.clone(),
            to: request.to.clone(),
            payin_amount: request.amount,
            payin_address: order.payin_address.clone(),
            payout_amount: order.payout_amount,
            payout_address: request.to_address.clone(),
            refund_address: request.refund_address.clone(),
            exchange: order.exchange.clone(),
            exchange_id: order.id.clone(),
            status: SwapStatus::Pending,
            reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, refusing to leave a terminal state.
    pub fn transition_to(&mut self, next: SwapStatus) -> SwapRailResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(SwapRailError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn complete(&mut self, payout_amount: Option<Decimal>) -> SwapRailResult<()> {
        self.transition_to(SwapStatus::Completed)?;
        if let Some(amount) = payout_amount {
            self.payout_amount = amount;
        }
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> SwapRailResult<()> {
        self.transition_to(SwapStatus::Failed)?;
        self.reason = Some(reason.into());
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn request() -> SwapRequest {
        SwapRequest {
            from: NetworkPair::new("btc", "btc"),
            to: NetworkPair::new("eth", "eth"),
            amount: dec!(0.5),
            to_address: "0x52908400098527886E0F7030069857D2E4169EE7".to_string(),
            refund_address: "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq".to_string(),
            exchange: "alpha".to_string(),
        }
    }

    fn order() -> SwapResponse {
        SwapResponse {
            id: "ext-1".to_string(),
            status: "waiting".to_string(),
            from: NetworkPair::new("btc", "btc"),
            to: NetworkPair::new("eth", "eth"),
            payin_address: "bc1qdeposit".to_string(),
            payin_amount: dec!(0.5),
            payout_amount: dec!(9.8),
            payout_address: "0x52908400098527886E0F7030069857D2E4169EE7".to_string(),
            exchange: "alpha".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_request_validation() {
        assert!(request().validate().is_ok());

        let mut zero = request();
        zero.amount = dec!(0);
        assert!(zero.validate().is_err());

        let mut same = request();
        same.to = same.from.clone();
        assert!(same.validate().is_err());

        let mut no_exchange = request();
        no_exchange.exchange = String::new();
        assert!(matches!(
            no_exchange.validate(),
            Err(SwapRailError::Validation { field: Some(ref f), .. }) if f == "exchange"
        ));
    }

    #[test]
    fn test_swap_from_order() {
        let swap = Swap::from_order(&request(), &order());
        assert_eq!(swap.status, SwapStatus::Pending);
        assert_eq!(swap.exchange_id, "ext-1");
        assert_eq!(swap.payout_amount, dec!(9.8));
    }

    #[test]
    fn test_transitions_are_monotonic() {
        let mut swap = Swap::from_order(&request(), &order());
        swap.complete(Some(dec!(9.75))).unwrap();
        assert_eq!(swap.payout_amount, dec!(9.75));

        assert!(matches!(
            swap.fail("late failure"),
            Err(SwapRailError::InvalidTransition { .. })
        ));
        assert_eq!(swap.status, SwapStatus::Completed);
        assert!(swap.reason.is_none());
    }

    #[test]
    fn test_status_strings() {
        for status in [SwapStatus::Pending, SwapStatus::Completed, SwapStatus::Failed] {
            assert_eq!(SwapStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SwapStatus::parse("unknown"), None);
    }

    #[test]
    fn test_swap_json_roundtrip() {
        let swap = Swap::from_order(&request(), &order());
        let json = serde_json::to_string(&swap).unwrap();
        assert!(json.contains("\"PENDING\""));
        let decoded: Swap = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, swap);
    }
}
