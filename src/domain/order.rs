use super::sync::SyncMeta;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier shared by a store order and its provider payment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(String);

impl OrderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OrderId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for OrderId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    #[serde(rename = "on-hold")]
    OnHold,
    Processing,
    AwaitingConfirmation,
    MultiTokenPayment,
    Complete,
    Canceled,
    PaymentFailed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::OnHold => "on-hold",
            Self::Processing => "processing",
            Self::AwaitingConfirmation => "awaiting_confirmation",
            Self::MultiTokenPayment => "multi_token_payment",
            Self::Complete => "complete",
            Self::Canceled => "canceled",
            Self::PaymentFailed => "payment_failed",
        }
    }

    /// Statuses in which an incoming provider payment may still be applied.
    pub const AWAITING_PAYMENT: [OrderStatus; 3] = [
        OrderStatus::Pending,
        OrderStatus::AwaitingConfirmation,
        OrderStatus::MultiTokenPayment,
    ];

    /// Statuses from which an order may be flagged as a multi-token payment.
    pub const MULTI_TOKEN_FROM: [OrderStatus; 3] = [
        OrderStatus::OnHold,
        OrderStatus::Pending,
        OrderStatus::AwaitingConfirmation,
    ];

    /// Statuses the orders loop pushes to the provider.
    pub const SETTLEMENT_TRIGGERS: [OrderStatus; 2] = [OrderStatus::Complete, OrderStatus::Canceled];
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A store order linked to the hosted-payment method.
///
/// The order itself belongs to the storefront; this crate only moves its
/// status along the payment lifecycle and owns the attached [`SyncMeta`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub grand_total: Decimal,
    pub currency: String,
    pub status: OrderStatus,
    /// Last time the order status changed.
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub notes: Vec<String>,
    #[serde(default)]
    pub sync: SyncMeta,
    /// Store write counter used for compare-and-swap saves.
    #[serde(default)]
    pub version: u64,
}

impl Order {
    pub fn new(
        id: impl Into<OrderId>,
        grand_total: Decimal,
        currency: impl Into<String>,
        status: OrderStatus,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            grand_total,
            currency: currency.into(),
            status,
            updated_at,
            notes: Vec::new(),
            sync: SyncMeta::default(),
            version: 0,
        }
    }

    /// Moves the order to `status` if its current status is one of `allowed_from`.
    ///
    /// An empty `allowed_from` accepts any current status. Returns whether
    /// the transition happened.
    pub fn transition(
        &mut self,
        status: OrderStatus,
        allowed_from: &[OrderStatus],
        note: Option<&str>,
        at: DateTime<Utc>,
    ) -> bool {
        if !allowed_from.is_empty() && !allowed_from.contains(&self.status) {
            return false;
        }
        self.status = status;
        self.updated_at = at;
        if let Some(note) = note {
            self.notes.push(note.to_string());
        }
        true
    }

    pub fn add_note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn order(status: OrderStatus) -> Order {
        let at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        Order::new("100", dec!(25.00), "USD", status, at)
    }

    #[test]
    fn test_transition_respects_allowed_statuses() {
        let mut order = order(OrderStatus::Processing);
        let at = Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap();

        assert!(!order.transition(
            OrderStatus::MultiTokenPayment,
            &OrderStatus::MULTI_TOKEN_FROM,
            None,
            at
        ));
        assert_eq!(order.status, OrderStatus::Processing);
        assert_ne!(order.updated_at, at);

        assert!(order.transition(OrderStatus::PaymentFailed, &[], Some("Payment Failed."), at));
        assert_eq!(order.status, OrderStatus::PaymentFailed);
        assert_eq!(order.updated_at, at);
        assert_eq!(order.notes, vec!["Payment Failed.".to_string()]);
    }

    #[test]
    fn test_status_serde_names() {
        assert_eq!(
            serde_json::to_string(&OrderStatus::OnHold).unwrap(),
            "\"on-hold\""
        );
        assert_eq!(
            serde_json::from_str::<OrderStatus>("\"awaiting_confirmation\"").unwrap(),
            OrderStatus::AwaitingConfirmation
        );
        assert_eq!(OrderStatus::MultiTokenPayment.to_string(), "multi_token_payment");
    }
}
