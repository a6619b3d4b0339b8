use super::order::{Order, OrderId, OrderStatus};
use super::payment::{
    CallbackValidation, CheckoutRequest, CheckoutSession, OperationReceipt, Page, Payment,
    PaymentOperation, Token,
};
use super::sync::PaymentStatus;
use crate::error::{ProviderError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;

/// The two persisted scheduler checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CursorKind {
    Orders,
    Payments,
}

impl CursorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Orders => "order_updated_at",
            Self::Payments => "payment_updated_at",
        }
    }
}

/// Per-order record store.
///
/// `save` is a compare-and-swap on [`Order::version`]: it fails with
/// [`ReconError::Conflict`](crate::error::ReconError::Conflict) when the stored
/// version moved since the order was read, and returns the new version.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn get(&self, id: &OrderId) -> Result<Option<Order>>;
    /// Inserts or replaces an order without a version check.
    async fn insert(&self, order: Order) -> Result<()>;
    async fn save(&self, order: &Order) -> Result<u64>;
    async fn all_orders(&self) -> Result<Vec<Order>>;
    async fn cursor(&self, kind: CursorKind) -> Result<Option<DateTime<Utc>>>;
    async fn set_cursor(&self, kind: CursorKind, at: DateTime<Utc>) -> Result<()>;

    /// Saves `order` and carries the new version back into it.
    async fn persist(&self, order: &mut Order) -> Result<()> {
        order.version = self.save(order).await?;
        Ok(())
    }

    async fn orders_with_status(&self, statuses: &[OrderStatus]) -> Result<Vec<Order>> {
        Ok(self
            .all_orders()
            .await?
            .into_iter()
            .filter(|o| statuses.contains(&o.status))
            .collect())
    }

    async fn orders_with_payment_status(&self, statuses: &[PaymentStatus]) -> Result<Vec<Order>> {
        Ok(self
            .all_orders()
            .await?
            .into_iter()
            .filter(|o| o.sync.payment_status.is_some_and(|s| statuses.contains(&s)))
            .collect())
    }

    /// Orders whose status changed in `[since, until]`, oldest first.
    async fn orders_updated_between(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Order>> {
        let mut orders: Vec<Order> = self
            .all_orders()
            .await?
            .into_iter()
            .filter(|o| o.updated_at >= since && o.updated_at <= until)
            .collect();
        orders.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(orders)
    }

    async fn transient_error_orders(&self) -> Result<Vec<Order>> {
        Ok(self
            .all_orders()
            .await?
            .into_iter()
            .filter(|o| o.sync.transient.is_some())
            .collect())
    }
}

/// Remote hosted-payment provider.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> std::result::Result<CheckoutSession, ProviderError>;

    async fn validate_callback(
        &self,
        params: &CallbackValidation,
    ) -> std::result::Result<bool, ProviderError>;

    async fn get_payment(&self, id: &OrderId) -> std::result::Result<Payment, ProviderError>;

    /// Payments updated at or after `since` (unix seconds), ascending by update time.
    async fn list_payments(
        &self,
        since: i64,
        next_token: Option<&str>,
    ) -> std::result::Result<Page<Payment>, ProviderError>;

    async fn get_payment_operation(
        &self,
        id: &OrderId,
        tx_id: &str,
    ) -> std::result::Result<PaymentOperation, ProviderError>;

    async fn list_payment_operations(
        &self,
        id: &OrderId,
        next_token: Option<&str>,
    ) -> std::result::Result<Page<PaymentOperation>, ProviderError>;

    async fn list_tokens(&self) -> std::result::Result<Vec<Token>, ProviderError>;

    async fn settle(
        &self,
        id: &OrderId,
        chain: &str,
        token: &str,
        amount: Decimal,
    ) -> std::result::Result<OperationReceipt, ProviderError>;

    async fn refund(
        &self,
        id: &OrderId,
        chain: &str,
        token: &str,
    ) -> std::result::Result<OperationReceipt, ProviderError>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub type SharedOrderStore = Arc<dyn OrderStore>;
pub type SharedProvider = Arc<dyn PaymentProvider>;
pub type SharedClock = Arc<dyn Clock>;
