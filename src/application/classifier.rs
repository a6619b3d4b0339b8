use crate::domain::order::{Order, OrderId};
use crate::domain::ports::SharedOrderStore;
use crate::domain::sync::{ErrorCode, RetryAction};
use crate::error::{ProviderError, ReconError, Result};
use tracing::{error, info, warn};

pub const DEFAULT_RETRY_CEILING: u32 = 3;

/// Records transient and hard failures against orders.
///
/// The `*_exception` methods address an order by id and persist through the
/// store. The methods taking `&mut Order` do the same on a copy the caller
/// already holds, keeping its version current for the next save.
#[derive(Clone)]
pub struct ErrorClassifier {
    store: SharedOrderStore,
    retry_ceiling: u32,
}

impl ErrorClassifier {
    pub fn new(store: SharedOrderStore, retry_ceiling: u32) -> Self {
        Self {
            store,
            retry_ceiling,
        }
    }

    async fn load(&self, id: &OrderId) -> Result<Order> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| ReconError::OrderNotFound(id.clone()))
    }

    /// Records a transient failure and returns the stored repeat counter.
    pub async fn log_transient_exception(
        &self,
        id: &OrderId,
        action: RetryAction,
        code: ErrorCode,
        message: &str,
    ) -> Result<u32> {
        let mut order = self.load(id).await?;
        self.transient(&mut order, action, code, message).await
    }

    /// Marks the order as permanently failed. Returns false for completed orders.
    pub async fn log_hard_exception(
        &self,
        id: &OrderId,
        action: Option<RetryAction>,
        code: ErrorCode,
        message: &str,
    ) -> Result<bool> {
        let mut order = self.load(id).await?;
        self.hard(&mut order, action, code, message).await
    }

    pub async fn clear_transient_error(&self, id: &OrderId) -> Result<()> {
        let mut order = self.load(id).await?;
        self.clear_transient(&mut order).await
    }

    /// Classifies a provider failure: `400` is hard, anything else transient.
    pub async fn log_exception(
        &self,
        id: &OrderId,
        action: RetryAction,
        err: &ProviderError,
    ) -> Result<()> {
        let mut order = self.load(id).await?;
        self.classify(&mut order, action, err).await
    }

    /// Escalates an order whose transient error kept repeating past the ceiling.
    ///
    /// Returns true when the order was escalated to `E907` (or already hard failed).
    pub async fn check_retry_count(&self, id: &OrderId) -> Result<bool> {
        let mut order = self.load(id).await?;
        if order.sync.is_hard_failed() {
            return Ok(true);
        }
        if order.sync.is_completed() {
            return Ok(false);
        }
        let Some(transient) = order.sync.transient.clone() else {
            return Ok(false);
        };
        if transient.count < self.retry_ceiling {
            return Ok(false);
        }

        error!(
            order_id = %id,
            action = %transient.action,
            code = %transient.code,
            count = transient.count,
            "Retry count exceeded"
        );
        order.sync.clear_transient();
        let escalated = order.sync.fail_hard(
            Some(transient.action),
            ErrorCode::E907,
            format!("Retry count exceeded. Last error: {}", transient.message),
        );
        self.store.persist(&mut order).await?;
        Ok(escalated)
    }

    pub async fn transient(
        &self,
        order: &mut Order,
        action: RetryAction,
        code: ErrorCode,
        message: &str,
    ) -> Result<u32> {
        let count = order.sync.record_transient(action, code, message);
        self.store.persist(order).await?;
        warn!(order_id = %order.id, %action, %code, count, "{}", message);
        Ok(count)
    }

    pub async fn hard(
        &self,
        order: &mut Order,
        action: Option<RetryAction>,
        code: ErrorCode,
        message: &str,
    ) -> Result<bool> {
        if !order.sync.fail_hard(action, code, message) {
            info!(order_id = %order.id, %code, "Order already completed; hard error ignored");
            return Ok(false);
        }
        self.store.persist(order).await?;
        error!(order_id = %order.id, %code, "{}", message);
        Ok(true)
    }

    pub async fn clear_transient(&self, order: &mut Order) -> Result<()> {
        if order.sync.transient.is_none() {
            return Ok(());
        }
        order.sync.clear_transient();
        self.store.persist(order).await
    }

    pub async fn classify(
        &self,
        order: &mut Order,
        action: RetryAction,
        err: &ProviderError,
    ) -> Result<()> {
        let code = ErrorCode::from_provider(err);
        if err.is_hard() {
            self.hard(order, Some(action), code, &err.message).await?;
        } else {
            self.transient(order, action, code, &err.message).await?;
        }
        Ok(())
    }
}
