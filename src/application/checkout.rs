//! Checkout initiation and the hosted checkout's redirects.

use crate::domain::order::{Order, OrderId, OrderStatus};
use crate::domain::payment::{CallbackValidation, CheckoutRequest};
use crate::domain::ports::{Clock, SharedClock, SharedOrderStore, SharedProvider};
use crate::error::{ReconError, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use tracing::{error, info, warn};

pub const CHECKOUT_FAILED_MESSAGE: &str = "Something went wrong while receiving API Response";

/// Query parameters of the success redirect.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CallbackParams {
    pub id: OrderId,
    pub hmac_alg: String,
    /// Base64 encoded by the hosted checkout.
    pub hmac_input: String,
    #[serde(rename = "hmac_keyId")]
    pub hmac_key_id: String,
    pub hmac_value: String,
}

#[derive(Clone)]
pub struct CheckoutService {
    store: SharedOrderStore,
    provider: SharedProvider,
    clock: SharedClock,
    success_url: String,
    cancel_url: String,
}

impl CheckoutService {
    pub fn new(
        store: SharedOrderStore,
        provider: SharedProvider,
        clock: SharedClock,
        success_url: impl Into<String>,
        cancel_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            provider,
            clock,
            success_url: success_url.into(),
            cancel_url: cancel_url.into(),
        }
    }

    async fn load(&self, id: &OrderId) -> Result<Order> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| ReconError::OrderNotFound(id.clone()))
    }

    /// Opens a hosted checkout session and returns the redirect URL.
    ///
    /// A provider failure cancels the order.
    pub async fn start_checkout(&self, id: &OrderId) -> Result<String> {
        let mut order = self.load(id).await?;
        let request = CheckoutRequest {
            id: order.id.clone(),
            currency: order.currency.clone(),
            amount: order.grand_total,
            success_url: self.success_url.clone(),
            cancel_url: self.cancel_url.clone(),
            base64_transform: true,
        };

        match self.provider.create_checkout_session(&request).await {
            Ok(session) => {
                info!(order_id = %id, url = %session.url, "Checkout session created");
                Ok(session.url)
            }
            Err(err) => {
                error!(order_id = %id, error = %err, "createCheckoutSession failed");
                order.transition(
                    OrderStatus::Canceled,
                    &[],
                    Some("Canceled due to errors"),
                    self.clock.now(),
                );
                self.store.persist(&mut order).await?;
                Err(ReconError::Checkout(CHECKOUT_FAILED_MESSAGE.to_string()))
            }
        }
    }

    /// Handles the success redirect for the order of the caller's session.
    ///
    /// Returns whether the order moved to `awaiting_confirmation`. Rejected
    /// callbacks are only logged and leave the order untouched.
    pub async fn handle_success_callback(
        &self,
        session_order_id: &OrderId,
        params: CallbackParams,
    ) -> Result<bool> {
        if &params.id != session_order_id {
            warn!(order_id = %session_order_id, callback_id = %params.id, "Callback id does not match the checkout session");
            return Ok(false);
        }

        let hmac_input = match STANDARD
            .decode(params.hmac_input.as_bytes())
            .map(String::from_utf8)
        {
            Ok(Ok(input)) => input,
            _ => {
                warn!(order_id = %params.id, "Callback hmac_input is not valid base64");
                return Ok(false);
            }
        };

        let validation = CallbackValidation {
            hmac_alg: params.hmac_alg,
            hmac_input,
            hmac_key_id: params.hmac_key_id,
            hmac_value: params.hmac_value,
        };
        match self.provider.validate_callback(&validation).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(order_id = %params.id, "Callback validation rejected");
                return Ok(false);
            }
            Err(err) => {
                error!(order_id = %params.id, error = %err, "validateCallback failed");
                return Ok(false);
            }
        }

        let mut order = self.load(&params.id).await?;
        if !order.transition(
            OrderStatus::AwaitingConfirmation,
            &[OrderStatus::Pending],
            None,
            self.clock.now(),
        ) {
            info!(order_id = %order.id, status = %order.status, "Callback for order that is no longer pending");
            return Ok(false);
        }
        self.store.persist(&mut order).await?;
        info!(order_id = %order.id, "Order awaiting payment confirmation");
        Ok(true)
    }

    /// Handles the cancel redirect.
    pub async fn cancel(&self, id: &OrderId) -> Result<bool> {
        cancel_order(&self.store, self.clock.as_ref(), id).await
    }
}

/// Cancels an order on behalf of the customer unless it already is.
pub async fn cancel_order(store: &SharedOrderStore, clock: &dyn Clock, id: &OrderId) -> Result<bool> {
    let mut order = store
        .get(id)
        .await?
        .ok_or_else(|| ReconError::OrderNotFound(id.clone()))?;
    if order.status == OrderStatus::Canceled {
        return Ok(false);
    }
    order.transition(
        OrderStatus::Canceled,
        &[],
        Some("Canceled by Customer"),
        clock.now(),
    );
    store.persist(&mut order).await?;
    info!(order_id = %id, "Order canceled by customer");
    Ok(true)
}
