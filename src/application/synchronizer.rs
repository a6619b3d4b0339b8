//! Order synchronizer.
//!
//! Pushes local order changes to the provider (`sync_order`), pulls provider
//! payment changes into local orders (`sync_payment`), issues settle and
//! refund operations and verifies them once mined. Every provider failure is
//! captured here and persisted on the order; only store failures escape.

use super::classifier::{DEFAULT_RETRY_CEILING, ErrorClassifier};
use crate::domain::order::{Order, OrderId, OrderStatus};
use crate::domain::payment::{Payment, PaymentOperation, explorer_link};
use crate::domain::ports::{SharedClock, SharedOrderStore, SharedProvider};
use crate::domain::resolver::{NormalizedBalance, Resolution, resolve};
use crate::domain::sync::{DataSource, ErrorCode, PaymentStatus, RetryAction, SyncLock};
use crate::error::{ProviderError, ReconError, Result};
use async_trait::async_trait;
use chrono::Duration;
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

/// Tunables of the synchronization passes.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// How long a write by one loop makes the other loop back off.
    pub collision_window: Duration,
    /// How long an order may wait in `awaiting_confirmation`.
    pub await_payment: Duration,
    /// Pause before every settle/refund call.
    pub rate_limit_delay: std::time::Duration,
    pub lock_ttl: Duration,
    pub retry_ceiling: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            collision_window: Duration::minutes(10),
            await_payment: Duration::minutes(1440),
            rate_limit_delay: std::time::Duration::from_millis(300),
            lock_ttl: Duration::minutes(10),
            retry_ceiling: DEFAULT_RETRY_CEILING,
        }
    }
}

/// A provider operation that moves an order's funds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Settle,
    Refund,
}

impl Operation {
    pub fn in_progress(&self) -> PaymentStatus {
        match self {
            Self::Settle => PaymentStatus::SettleInProgress,
            Self::Refund => PaymentStatus::RefundInProgress,
        }
    }

    pub fn completed(&self) -> PaymentStatus {
        match self {
            Self::Settle => PaymentStatus::Settled,
            Self::Refund => PaymentStatus::Refunded,
        }
    }

    pub fn failed(&self) -> PaymentStatus {
        match self {
            Self::Settle => PaymentStatus::SettleFailed,
            Self::Refund => PaymentStatus::RefundFailed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Settle => "settle",
            Self::Refund => "refund",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    HardError,
    RetryActionMismatch,
    Completed,
    OperationInProgress,
    /// The settle/refund path already owns the payment.
    OperationPath,
    NoPendingOrder,
    MissingTxId,
    NothingToVerify,
}

/// What a single synchronization step did to an order.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Skipped(SkipReason),
    /// Backed off with a transient error so the retry loop picks it up.
    Deferred(ErrorCode),
    /// A provider failure was recorded on the order.
    Failed(ErrorCode),
    NoPayment,
    MultiToken,
    PaymentReceived,
    SettleIssued(String),
    RefundIssued(String),
    RefundNotNeeded,
    OperationPending,
    OperationConfirmed(Operation),
    OperationFailed(Operation),
    Completed,
    Expired,
    NoChange,
}

/// Work item for a single order.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    OrderChanged(OrderId),
    PaymentChanged(Payment),
    Retry(OrderId),
    VerifyOperation(OrderId, Operation),
    VerifyCompleteRefund(OrderId),
    ExpireUnconfirmed(OrderId),
}

impl SyncEvent {
    pub fn order_id(&self) -> &OrderId {
        match self {
            Self::OrderChanged(id)
            | Self::Retry(id)
            | Self::VerifyOperation(id, _)
            | Self::VerifyCompleteRefund(id)
            | Self::ExpireUnconfirmed(id) => id,
            Self::PaymentChanged(payment) => &payment.id,
        }
    }
}

/// Something that applies [`SyncEvent`]s, directly or through a queue.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self, event: SyncEvent, source: DataSource) -> Result<SyncOutcome>;
}

#[derive(Clone)]
pub struct OrderSynchronizer {
    store: SharedOrderStore,
    provider: SharedProvider,
    classifier: ErrorClassifier,
    clock: SharedClock,
    settings: SyncSettings,
}

impl OrderSynchronizer {
    pub fn new(
        store: SharedOrderStore,
        provider: SharedProvider,
        clock: SharedClock,
        settings: SyncSettings,
    ) -> Self {
        let classifier = ErrorClassifier::new(store.clone(), settings.retry_ceiling);
        Self {
            store,
            provider,
            classifier,
            clock,
            settings,
        }
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    pub fn store(&self) -> &SharedOrderStore {
        &self.store
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    async fn load(&self, id: &OrderId) -> Result<Order> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| ReconError::OrderNotFound(id.clone()))
    }

    /// Applies one event to its order.
    pub async fn handle(&self, event: SyncEvent, source: DataSource) -> Result<SyncOutcome> {
        match event {
            SyncEvent::OrderChanged(id) => {
                let mut order = self.load(&id).await?;
                self.sync_order(&mut order, source).await
            }
            SyncEvent::PaymentChanged(payment) => self.sync_payment(&payment, source).await,
            SyncEvent::Retry(id) => self.retry_order(&id).await,
            SyncEvent::VerifyOperation(id, operation) => {
                let mut order = self.load(&id).await?;
                self.verify_order_operation(&mut order, operation, source).await
            }
            SyncEvent::VerifyCompleteRefund(id) => {
                let mut order = self.load(&id).await?;
                self.verify_order_refund(&mut order, source).await
            }
            SyncEvent::ExpireUnconfirmed(id) => {
                let mut order = self.load(&id).await?;
                self.expire_if_unconfirmed(&mut order, source).await
            }
        }
    }

    /// Shared guard sequence of `sync_order` and `sync_payment`.
    fn guard(&self, order: &Order, action: RetryAction) -> Option<SkipReason> {
        let sync = &order.sync;
        if sync.is_hard_failed() {
            return Some(SkipReason::HardError);
        }
        if sync.retry_action().is_some_and(|pending| pending != action) {
            return Some(SkipReason::RetryActionMismatch);
        }
        if sync.is_completed() {
            return Some(SkipReason::Completed);
        }
        if sync.payment_status.is_some_and(|s| s.is_in_progress()) {
            return Some(SkipReason::OperationInProgress);
        }
        None
    }

    /// Pushes a local order change to the provider.
    pub async fn sync_order(&self, order: &mut Order, source: DataSource) -> Result<SyncOutcome> {
        if let Some(reason) = self.guard(order, RetryAction::SyncOrder) {
            debug!(order_id = %order.id, %source, ?reason, "syncOrder skipped");
            return Ok(SyncOutcome::Skipped(reason));
        }

        let now = self.clock.now();
        if source == DataSource::OrdersCron
            && order.sync.written_recently_by(
                DataSource::PaymentsCron,
                now,
                self.settings.collision_window,
            )
        {
            self.classifier
                .transient(
                    order,
                    RetryAction::SyncOrder,
                    ErrorCode::E200,
                    "Skipping syncOrder at this time as payments-cron updated this order recently, will be re-tried again",
                )
                .await?;
            return Ok(SyncOutcome::Deferred(ErrorCode::E200));
        }

        let balance = match self.token_balance(order, None).await {
            Ok(Resolution::Single(balance)) => balance,
            Ok(Resolution::MultiToken(balances)) => {
                return self.mark_multi_token(order, balances.len(), source).await;
            }
            Ok(Resolution::NotFound) => {
                info!(order_id = %order.id, %source, "syncOrder: payment is blank");
                return Ok(SyncOutcome::NoPayment);
            }
            Err(err) => {
                error!(order_id = %order.id, %source, error = %err, "syncOrder: token balance lookup failed");
                self.classifier
                    .classify(order, RetryAction::SyncOrder, &err)
                    .await?;
                return Ok(SyncOutcome::Failed(ErrorCode::from_provider(&err)));
            }
        };

        match order.status {
            OrderStatus::Complete => {
                info!(order_id = %order.id, %source, "syncOrder: settling payment");
                self.settle_order(order, &balance, source).await
            }
            OrderStatus::Canceled => {
                info!(order_id = %order.id, %source, "syncOrder: refunding payment");
                self.refund_order(order, Some(&balance), source).await
            }
            status => {
                info!(order_id = %order.id, %source, %status, "syncOrder: unhandled order status");
                Ok(SyncOutcome::NoChange)
            }
        }
    }

    /// Pulls a provider payment change into its pending order.
    pub async fn sync_payment(&self, payment: &Payment, source: DataSource) -> Result<SyncOutcome> {
        let Some(mut order) = self
            .store
            .get(&payment.id)
            .await?
            .filter(|o| OrderStatus::AWAITING_PAYMENT.contains(&o.status))
        else {
            debug!(order_id = %payment.id, %source, "syncPayment: no pending order");
            return Ok(SyncOutcome::Skipped(SkipReason::NoPendingOrder));
        };
        let order = &mut order;

        if let Some(reason) = self.guard(order, RetryAction::SyncPayment) {
            debug!(order_id = %order.id, %source, ?reason, "syncPayment skipped");
            return Ok(SyncOutcome::Skipped(reason));
        }
        if let Some(status) = order.sync.payment_status.filter(|s| s.is_operation_path()) {
            info!(order_id = %order.id, %source, payment_status = %status, "syncPayment: operation path owns this order");
            return Ok(SyncOutcome::Skipped(SkipReason::OperationPath));
        }

        let now = self.clock.now();
        if source == DataSource::PaymentsCron
            && order.sync.written_recently_by(
                DataSource::OrdersCron,
                now,
                self.settings.collision_window,
            )
        {
            self.classifier
                .transient(
                    order,
                    RetryAction::SyncPayment,
                    ErrorCode::E102,
                    "Skipping payment processing at this time as orders-cron processed this order recently, will be processing again later",
                )
                .await?;
            return Ok(SyncOutcome::Deferred(ErrorCode::E102));
        }

        if order.sync.addresses.as_ref() != Some(&payment.addresses) {
            order.sync.addresses = Some(payment.addresses.clone());
            self.store.persist(order).await?;
        }

        let balance = match self.token_balance(order, Some(payment)).await {
            Ok(Resolution::Single(balance)) => balance,
            Ok(Resolution::MultiToken(balances)) => {
                return self.mark_multi_token(order, balances.len(), source).await;
            }
            Ok(Resolution::NotFound) => {
                self.settle_own_transient(order, RetryAction::SyncPayment).await?;
                return Ok(SyncOutcome::NoPayment);
            }
            Err(err) => {
                error!(order_id = %order.id, %source, error = %err, "syncPayment: token balance lookup failed");
                self.classifier
                    .classify(order, RetryAction::SyncPayment, &err)
                    .await?;
                return Ok(SyncOutcome::Failed(ErrorCode::from_provider(&err)));
            }
        };

        info!(
            order_id = %order.id,
            %source,
            amount = %balance.balance,
            order_value = %order.grand_total,
            "syncPayment: resolved payment"
        );
        if balance.balance < order.grand_total {
            self.settle_own_transient(order, RetryAction::SyncPayment).await?;
            return Ok(SyncOutcome::NoChange);
        }

        order.transition(OrderStatus::Processing, &OrderStatus::AWAITING_PAYMENT, None, now);
        order.sync.payment_status = Some(PaymentStatus::PaymentReceived);
        order.sync.clear_transient_for(RetryAction::SyncPayment);
        order.sync.stamp(source, now);
        self.store.persist(order).await?;
        info!(order_id = %order.id, %source, "syncPayment: order set to processing");
        Ok(SyncOutcome::PaymentReceived)
    }

    /// Transfers the order total to the merchant.
    pub async fn settle_order(
        &self,
        order: &mut Order,
        balance: &NormalizedBalance,
        source: DataSource,
    ) -> Result<SyncOutcome> {
        if !self.acquire_lock(order, source).await? {
            return Ok(SyncOutcome::Deferred(ErrorCode::E200));
        }
        self.pause().await;

        let amount = order.grand_total;
        match self
            .provider
            .settle(&order.id, balance.chain(), balance.token(), amount)
            .await
        {
            Err(err) => {
                order.sync.lock = None;
                let message = format!("settlePayment failed: order-id: {}; response: {}", order.id, err);
                self.classifier
                    .transient(order, RetryAction::SyncOrder, ErrorCode::E103, &message)
                    .await?;
                Ok(SyncOutcome::Failed(ErrorCode::E103))
            }
            Ok(receipt) => {
                self.record_operation(order, Operation::Settle, receipt.txid, source)
                    .await
            }
        }
    }

    /// Returns the payer's funds for one balance.
    ///
    /// Without a positive balance there is nothing to transfer; the order is
    /// only stamped and its transient error cleared.
    pub async fn refund_order(
        &self,
        order: &mut Order,
        balance: Option<&NormalizedBalance>,
        source: DataSource,
    ) -> Result<SyncOutcome> {
        let Some(balance) = balance.filter(|b| b.balance > Decimal::ZERO) else {
            order.sync.clear_transient();
            order.sync.stamp(source, self.clock.now());
            self.store.persist(order).await?;
            info!(order_id = %order.id, %source, "refundOrder: nothing to refund");
            return Ok(SyncOutcome::RefundNotNeeded);
        };

        if !self.acquire_lock(order, source).await? {
            return Ok(SyncOutcome::Deferred(ErrorCode::E200));
        }
        self.pause().await;

        match self
            .provider
            .refund(&order.id, balance.chain(), balance.token())
            .await
        {
            Err(err) => {
                order.sync.lock = None;
                order.sync.stamp(source, self.clock.now());
                let message = format!("refundPayment failed: order-id: {}; response: {}", order.id, err);
                self.classifier
                    .transient(order, RetryAction::SyncOrder, ErrorCode::E205, &message)
                    .await?;
                Ok(SyncOutcome::Failed(ErrorCode::E205))
            }
            Ok(receipt) => {
                self.record_operation(order, Operation::Refund, receipt.txid, source)
                    .await
            }
        }
    }

    async fn record_operation(
        &self,
        order: &mut Order,
        operation: Operation,
        tx_id: Option<String>,
        source: DataSource,
    ) -> Result<SyncOutcome> {
        order.sync.lock = None;
        order.sync.stamp(source, self.clock.now());
        let Some(tx_id) = tx_id else {
            self.store.persist(order).await?;
            warn!(order_id = %order.id, %source, operation = operation.as_str(), "Provider returned no tx-id");
            return Ok(SyncOutcome::NoChange);
        };

        order.sync.tx_id = Some(tx_id.clone());
        order.sync.payment_status = Some(operation.in_progress());
        order.sync.clear_transient();
        self.store.persist(order).await?;
        info!(order_id = %order.id, %source, tx_id = %tx_id, operation = operation.as_str(), "Operation invoked");

        Ok(match operation {
            Operation::Settle => SyncOutcome::SettleIssued(tx_id),
            Operation::Refund => SyncOutcome::RefundIssued(tx_id),
        })
    }

    /// Takes the per-order operation lock, recording `E200` when it is held.
    async fn acquire_lock(&self, order: &mut Order, source: DataSource) -> Result<bool> {
        let now = self.clock.now();
        let busy = order.sync.payment_status.is_some_and(|s| s.is_in_progress())
            || !order.sync.lock_available(source, now, self.settings.lock_ttl);
        if busy {
            self.classifier
                .transient(
                    order,
                    RetryAction::SyncOrder,
                    ErrorCode::E200,
                    "Operation lock held by another loop, will be re-tried again",
                )
                .await?;
            return Ok(false);
        }
        order.sync.lock = Some(SyncLock {
            owner: source,
            acquired_at: now,
        });
        self.store.persist(order).await?;
        Ok(true)
    }

    async fn pause(&self) {
        if !self.settings.rate_limit_delay.is_zero() {
            tokio::time::sleep(self.settings.rate_limit_delay).await;
        }
    }

    /// Checks whether the order's in-flight operation has been mined.
    pub async fn verify_order_operation(
        &self,
        order: &mut Order,
        operation: Operation,
        source: DataSource,
    ) -> Result<SyncOutcome> {
        if order.sync.is_hard_failed() {
            return Ok(SyncOutcome::Skipped(SkipReason::HardError));
        }
        if order.sync.payment_status != Some(operation.in_progress()) {
            return Ok(SyncOutcome::Skipped(SkipReason::NothingToVerify));
        }
        let Some(tx_id) = order.sync.tx_id.clone() else {
            error!(order_id = %order.id, %source, operation = operation.as_str(), "verifyOperationCompletion: tx-id is not set");
            return Ok(SyncOutcome::Skipped(SkipReason::MissingTxId));
        };

        let result: std::result::Result<PaymentOperation, ProviderError> =
            self.provider.get_payment_operation(&order.id, &tx_id).await;
        let op = match result {
            Ok(op) => op,
            Err(err) => {
                error!(order_id = %order.id, %source, tx_id = %tx_id, error = %err, "getPaymentOperation failed");
                let message = format!("getPaymentOperation failed: payment-id: {} tx_id: {} response: {}", order.id, tx_id, err);
                let err = ProviderError::new(err.code, message);
                self.classifier
                    .classify(order, RetryAction::GetPaymentOperation, &err)
                    .await?;
                return Ok(SyncOutcome::Failed(ErrorCode::from_provider(&err)));
            }
        };

        let now = self.clock.now();
        match op.status {
            None => {
                self.settle_own_transient(order, RetryAction::GetPaymentOperation)
                    .await?;
                debug!(order_id = %order.id, %source, tx_id = %tx_id, "Operation still pending");
                Ok(SyncOutcome::OperationPending)
            }
            Some(true) => {
                let hash = op.hash.as_deref().unwrap_or_default();
                let note = match op.chain.as_deref().and_then(|chain| explorer_link(hash, chain)) {
                    Some(link) => format!("Tx hash for transfer {} Transaction Link : {}", hash, link),
                    None => format!("Tx hash for transfer {}", hash),
                };
                order.add_note(note);
                order.sync.payment_status = Some(operation.completed());
                order.sync.lock = None;
                order.sync.clear_transient_for(RetryAction::GetPaymentOperation);
                if operation == Operation::Settle {
                    order.sync.complete();
                }
                order.sync.stamp(source, now);
                self.store.persist(order).await?;
                info!(order_id = %order.id, %source, tx_id = %tx_id, operation = operation.as_str(), "Operation confirmed");
                Ok(SyncOutcome::OperationConfirmed(operation))
            }
            Some(false) => {
                order.sync.payment_status = Some(operation.failed());
                order.sync.lock = None;
                order.sync.stamp(source, now);
                let message = "payment operation failed";
                match operation {
                    Operation::Settle => {
                        self.classifier
                            .transient(order, RetryAction::Settle, ErrorCode::E908, message)
                            .await?;
                    }
                    Operation::Refund => {
                        self.classifier
                            .hard(order, Some(RetryAction::Refund), ErrorCode::E909, message)
                            .await?;
                    }
                }
                error!(order_id = %order.id, %source, tx_id = %tx_id, operation = operation.as_str(), "{}", message);
                Ok(SyncOutcome::OperationFailed(operation))
            }
        }
    }

    /// Makes sure every funded token of a refunded order was paid back.
    ///
    /// Re-issues at most one refund per pass; completes the order once no
    /// unrefunded balance remains.
    pub async fn verify_order_refund(
        &self,
        order: &mut Order,
        source: DataSource,
    ) -> Result<SyncOutcome> {
        if order.sync.is_hard_failed() {
            return Ok(SyncOutcome::Skipped(SkipReason::HardError));
        }
        if order.sync.is_completed() {
            return Ok(SyncOutcome::Skipped(SkipReason::Completed));
        }
        if order.sync.payment_status != Some(PaymentStatus::Refunded) {
            return Ok(SyncOutcome::Skipped(SkipReason::NothingToVerify));
        }

        let balances = match self.token_balance(order, None).await {
            Ok(Resolution::Single(balance)) => vec![balance],
            Ok(Resolution::MultiToken(balances)) => balances,
            Ok(Resolution::NotFound) => Vec::new(),
            Err(err) => {
                warn!(order_id = %order.id, %source, error = %err, "verifyCompleteRefund: token balance lookup failed");
                return Ok(SyncOutcome::NoChange);
            }
        };
        if balances.is_empty() {
            return self.complete(order, source).await;
        }

        let operations = match self.operation_history(&order.id).await {
            Ok(operations) => operations,
            Err(err) => {
                warn!(order_id = %order.id, %source, error = %err, "verifyCompleteRefund: listPaymentOperations failed");
                return Ok(SyncOutcome::NoChange);
            }
        };

        let pending = balances
            .iter()
            .find(|b| !operations.iter().any(|op| op.refunded(&b.key)))
            .cloned();
        match pending {
            Some(balance) => {
                info!(order_id = %order.id, %source, token = balance.token(), chain = balance.chain(), "verifyCompleteRefund: refunding remaining balance");
                self.refund_order(order, Some(&balance), source).await
            }
            None => self.complete(order, source).await,
        }
    }

    /// Fails an order that waited too long in `awaiting_confirmation`.
    pub async fn expire_if_unconfirmed(
        &self,
        order: &mut Order,
        source: DataSource,
    ) -> Result<SyncOutcome> {
        if order.status != OrderStatus::AwaitingConfirmation {
            return Ok(SyncOutcome::Skipped(SkipReason::NothingToVerify));
        }

        let now = self.clock.now();
        let elapsed = now - order.updated_at;
        if elapsed <= self.settings.await_payment {
            return Ok(SyncOutcome::NoChange);
        }

        order.transition(
            OrderStatus::PaymentFailed,
            &[OrderStatus::AwaitingConfirmation],
            Some("Payment Failed."),
            now,
        );
        order.sync.stamp(source, now);
        self.store.persist(order).await?;
        info!(
            order_id = %order.id,
            %source,
            elapsed_minutes = elapsed.num_minutes(),
            "Payment confirmation not received before cut-off time"
        );
        Ok(SyncOutcome::Expired)
    }

    /// Re-runs whatever previously failed transiently on this order.
    pub async fn retry_order(&self, id: &OrderId) -> Result<SyncOutcome> {
        if self.classifier.check_retry_count(id).await? {
            info!(order_id = %id, "retry-cron: skipping, hard error found");
            return Ok(SyncOutcome::Skipped(SkipReason::HardError));
        }

        let mut order = self.load(id).await?;
        if order.sync.is_completed() {
            return Ok(SyncOutcome::Skipped(SkipReason::Completed));
        }
        let Some(action) = order.sync.retry_action() else {
            return Ok(SyncOutcome::NoChange);
        };
        let source = DataSource::RetryCron;
        info!(order_id = %id, %action, "retry-cron: retrying");

        let outcome = match action {
            RetryAction::SyncOrder => self.sync_order(&mut order, source).await?,
            RetryAction::SyncPayment => match self.provider.get_payment(id).await {
                Ok(payment) => self.sync_payment(&payment, source).await?,
                Err(err) => {
                    self.classifier.classify(&mut order, action, &err).await?;
                    SyncOutcome::Failed(ErrorCode::from_provider(&err))
                }
            },
            RetryAction::Settle | RetryAction::Refund => {
                match self.token_balance(&order, None).await {
                    Ok(Resolution::Single(balance)) if action == RetryAction::Settle => {
                        self.settle_order(&mut order, &balance, source).await?
                    }
                    Ok(Resolution::Single(balance)) => {
                        self.refund_order(&mut order, Some(&balance), source).await?
                    }
                    Ok(Resolution::NotFound) if action == RetryAction::Refund => {
                        self.refund_order(&mut order, None, source).await?
                    }
                    Ok(Resolution::MultiToken(balances)) => {
                        self.mark_multi_token(&mut order, balances.len(), source)
                            .await?
                    }
                    Ok(Resolution::NotFound) => SyncOutcome::NoPayment,
                    Err(err) => {
                        self.classifier.classify(&mut order, action, &err).await?;
                        SyncOutcome::Failed(ErrorCode::from_provider(&err))
                    }
                }
            }
            RetryAction::GetPaymentOperation => match order.sync.payment_status {
                Some(PaymentStatus::SettleInProgress) => {
                    self.verify_order_operation(&mut order, Operation::Settle, source)
                        .await?
                }
                Some(PaymentStatus::RefundInProgress) => {
                    self.verify_order_operation(&mut order, Operation::Refund, source)
                        .await?
                }
                _ => SyncOutcome::NoChange,
            },
        };

        // A retry that found nothing left to do must not keep the order queued.
        if matches!(
            outcome,
            SyncOutcome::Skipped(_)
                | SyncOutcome::NoChange
                | SyncOutcome::NoPayment
                | SyncOutcome::MultiToken
        ) {
            let mut latest = self.load(id).await?;
            if !latest.sync.is_hard_failed() {
                self.settle_own_transient(&mut latest, action).await?;
            }
        }
        Ok(outcome)
    }

    /// Resolves the order's payment, fetching it when not supplied.
    ///
    /// A payment the provider does not know (`404`) resolves to nothing.
    async fn token_balance(
        &self,
        order: &Order,
        payment: Option<&Payment>,
    ) -> std::result::Result<Resolution, ProviderError> {
        let fetched;
        let payment = match payment {
            Some(payment) => payment,
            None => match self.provider.get_payment(&order.id).await {
                Ok(payment) => {
                    fetched = payment;
                    &fetched
                }
                Err(err) if err.code == Some(404) => return Ok(Resolution::NotFound),
                Err(err) => return Err(err),
            },
        };
        let tokens = self.provider.list_tokens().await?;
        let resolution = resolve(payment, &tokens, &order.currency);
        debug!(order_id = %order.id, ?resolution, "Resolved token balance");
        Ok(resolution)
    }

    /// All operations the provider recorded for a payment, across pages.
    async fn operation_history(
        &self,
        id: &OrderId,
    ) -> std::result::Result<Vec<PaymentOperation>, ProviderError> {
        let mut operations = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let page = self
                .provider
                .list_payment_operations(id, next_token.as_deref())
                .await?;
            next_token = page.next().map(str::to_string);
            operations.extend(page.results);
            if next_token.is_none() {
                return Ok(operations);
            }
        }
    }

    async fn mark_multi_token(
        &self,
        order: &mut Order,
        balance_count: usize,
        source: DataSource,
    ) -> Result<SyncOutcome> {
        let now = self.clock.now();
        if order.transition(
            OrderStatus::MultiTokenPayment,
            &OrderStatus::MULTI_TOKEN_FROM,
            Some("Multi Token Payment."),
            now,
        ) {
            order.sync.stamp(source, now);
            self.store.persist(order).await?;
            info!(order_id = %order.id, %source, balance_count, "More than one token balance found, order status changed to multi_token_payment");
        }
        Ok(SyncOutcome::MultiToken)
    }

    async fn complete(&self, order: &mut Order, source: DataSource) -> Result<SyncOutcome> {
        order.sync.complete();
        order.sync.stamp(source, self.clock.now());
        self.store.persist(order).await?;
        info!(order_id = %order.id, %source, "Processing completed");
        Ok(SyncOutcome::Completed)
    }

    /// Clears a transient error owned by `action`, persisting only on change.
    async fn settle_own_transient(&self, order: &mut Order, action: RetryAction) -> Result<()> {
        if order.sync.clear_transient_for(action) {
            self.store.persist(order).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Dispatch for OrderSynchronizer {
    async fn dispatch(&self, event: SyncEvent, source: DataSource) -> Result<SyncOutcome> {
        self.handle(event, source).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::payment::{BalanceKey, Token, TokenBalance};
    use crate::domain::ports::{Clock, OrderStore};
    use crate::infrastructure::clock::ManualClock;
    use crate::infrastructure::in_memory::InMemoryOrderStore;
    use crate::infrastructure::sandbox::{ProviderOp, SandboxProvider};
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    struct Harness {
        sync: OrderSynchronizer,
        store: Arc<InMemoryOrderStore>,
        sandbox: SandboxProvider,
        clock: ManualClock,
    }

    async fn harness() -> Harness {
        let store = Arc::new(InMemoryOrderStore::new());
        let sandbox = SandboxProvider::new();
        sandbox
            .add_token(Token {
                network: "ethereum".into(),
                chain: "goerli".into(),
                addr: "0xusdc".into(),
                currency: "USD".into(),
            })
            .await;
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 4, 1, 12, 0, 0).unwrap());
        let settings = SyncSettings {
            rate_limit_delay: std::time::Duration::ZERO,
            ..SyncSettings::default()
        };
        let sync = OrderSynchronizer::new(
            store.clone(),
            Arc::new(sandbox.clone()),
            Arc::new(clock.clone()),
            settings,
        );
        Harness {
            sync,
            store,
            sandbox,
            clock,
        }
    }

    impl Harness {
        async fn order(&self, id: &str, status: OrderStatus) -> Order {
            let order = Order::new(id, dec!(100), "USD", status, self.clock.now());
            self.store.insert(order.clone()).await.unwrap();
            order
        }

        async fn fund(&self, id: &str, amount: Decimal) {
            let payment = Payment::new(id, self.clock.now().timestamp()).with_balance(
                BalanceKey::new("ethereum", "goerli", "0xusdc"),
                TokenBalance::new(amount, 6),
            );
            self.sandbox.put_payment(payment).await;
        }

        async fn get(&self, id: &str) -> Order {
            self.store.get(&OrderId::new(id)).await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn test_hard_failed_order_is_skipped() {
        let h = harness().await;
        let mut order = h.order("1", OrderStatus::Complete).await;
        h.fund("1", dec!(100)).await;
        order.sync.fail_hard(None, ErrorCode::E909, "refund failed");
        h.store.persist(&mut order).await.unwrap();

        let outcome = h.sync.sync_order(&mut order, DataSource::OrdersCron).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Skipped(SkipReason::HardError));
        assert_eq!(h.sandbox.settle_count().await, 0);
    }

    #[tokio::test]
    async fn test_transient_for_other_action_blocks_sync_order() {
        let h = harness().await;
        let mut order = h.order("1", OrderStatus::Complete).await;
        h.fund("1", dec!(100)).await;
        order.sync.record_transient(RetryAction::SyncPayment, ErrorCode::E102, "deferred");
        h.store.persist(&mut order).await.unwrap();

        let outcome = h.sync.sync_order(&mut order, DataSource::OrdersCron).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Skipped(SkipReason::RetryActionMismatch));
    }

    #[tokio::test]
    async fn test_multi_token_payment_marks_order() {
        let h = harness().await;
        let mut order = h.order("1", OrderStatus::Pending).await;
        let payment = Payment::new("1", 0)
            .with_balance(
                BalanceKey::new("ethereum", "goerli", "0xusdc"),
                TokenBalance::new(dec!(60), 6),
            )
            .with_balance(
                BalanceKey::new("ethereum", "goerli", "0xdai"),
                TokenBalance::new(dec!(40), 18),
            );

        let outcome = h.sync.sync_payment(&payment, DataSource::PaymentsCron).await.unwrap();
        assert_eq!(outcome, SyncOutcome::MultiToken);
        order = h.get("1").await;
        assert_eq!(order.status, OrderStatus::MultiTokenPayment);
        assert_eq!(order.notes, vec!["Multi Token Payment.".to_string()]);
    }

    #[tokio::test]
    async fn test_sync_payment_requires_full_amount() {
        let h = harness().await;
        h.order("1", OrderStatus::Pending).await;
        let short = Payment::new("1", 0).with_balance(
            BalanceKey::new("ethereum", "goerli", "0xusdc"),
            TokenBalance::new(dec!(99.99), 6),
        );
        let outcome = h.sync.sync_payment(&short, DataSource::PaymentsCron).await.unwrap();
        assert_eq!(outcome, SyncOutcome::NoChange);
        assert_eq!(h.get("1").await.status, OrderStatus::Pending);

        let full = Payment::new("1", 0).with_balance(
            BalanceKey::new("ethereum", "goerli", "0xusdc"),
            TokenBalance::new(dec!(100), 6),
        );
        let outcome = h.sync.sync_payment(&full, DataSource::PaymentsCron).await.unwrap();
        assert_eq!(outcome, SyncOutcome::PaymentReceived);
        let order = h.get("1").await;
        assert_eq!(order.status, OrderStatus::Processing);
        assert_eq!(order.sync.payment_status, Some(PaymentStatus::PaymentReceived));
        assert_eq!(order.sync.data_source, Some(DataSource::PaymentsCron));
        assert!(order.sync.addresses.is_some());
    }

    #[tokio::test]
    async fn test_payments_loop_defers_to_recent_orders_loop_write() {
        let h = harness().await;
        let mut order = h.order("1", OrderStatus::Pending).await;
        order.sync.stamp(DataSource::OrdersCron, h.clock.now());
        h.store.persist(&mut order).await.unwrap();
        h.clock.advance(Duration::minutes(3));

        let payment = Payment::new("1", 0);
        let outcome = h.sync.sync_payment(&payment, DataSource::PaymentsCron).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Deferred(ErrorCode::E102));

        let transient = h.get("1").await.sync.transient.unwrap();
        assert_eq!(transient.code, ErrorCode::E102);
        assert_eq!(transient.action, RetryAction::SyncPayment);
    }

    #[tokio::test]
    async fn test_settle_provider_error_is_transient_e103() {
        let h = harness().await;
        let mut order = h.order("1", OrderStatus::Complete).await;
        h.fund("1", dec!(100)).await;
        h.sandbox
            .fail_next(ProviderOp::Settle, ProviderError::new(Some(502), "bad gateway"))
            .await;

        let outcome = h.sync.sync_order(&mut order, DataSource::OrdersCron).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Failed(ErrorCode::E103));

        let order = h.get("1").await;
        let transient = order.sync.transient.unwrap();
        assert_eq!(transient.code, ErrorCode::E103);
        assert_eq!(transient.action, RetryAction::SyncOrder);
        assert!(order.sync.lock.is_none());
        assert!(order.sync.payment_status.is_none());
    }

    #[tokio::test]
    async fn test_live_lock_defers_operation() {
        let h = harness().await;
        let mut order = h.order("1", OrderStatus::Complete).await;
        h.fund("1", dec!(100)).await;
        order.sync.lock = Some(SyncLock {
            owner: DataSource::RetryCron,
            acquired_at: h.clock.now(),
        });
        h.store.persist(&mut order).await.unwrap();

        let outcome = h.sync.sync_order(&mut order, DataSource::OrdersCron).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Deferred(ErrorCode::E200));
        assert_eq!(h.sandbox.settle_count().await, 0);

        // An expired lock is taken over.
        h.clock.advance(Duration::minutes(11));
        let mut order = h.get("1").await;
        order.sync.clear_transient();
        h.store.persist(&mut order).await.unwrap();
        let outcome = h.sync.sync_order(&mut order, DataSource::OrdersCron).await.unwrap();
        assert!(matches!(outcome, SyncOutcome::SettleIssued(_)));
    }

    #[tokio::test]
    async fn test_refund_without_balance_makes_no_call() {
        let h = harness().await;
        let mut order = h.order("1", OrderStatus::Canceled).await;
        order.sync.record_transient(RetryAction::SyncOrder, ErrorCode::E205, "earlier failure");
        h.store.persist(&mut order).await.unwrap();

        let outcome = h
            .sync
            .refund_order(&mut order, None, DataSource::OrdersCron)
            .await
            .unwrap();
        assert_eq!(outcome, SyncOutcome::RefundNotNeeded);
        assert_eq!(h.sandbox.refund_count().await, 0);

        let order = h.get("1").await;
        assert!(order.sync.transient.is_none());
        assert_eq!(order.sync.data_source, Some(DataSource::OrdersCron));
    }

    #[tokio::test]
    async fn test_missing_tx_id_is_skipped() {
        let h = harness().await;
        let mut order = h.order("1", OrderStatus::Complete).await;
        order.sync.payment_status = Some(PaymentStatus::SettleInProgress);
        h.store.persist(&mut order).await.unwrap();

        let outcome = h
            .sync
            .verify_order_operation(&mut order, Operation::Settle, DataSource::OrdersCron)
            .await
            .unwrap();
        assert_eq!(outcome, SyncOutcome::Skipped(SkipReason::MissingTxId));
        assert_eq!(h.get("1").await.sync.payment_status, Some(PaymentStatus::SettleInProgress));
    }

    #[tokio::test]
    async fn test_operation_read_failure_is_classified() {
        let h = harness().await;
        let mut order = h.order("1", OrderStatus::Complete).await;
        order.sync.payment_status = Some(PaymentStatus::SettleInProgress);
        order.sync.tx_id = Some("tx-9".into());
        h.store.persist(&mut order).await.unwrap();

        h.sandbox
            .fail_next(ProviderOp::GetOperation, ProviderError::new(Some(500), "boom"))
            .await;
        let outcome = h
            .sync
            .verify_order_operation(&mut order, Operation::Settle, DataSource::OrdersCron)
            .await
            .unwrap();
        assert_eq!(outcome, SyncOutcome::Failed(ErrorCode::Http(500)));
        let transient = h.get("1").await.sync.transient.unwrap();
        assert_eq!(transient.action, RetryAction::GetPaymentOperation);
    }

    #[tokio::test]
    async fn test_retry_of_stale_sync_payment_clears_transient() {
        let h = harness().await;
        let mut order = h.order("1", OrderStatus::Canceled).await;
        order.sync.record_transient(RetryAction::SyncPayment, ErrorCode::E102, "deferred");
        h.store.persist(&mut order).await.unwrap();
        h.fund("1", dec!(100)).await;

        let outcome = h.sync.retry_order(&OrderId::new("1")).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Skipped(SkipReason::NoPendingOrder));
        assert!(h.get("1").await.sync.transient.is_none());
    }

    #[tokio::test]
    async fn test_cut_off_applies_to_hard_failed_orders() {
        let h = harness().await;
        let mut order = h.order("1", OrderStatus::AwaitingConfirmation).await;
        order.sync.fail_hard(None, ErrorCode::Http(400), "bad request");
        h.store.persist(&mut order).await.unwrap();
        h.clock.advance(Duration::minutes(1441));

        let outcome = h
            .sync
            .expire_if_unconfirmed(&mut order, DataSource::OrdersCron)
            .await
            .unwrap();
        assert_eq!(outcome, SyncOutcome::Expired);

        let order = h.get("1").await;
        assert_eq!(order.status, OrderStatus::PaymentFailed);
        assert_eq!(order.notes, vec!["Payment Failed.".to_string()]);
    }

    #[tokio::test]
    async fn test_retry_never_writes_a_completed_order() {
        let h = harness().await;
        let mut order = h.order("1", OrderStatus::Canceled).await;
        order.sync.complete();
        order.sync.record_transient(RetryAction::Refund, ErrorCode::Http(503), "unavailable");
        h.store.persist(&mut order).await.unwrap();
        h.fund("1", dec!(100)).await;
        let version = h.get("1").await.version;

        let outcome = h.sync.retry_order(&OrderId::new("1")).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Skipped(SkipReason::Completed));
        assert_eq!(h.get("1").await.version, version);
        assert!(h.sandbox.calls().await.is_empty());
    }
}
