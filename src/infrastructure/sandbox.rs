//! In-process provider for tests and dry runs.

use crate::domain::order::OrderId;
use crate::domain::payment::{
    CallbackValidation, CheckoutRequest, CheckoutSession, OperationInputs, OperationReceipt, Page,
    Payment, PaymentOperation, Token,
};
use crate::domain::ports::PaymentProvider;
use crate::error::ProviderError;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

type ProviderResult<T> = Result<T, ProviderError>;

/// Provider operations that can be scripted to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderOp {
    CreateCheckout,
    ValidateCallback,
    GetPayment,
    ListPayments,
    GetOperation,
    ListOperations,
    ListTokens,
    Settle,
    Refund,
}

/// A mutating call received by the sandbox.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderCall {
    CreateCheckout(OrderId),
    Settle {
        id: OrderId,
        chain: String,
        token: String,
        amount: Decimal,
    },
    Refund {
        id: OrderId,
        chain: String,
        token: String,
    },
}

/// Scriptable provider that keeps payments and operations in memory.
///
/// Settle and refund create pending operations; tests finish them with
/// [`SandboxProvider::finish_operation`]. Any operation can be made to fail
/// once with [`SandboxProvider::fail_next`].
#[derive(Clone)]
pub struct SandboxProvider {
    payments: Arc<RwLock<BTreeMap<OrderId, Payment>>>,
    operations: Arc<RwLock<HashMap<OrderId, Vec<PaymentOperation>>>>,
    tokens: Arc<RwLock<Vec<Token>>>,
    calls: Arc<RwLock<Vec<ProviderCall>>>,
    fail_next: Arc<RwLock<HashMap<ProviderOp, ProviderError>>>,
    accepted_hmacs: Arc<RwLock<HashSet<String>>>,
    next_tx: Arc<AtomicU64>,
    page_size: usize,
}

impl Default for SandboxProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxProvider {
    pub fn new() -> Self {
        Self::with_page_size(50)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            payments: Arc::new(RwLock::new(BTreeMap::new())),
            operations: Arc::new(RwLock::new(HashMap::new())),
            tokens: Arc::new(RwLock::new(Vec::new())),
            calls: Arc::new(RwLock::new(Vec::new())),
            fail_next: Arc::new(RwLock::new(HashMap::new())),
            accepted_hmacs: Arc::new(RwLock::new(HashSet::new())),
            next_tx: Arc::new(AtomicU64::new(1)),
            page_size: page_size.max(1),
        }
    }

    pub async fn add_token(&self, token: Token) {
        self.tokens.write().await.push(token);
    }

    pub async fn put_payment(&self, payment: Payment) {
        self.payments.write().await.insert(payment.id.clone(), payment);
    }

    pub async fn push_operation(&self, id: &OrderId, operation: PaymentOperation) {
        self.operations
            .write()
            .await
            .entry(id.clone())
            .or_default()
            .push(operation);
    }

    /// Marks a pending operation as mined with the given outcome.
    pub async fn finish_operation(&self, id: &OrderId, tx_id: &str, success: bool) -> bool {
        let mut operations = self.operations.write().await;
        let Some(op) = operations
            .get_mut(id)
            .and_then(|ops| ops.iter_mut().find(|op| op.txid.as_deref() == Some(tx_id)))
        else {
            return false;
        };
        op.status = Some(success);
        op.hash = Some(format!("0x{}", tx_id));
        true
    }

    /// Makes the next call of `op` fail with `err`.
    pub async fn fail_next(&self, op: ProviderOp, err: ProviderError) {
        self.fail_next.write().await.insert(op, err);
    }

    pub async fn accept_hmac(&self, value: impl Into<String>) {
        self.accepted_hmacs.write().await.insert(value.into());
    }

    pub async fn calls(&self) -> Vec<ProviderCall> {
        self.calls.read().await.clone()
    }

    pub async fn settle_count(&self) -> usize {
        self.calls
            .read()
            .await
            .iter()
            .filter(|c| matches!(c, ProviderCall::Settle { .. }))
            .count()
    }

    pub async fn refund_count(&self) -> usize {
        self.calls
            .read()
            .await
            .iter()
            .filter(|c| matches!(c, ProviderCall::Refund { .. }))
            .count()
    }

    async fn check(&self, op: ProviderOp) -> ProviderResult<()> {
        match self.fail_next.write().await.remove(&op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn paginate<T: Clone>(&self, items: &[T], next_token: Option<&str>) -> ProviderResult<Page<T>> {
        let start = match next_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| ProviderError::new(Some(400), format!("invalid nextToken: {}", token)))?,
            None => 0,
        };
        let end = (start + self.page_size).min(items.len());
        let results = items.get(start..end).map(<[T]>::to_vec).unwrap_or_default();
        let next_token = (end < items.len()).then(|| end.to_string());
        Ok(Page {
            results,
            next_token,
        })
    }

    async fn record_operation(
        &self,
        id: &OrderId,
        func_name: &str,
        chain: &str,
        token: &str,
    ) -> OperationReceipt {
        let tx_id = format!("tx-{}", self.next_tx.fetch_add(1, Ordering::SeqCst));
        self.push_operation(
            id,
            PaymentOperation {
                txid: Some(tx_id.clone()),
                hash: None,
                chain: Some(chain.to_string()),
                func_name: Some(func_name.to_string()),
                status: None,
                inputs: OperationInputs {
                    token: Some(token.to_string()),
                },
            },
        )
        .await;
        OperationReceipt { txid: Some(tx_id) }
    }
}

#[async_trait]
impl PaymentProvider for SandboxProvider {
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> ProviderResult<CheckoutSession> {
        self.check(ProviderOp::CreateCheckout).await?;
        self.calls
            .write()
            .await
            .push(ProviderCall::CreateCheckout(request.id.clone()));
        Ok(CheckoutSession {
            url: format!("https://sandbox.invalid/checkout/{}", request.id),
        })
    }

    async fn validate_callback(&self, params: &CallbackValidation) -> ProviderResult<bool> {
        self.check(ProviderOp::ValidateCallback).await?;
        Ok(self.accepted_hmacs.read().await.contains(&params.hmac_value))
    }

    async fn get_payment(&self, id: &OrderId) -> ProviderResult<Payment> {
        self.check(ProviderOp::GetPayment).await?;
        self.payments
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ProviderError::new(Some(404), format!("payment {} not found", id)))
    }

    async fn list_payments(
        &self,
        since: i64,
        next_token: Option<&str>,
    ) -> ProviderResult<Page<Payment>> {
        self.check(ProviderOp::ListPayments).await?;
        let mut payments: Vec<Payment> = self
            .payments
            .read()
            .await
            .values()
            .filter(|p| p.updated_at >= since)
            .cloned()
            .collect();
        payments.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.id.cmp(&b.id)));
        self.paginate(&payments, next_token)
    }

    async fn get_payment_operation(
        &self,
        id: &OrderId,
        tx_id: &str,
    ) -> ProviderResult<PaymentOperation> {
        self.check(ProviderOp::GetOperation).await?;
        self.operations
            .read()
            .await
            .get(id)
            .and_then(|ops| ops.iter().find(|op| op.txid.as_deref() == Some(tx_id)))
            .cloned()
            .ok_or_else(|| ProviderError::new(Some(404), format!("operation {} not found", tx_id)))
    }

    async fn list_payment_operations(
        &self,
        id: &OrderId,
        next_token: Option<&str>,
    ) -> ProviderResult<Page<PaymentOperation>> {
        self.check(ProviderOp::ListOperations).await?;
        let operations = self
            .operations
            .read()
            .await
            .get(id)
            .cloned()
            .unwrap_or_default();
        self.paginate(&operations, next_token)
    }

    async fn list_tokens(&self) -> ProviderResult<Vec<Token>> {
        self.check(ProviderOp::ListTokens).await?;
        Ok(self.tokens.read().await.clone())
    }

    async fn settle(
        &self,
        id: &OrderId,
        chain: &str,
        token: &str,
        amount: Decimal,
    ) -> ProviderResult<OperationReceipt> {
        self.check(ProviderOp::Settle).await?;
        self.calls.write().await.push(ProviderCall::Settle {
            id: id.clone(),
            chain: chain.to_string(),
            token: token.to_string(),
            amount,
        });
        Ok(self.record_operation(id, "settle", chain, token).await)
    }

    async fn refund(&self, id: &OrderId, chain: &str, token: &str) -> ProviderResult<OperationReceipt> {
        self.check(ProviderOp::Refund).await?;
        self.calls.write().await.push(ProviderCall::Refund {
            id: id.clone(),
            chain: chain.to_string(),
            token: token.to_string(),
        });
        Ok(self.record_operation(id, "refundWallet", chain, token).await)
    }
}
