//! Per-order synchronization state.
//!
//! Everything the reconciliation loops know about an order beyond the
//! storefront fields lives in [`SyncMeta`]. The terminal markers are folded
//! into [`Lifecycle`] so that "completed" and "hard failed" cannot be
//! confused with the in-flight bookkeeping around them.

use crate::error::ProviderError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Provider-side progress of an order's funds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    #[serde(rename = "payment-received")]
    PaymentReceived,
    SettleInProgress,
    Settled,
    SettleFailed,
    RefundInProgress,
    Refunded,
    RefundFailed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PaymentReceived => "payment-received",
            Self::SettleInProgress => "settle_in_progress",
            Self::Settled => "settled",
            Self::SettleFailed => "settle_failed",
            Self::RefundInProgress => "refund_in_progress",
            Self::Refunded => "refunded",
            Self::RefundFailed => "refund_failed",
        }
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::SettleInProgress | Self::RefundInProgress)
    }

    /// True once the settle/refund path owns the order.
    pub fn is_operation_path(&self) -> bool {
        !matches!(self, Self::PaymentReceived)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The loop that last wrote an order's sync metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataSource {
    OrdersCron,
    PaymentsCron,
    RetryCron,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OrdersCron => "orders-cron",
            Self::PaymentsCron => "payments-cron",
            Self::RetryCron => "retry-cron",
        }
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the retry loop should re-run for an order with a transient error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RetryAction {
    SyncOrder,
    SyncPayment,
    Settle,
    Refund,
    GetPaymentOperation,
}

impl fmt::Display for RetryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SyncOrder => "syncOrder",
            Self::SyncPayment => "syncPayment",
            Self::Settle => "settle",
            Self::Refund => "refund",
            Self::GetPaymentOperation => "getPaymentOperation",
        };
        f.write_str(name)
    }
}

/// Error codes persisted with transient and hard errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ErrorCode {
    /// Payments loop deferred to a recent orders-loop write.
    E102,
    /// Settle request rejected by the provider.
    E103,
    /// Orders loop deferred to a recent payments-loop write or a held lock.
    E200,
    /// Refund request rejected by the provider.
    E205,
    /// Retry ceiling reached.
    E907,
    /// Settle operation failed on chain.
    E908,
    /// Refund operation failed on chain.
    E909,
    /// Raw HTTP status reported by the provider.
    Http(u16),
    /// Provider failure without a status code.
    Provider,
}

impl ErrorCode {
    pub fn from_provider(err: &ProviderError) -> Self {
        err.code.map_or(Self::Provider, Self::Http)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::E102 => f.write_str("E102"),
            Self::E103 => f.write_str("E103"),
            Self::E200 => f.write_str("E200"),
            Self::E205 => f.write_str("E205"),
            Self::E907 => f.write_str("E907"),
            Self::E908 => f.write_str("E908"),
            Self::E909 => f.write_str("E909"),
            Self::Http(code) => write!(f, "{}", code),
            Self::Provider => f.write_str("-1"),
        }
    }
}

impl FromStr for ErrorCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "E102" => Ok(Self::E102),
            "E103" => Ok(Self::E103),
            "E200" => Ok(Self::E200),
            "E205" => Ok(Self::E205),
            "E907" => Ok(Self::E907),
            "E908" => Ok(Self::E908),
            "E909" => Ok(Self::E909),
            "-1" => Ok(Self::Provider),
            other => other
                .parse::<u16>()
                .map(Self::Http)
                .map_err(|_| format!("unknown error code: {}", other)),
        }
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> Self {
        code.to_string()
    }
}

impl TryFrom<String> for ErrorCode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransientError {
    pub code: ErrorCode,
    pub message: String,
    /// Consecutive repeats of the same `(code, action)` pair.
    pub count: u32,
    pub action: RetryAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardError {
    pub code: ErrorCode,
    pub message: String,
    pub action: Option<RetryAction>,
}

/// Terminal markers of an order's reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Lifecycle {
    #[default]
    Active,
    HardFailed(HardError),
    Completed,
}

/// Advisory lock taken before a settle/refund call is issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncLock {
    pub owner: DataSource,
    pub acquired_at: DateTime<Utc>,
}

impl SyncLock {
    pub fn is_live(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.acquired_at < ttl
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncMeta {
    #[serde(default)]
    pub lifecycle: Lifecycle,
    pub payment_status: Option<PaymentStatus>,
    pub data_source: Option<DataSource>,
    /// When `data_source` last wrote this record.
    pub written_at: Option<DateTime<Utc>>,
    pub tx_id: Option<String>,
    pub transient: Option<TransientError>,
    /// Deposit addresses cached from the provider payment.
    pub addresses: Option<serde_json::Value>,
    pub lock: Option<SyncLock>,
}

impl SyncMeta {
    pub fn is_completed(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Completed)
    }

    pub fn hard_error(&self) -> Option<&HardError> {
        match &self.lifecycle {
            Lifecycle::HardFailed(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_hard_failed(&self) -> bool {
        self.hard_error().is_some()
    }

    /// Marks processing as completed and drops any pending retry. Only an
    /// active order can complete.
    pub fn complete(&mut self) -> bool {
        if matches!(self.lifecycle, Lifecycle::Active) {
            self.lifecycle = Lifecycle::Completed;
            self.transient = None;
            true
        } else {
            false
        }
    }

    /// Sets the permanent failure marker. Completed orders stay completed.
    pub fn fail_hard(
        &mut self,
        action: Option<RetryAction>,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> bool {
        if self.is_completed() {
            return false;
        }
        self.lifecycle = Lifecycle::HardFailed(HardError {
            code,
            message: message.into(),
            action,
        });
        true
    }

    /// Manual escape hatch for operators; nothing in the loops calls it.
    pub fn clear_hard_error(&mut self) -> bool {
        if self.is_hard_failed() {
            self.lifecycle = Lifecycle::Active;
            true
        } else {
            false
        }
    }

    /// Records a transient failure and returns the stored repeat counter.
    ///
    /// The counter only grows while the same `(code, action)` pair repeats;
    /// anything else restarts it at zero with the new error context.
    pub fn record_transient(
        &mut self,
        action: RetryAction,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> u32 {
        if let Some(prev) = self.transient.as_mut()
            && prev.code == code
            && prev.action == action
        {
            prev.count += 1;
            return prev.count;
        }
        self.transient = Some(TransientError {
            code,
            message: message.into(),
            count: 0,
            action,
        });
        0
    }

    pub fn clear_transient(&mut self) {
        self.transient = None;
    }

    /// Clears the transient error only if it belongs to `action`.
    pub fn clear_transient_for(&mut self, action: RetryAction) -> bool {
        if self.transient.as_ref().is_some_and(|t| t.action == action) {
            self.transient = None;
            true
        } else {
            false
        }
    }

    pub fn retry_action(&self) -> Option<RetryAction> {
        self.transient.as_ref().map(|t| t.action)
    }

    pub fn stamp(&mut self, source: DataSource, at: DateTime<Utc>) {
        self.data_source = Some(source);
        self.written_at = Some(at);
    }

    /// True when `source` wrote this record less than `window` ago.
    pub fn written_recently_by(
        &self,
        source: DataSource,
        now: DateTime<Utc>,
        window: Duration,
    ) -> bool {
        match (self.data_source, self.written_at) {
            (Some(prev), Some(at)) => prev == source && now - at < window,
            _ => false,
        }
    }

    /// Whether `owner` may take the operation lock at `now`.
    pub fn lock_available(&self, owner: DataSource, now: DateTime<Utc>, ttl: Duration) -> bool {
        match &self.lock {
            Some(lock) => lock.owner == owner || !lock.is_live(now, ttl),
            None => true,
        }
    }

    pub fn processing_completed_label(&self) -> &'static str {
        if self.is_completed() { "yes" } else { "no" }
    }
}
