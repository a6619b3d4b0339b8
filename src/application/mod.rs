//! Application layer orchestrating the reconciliation of orders and payments.
//!
//! The [`synchronizer::OrderSynchronizer`] holds the per-order state machine.
//! Cron jobs in [`scheduler`] feed it events, either directly or through the
//! sharded [`router::SyncRouter`] so one order is only ever handled by one
//! worker at a time.

pub mod checkout;
pub mod classifier;
pub mod router;
pub mod scheduler;
pub mod synchronizer;
