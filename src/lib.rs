//! Payment reconciliation between an order store and a hosted-payment provider.
//!
//! Layout follows ports and adapters: [`domain`] holds the order state
//! machine and the provider contract, [`application`] the synchronizer and
//! its polling loops, [`infrastructure`] the store and provider adapters and
//! [`interfaces`] the CSV edges used by the binary.

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod interfaces;
