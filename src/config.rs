//! Configuration for payrecon.

use crate::application::synchronizer::SyncSettings;
use crate::error::{ReconError, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable that overrides `provider.api_key`.
pub const API_KEY_ENV: &str = "PAYRECON_API_KEY";

/// Payment provider connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// API key sent with every request.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Per-request timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.pay.bleumi.io".to_string()
}

const fn default_timeout_secs() -> u64 {
    30
}

/// Synchronization tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Minutes during which a write by one loop makes the other back off.
    #[serde(default = "default_collision_window_minutes")]
    pub collision_window_minutes: i64,

    /// Minutes an order may stay in `awaiting_confirmation`.
    #[serde(default = "default_await_payment_minutes")]
    pub await_payment_minutes: i64,

    /// Pause before every settle/refund call.
    #[serde(default = "default_rate_limit_delay_ms")]
    pub rate_limit_delay_ms: u64,

    /// Repeats of one transient failure before it becomes hard.
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling: u32,

    #[serde(default = "default_lock_ttl_minutes")]
    pub lock_ttl_minutes: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            collision_window_minutes: default_collision_window_minutes(),
            await_payment_minutes: default_await_payment_minutes(),
            rate_limit_delay_ms: default_rate_limit_delay_ms(),
            retry_ceiling: default_retry_ceiling(),
            lock_ttl_minutes: default_lock_ttl_minutes(),
        }
    }
}

impl SyncConfig {
    pub fn settings(&self) -> SyncSettings {
        SyncSettings {
            collision_window: Duration::minutes(self.collision_window_minutes),
            await_payment: Duration::minutes(self.await_payment_minutes),
            rate_limit_delay: std::time::Duration::from_millis(self.rate_limit_delay_ms),
            lock_ttl: Duration::minutes(self.lock_ttl_minutes),
            retry_ceiling: self.retry_ceiling,
        }
    }
}

const fn default_collision_window_minutes() -> i64 {
    10
}

const fn default_await_payment_minutes() -> i64 {
    1440
}

const fn default_rate_limit_delay_ms() -> u64 {
    300
}

const fn default_retry_ceiling() -> u32 {
    3
}

const fn default_lock_ttl_minutes() -> i64 {
    10
}

/// Polling periods and router sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_orders_interval_secs")]
    pub orders_interval_secs: u64,

    #[serde(default = "default_payments_interval_secs")]
    pub payments_interval_secs: u64,

    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,

    /// Number of single-writer shard workers.
    #[serde(default = "default_shards")]
    pub shards: usize,

    /// Queued events per shard.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            orders_interval_secs: default_orders_interval_secs(),
            payments_interval_secs: default_payments_interval_secs(),
            retry_interval_secs: default_retry_interval_secs(),
            shards: default_shards(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

const fn default_orders_interval_secs() -> u64 {
    60
}

const fn default_payments_interval_secs() -> u64 {
    60
}

const fn default_retry_interval_secs() -> u64 {
    300
}

const fn default_shards() -> usize {
    4
}

const fn default_queue_capacity() -> usize {
    256
}

/// Redirect targets handed to the hosted checkout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutConfig {
    #[serde(default = "default_success_url")]
    pub success_url: String,

    #[serde(default = "default_cancel_url")]
    pub cancel_url: String,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            success_url: default_success_url(),
            cancel_url: default_cancel_url(),
        }
    }
}

fn default_success_url() -> String {
    "http://localhost/checkout/success".to_string()
}

fn default_cancel_url() -> String {
    "http://localhost/checkout/cancel".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconConfig {
    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub schedule: ScheduleConfig,

    #[serde(default)]
    pub checkout: CheckoutConfig,

    /// Default tracing filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ReconConfig {
    fn default() -> Self {
        Self {
            provider: ProviderConfig::default(),
            sync: SyncConfig::default(),
            schedule: ScheduleConfig::default(),
            checkout: CheckoutConfig::default(),
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ReconConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| ReconError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file.
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ReconError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Applies `PAYRECON_API_KEY` when set and non-empty.
    pub fn apply_env(&mut self) {
        self.apply_api_key(std::env::var(API_KEY_ENV).ok());
    }

    fn apply_api_key(&mut self, key: Option<String>) {
        if let Some(key) = key.filter(|k| !k.trim().is_empty()) {
            self.provider.api_key = Some(key);
        }
    }

    /// The API key, required by every command that talks to the provider.
    pub fn api_key(&self) -> Result<&str> {
        self.provider
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                ReconError::Config(format!(
                    "no provider API key configured; set provider.api_key or {}",
                    API_KEY_ENV
                ))
            })
    }
}
