#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use payrecon::application::scheduler::{OrdersCron, PaymentsCron, RetryCron};
use payrecon::application::synchronizer::{Dispatch, OrderSynchronizer, SyncSettings};
use payrecon::domain::order::{Order, OrderId, OrderStatus};
use payrecon::domain::payment::{BalanceKey, Payment, Token, TokenBalance};
use payrecon::domain::ports::{Clock, OrderStore};
use payrecon::infrastructure::clock::ManualClock;
use payrecon::infrastructure::in_memory::InMemoryOrderStore;
use payrecon::infrastructure::sandbox::SandboxProvider;
use rust_decimal::Decimal;
use std::sync::Arc;

pub const CHAIN: &str = "goerli";
pub const USDC: &str = "0xusdc";

pub fn usdc() -> BalanceKey {
    BalanceKey::new("ethereum", CHAIN, USDC)
}

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 4, 1, 12, 0, 0).unwrap()
}

/// Store, sandbox provider and synchronizer sharing one manual clock.
pub struct Env {
    pub store: Arc<InMemoryOrderStore>,
    pub sandbox: SandboxProvider,
    pub clock: ManualClock,
    pub sync: OrderSynchronizer,
}

pub async fn env() -> Env {
    env_with(SandboxProvider::new()).await
}

pub async fn env_with(sandbox: SandboxProvider) -> Env {
    sandbox
        .add_token(Token {
            network: "ethereum".to_string(),
            chain: CHAIN.to_string(),
            addr: USDC.to_string(),
            currency: "USD".to_string(),
        })
        .await;
    let store = Arc::new(InMemoryOrderStore::new());
    let clock = ManualClock::new(start());
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
    Env {
        store,
        sandbox,
        clock,
        sync,
    }
}

impl Env {
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Inserts an order last modified `age_minutes` ago.
    pub async fn order(&self, id: &str, total: Decimal, status: OrderStatus, age_minutes: i64) -> Order {
        let at = self.now() - Duration::minutes(age_minutes);
        let order = Order::new(id, total, "USD", status, at);
        self.store.insert(order.clone()).await.unwrap();
        order
    }

    pub async fn fund(&self, id: &str, amount: Decimal) {
        let payment = Payment::new(id, self.now().timestamp())
            .with_balance(usdc(), TokenBalance::new(amount, 6));
        self.sandbox.put_payment(payment).await;
    }

    pub async fn get(&self, id: &str) -> Order {
        self.store.get(&OrderId::new(id)).await.unwrap().unwrap()
    }

    pub async fn update(&self, id: &str, change: impl FnOnce(&mut Order)) {
        let mut order = self.get(id).await;
        change(&mut order);
        self.store.persist(&mut order).await.unwrap();
    }

    pub fn dispatcher(&self) -> Arc<dyn Dispatch> {
        Arc::new(self.sync.clone())
    }

    pub fn orders_cron(&self) -> OrdersCron {
        OrdersCron::new(self.store.clone(), self.dispatcher(), Arc::new(self.clock.clone()))
    }

    pub fn payments_cron(&self) -> PaymentsCron {
        PaymentsCron::new(
            self.store.clone(),
            Arc::new(self.sandbox.clone()),
            self.dispatcher(),
        )
    }

    pub fn retry_cron(&self) -> RetryCron {
        RetryCron::new(self.store.clone(), self.dispatcher())
    }
}
