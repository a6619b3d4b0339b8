use crate::domain::order::{Order, OrderId};
use crate::domain::ports::{CursorKind, OrderStore};
use crate::error::{ReconError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A thread-safe in-memory order store.
///
/// Uses `Arc<RwLock<HashMap<OrderId, Order>>>` to allow shared concurrent access.
/// The version check in `save` runs under the write lock, so concurrent
/// writers of the same order see a conflict instead of a lost update.
#[derive(Default, Clone)]
pub struct InMemoryOrderStore {
    orders: Arc<RwLock<HashMap<OrderId, Order>>>,
    cursors: Arc<RwLock<HashMap<CursorKind, DateTime<Utc>>>>,
}

impl InMemoryOrderStore {
    /// Creates a new, empty in-memory order store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn get(&self, id: &OrderId) -> Result<Option<Order>> {
        let orders = self.orders.read().await;
        Ok(orders.get(id).cloned())
    }

    async fn insert(&self, order: Order) -> Result<()> {
        let mut orders = self.orders.write().await;
        orders.insert(order.id.clone(), order);
        Ok(())
    }

    async fn save(&self, order: &Order) -> Result<u64> {
        let mut orders = self.orders.write().await;
        let stored = orders
            .get_mut(&order.id)
            .ok_or_else(|| ReconError::OrderNotFound(order.id.clone()))?;
        if stored.version != order.version {
            return Err(ReconError::Conflict(order.id.clone()));
        }
        let mut next = order.clone();
        next.version += 1;
        let version = next.version;
        *stored = next;
        Ok(version)
    }

    async fn all_orders(&self) -> Result<Vec<Order>> {
        let orders = self.orders.read().await;
        let mut all: Vec<Order> = orders.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn cursor(&self, kind: CursorKind) -> Result<Option<DateTime<Utc>>> {
        let cursors = self.cursors.read().await;
        Ok(cursors.get(&kind).copied())
    }

    async fn set_cursor(&self, kind: CursorKind, at: DateTime<Utc>) -> Result<()> {
        let mut cursors = self.cursors.write().await;
        cursors.insert(kind, at);
        Ok(())
    }
}
