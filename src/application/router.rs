use super::synchronizer::{Dispatch, OrderSynchronizer, SyncEvent, SyncOutcome};
use crate::domain::order::OrderId;
use crate::domain::sync::DataSource;
use crate::error::{ReconError, Result};
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

struct Job {
    event: SyncEvent,
    source: DataSource,
    reply: oneshot::Sender<Result<SyncOutcome>>,
}

/// Single-writer reconciliation actor.
///
/// Events are routed to a fixed shard by the hash of their order id, and
/// each shard worker applies its events one at a time. Two loops reporting
/// changes for the same order are therefore serialized instead of racing.
pub struct SyncRouter {
    shards: Vec<mpsc::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl SyncRouter {
    /// Spawns `shards` workers, each with a queue of `capacity` events.
    pub fn spawn(sync: OrderSynchronizer, shards: usize, capacity: usize) -> Self {
        let shard_count = shards.max(1);
        let mut senders = Vec::with_capacity(shard_count);
        let mut workers = Vec::with_capacity(shard_count);

        for shard in 0..shard_count {
            let (tx, mut rx) = mpsc::channel::<Job>(capacity.max(1));
            let sync = sync.clone();
            workers.push(tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    let order_id = job.event.order_id().clone();
                    let result = sync.handle(job.event, job.source).await;
                    if let Err(e) = &result {
                        error!(shard, order_id = %order_id, source = %job.source, "Event failed: {}", e);
                    }
                    // The caller may have stopped waiting.
                    let _ = job.reply.send(result);
                }
                debug!(shard, "Shard worker stopped");
            }));
            senders.push(tx);
        }

        Self {
            shards: senders,
            workers,
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Index of the shard that owns `id`.
    pub fn shard_for(&self, id: &OrderId) -> usize {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    /// Closes every queue and waits for in-flight events to finish.
    pub async fn shutdown(self) -> Result<()> {
        drop(self.shards);
        for worker in self.workers {
            worker
                .await
                .map_err(|e| ReconError::InternalError(Box::new(e)))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Dispatch for SyncRouter {
    async fn dispatch(&self, event: SyncEvent, source: DataSource) -> Result<SyncOutcome> {
        let shard = self.shard_for(event.order_id());
        let (reply, response) = oneshot::channel();
        self.shards[shard]
            .send(Job {
                event,
                source,
                reply,
            })
            .await
            .map_err(|_| ReconError::ChannelClosed)?;
        response.await.map_err(|_| ReconError::ChannelClosed)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::synchronizer::{SkipReason, SyncSettings};
    use crate::domain::order::{Order, OrderStatus};
    use crate::domain::ports::OrderStore;
    use crate::infrastructure::clock::SystemClock;
    use crate::infrastructure::in_memory::InMemoryOrderStore;
    use crate::infrastructure::sandbox::SandboxProvider;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn synchronizer(store: Arc<InMemoryOrderStore>) -> OrderSynchronizer {
        OrderSynchronizer::new(
            store,
            Arc::new(SandboxProvider::new()),
            Arc::new(SystemClock),
            SyncSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_same_order_always_same_shard() {
        let store = Arc::new(InMemoryOrderStore::new());
        let router = SyncRouter::spawn(synchronizer(store), 4, 8);
        let id = OrderId::new("1001");
        let shard = router.shard_for(&id);
        for _ in 0..10 {
            assert_eq!(router.shard_for(&id), shard);
        }
        assert!(shard < router.shard_count());
        router.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatch_returns_outcome() {
        let store = Arc::new(InMemoryOrderStore::new());
        let mut order = Order::new("7", dec!(5), "USD", OrderStatus::Complete, Utc::now());
        order.sync.complete();
        store.insert(order).await.unwrap();

        let router = SyncRouter::spawn(synchronizer(store), 2, 8);
        let outcome = router
            .dispatch(SyncEvent::OrderChanged(OrderId::new("7")), DataSource::OrdersCron)
            .await
            .unwrap();
        assert_eq!(outcome, SyncOutcome::Skipped(SkipReason::Completed));

        let missing = router
            .dispatch(SyncEvent::OrderChanged(OrderId::new("nope")), DataSource::OrdersCron)
            .await;
        assert!(matches!(missing, Err(ReconError::OrderNotFound(_))));
        router.shutdown().await.unwrap();
    }
}
