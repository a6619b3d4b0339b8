use crate::domain::order::{Order, OrderId};
use crate::domain::ports::{CursorKind, OrderStore};
use crate::error::{ReconError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Options};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Column Family for storing orders with their sync metadata.
pub const CF_ORDERS: &str = "orders";
/// Column Family for storing the scheduler checkpoints.
pub const CF_CURSORS: &str = "cursors";

/// A persistent order store using RocksDB.
///
/// Orders are kept as JSON values keyed by order id; cursors as RFC 3339
/// timestamps keyed by name. Version-checked saves are serialized through a
/// process-local mutex.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path.
    ///
    /// Ensures that the required column families ("orders" and "cursors") exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_orders = ColumnFamilyDescriptor::new(CF_ORDERS, Options::default());
        let cf_cursors = ColumnFamilyDescriptor::new(CF_CURSORS, Options::default());

        let db = DB::open_cf_descriptors(&opts, path, vec![cf_orders, cf_cursors])?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db.cf_handle(name).ok_or_else(|| {
            ReconError::InternalError(Box::new(std::io::Error::other(format!(
                "{} column family not found",
                name
            ))))
        })
    }

    fn read_order(&self, id: &OrderId) -> Result<Option<Order>> {
        let cf = self.cf(CF_ORDERS)?;
        match self.db.get_cf(cf, id.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write_order(&self, order: &Order) -> Result<()> {
        let cf = self.cf(CF_ORDERS)?;
        let value = serde_json::to_vec(order)?;
        self.db.put_cf(cf, order.id.as_str().as_bytes(), value)?;
        Ok(())
    }
}

#[async_trait]
impl OrderStore for RocksDBStore {
    async fn get(&self, id: &OrderId) -> Result<Option<Order>> {
        self.read_order(id)
    }

    async fn insert(&self, order: Order) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write_order(&order)
    }

    async fn save(&self, order: &Order) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let stored = self
            .read_order(&order.id)?
            .ok_or_else(|| ReconError::OrderNotFound(order.id.clone()))?;
        if stored.version != order.version {
            return Err(ReconError::Conflict(order.id.clone()));
        }
        let mut next = order.clone();
        next.version += 1;
        self.write_order(&next)?;
        Ok(next.version)
    }

    async fn all_orders(&self) -> Result<Vec<Order>> {
        let cf = self.cf(CF_ORDERS)?;
        let mut orders = Vec::new();
        for item in self.db.iterator_cf(cf, rocksdb::IteratorMode::Start) {
            let (_key, value) = item?;
            let order: Order = serde_json::from_slice(&value)?;
            orders.push(order);
        }
        Ok(orders)
    }

    async fn cursor(&self, kind: CursorKind) -> Result<Option<DateTime<Utc>>> {
        let cf = self.cf(CF_CURSORS)?;
        let Some(bytes) = self.db.get_cf(cf, kind.as_str().as_bytes())? else {
            return Ok(None);
        };
        let text = String::from_utf8_lossy(&bytes);
        let at = DateTime::parse_from_rfc3339(&text)
            .map_err(|e| ReconError::InternalError(Box::new(e)))?;
        Ok(Some(at.with_timezone(&Utc)))
    }

    async fn set_cursor(&self, kind: CursorKind, at: DateTime<Utc>) -> Result<()> {
        let cf = self.cf(CF_CURSORS)?;
        self.db
            .put_cf(cf, kind.as_str().as_bytes(), at.to_rfc3339().as_bytes())?;
        Ok(())
    }
}
