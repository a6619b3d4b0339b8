use crate::domain::order::{Order, OrderId, OrderStatus};
use crate::error::{ReconError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;

#[derive(Debug, Deserialize)]
struct OrderRecord {
    id: OrderId,
    grand_total: Decimal,
    currency: String,
    status: OrderStatus,
    updated_at: DateTime<Utc>,
}

impl From<OrderRecord> for Order {
    fn from(record: OrderRecord) -> Self {
        Order::new(
            record.id,
            record.grand_total,
            record.currency,
            record.status,
            record.updated_at,
        )
    }
}

/// Reads storefront orders from a CSV source.
///
/// Expected columns: `id, grand_total, currency, status, updated_at`, with
/// `updated_at` in RFC 3339.
pub struct OrderReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> OrderReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily deserializes orders, one `Result` per row.
    pub fn orders(self) -> impl Iterator<Item = Result<Order>> {
        self.reader
            .into_deserialize::<OrderRecord>()
            .map(|result| result.map(Order::from).map_err(ReconError::from))
    }
}
