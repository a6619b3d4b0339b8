use crate::domain::order::Order;
use crate::error::Result;
use serde::Serialize;
use std::io::Write;

#[derive(Serialize)]
struct ReportRow<'a> {
    id: &'a str,
    status: &'static str,
    payment_status: &'static str,
    processing_completed: &'static str,
    tx_id: &'a str,
    transient_error_code: String,
    hard_error_code: String,
}

impl<'a> From<&'a Order> for ReportRow<'a> {
    fn from(order: &'a Order) -> Self {
        let sync = &order.sync;
        Self {
            id: order.id.as_str(),
            status: order.status.as_str(),
            payment_status: sync.payment_status.map_or("", |s| s.as_str()),
            processing_completed: sync.processing_completed_label(),
            tx_id: sync.tx_id.as_deref().unwrap_or(""),
            transient_error_code: sync
                .transient
                .as_ref()
                .map(|t| t.code.to_string())
                .unwrap_or_default(),
            hard_error_code: sync
                .hard_error()
                .map(|h| h.code.to_string())
                .unwrap_or_default(),
        }
    }
}

/// Writes the per-order sync state as CSV.
pub struct ReportWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> ReportWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_orders<'a>(&mut self, orders: impl IntoIterator<Item = &'a Order>) -> Result<()> {
        let mut wrote_any = false;
        for order in orders {
            self.writer.serialize(ReportRow::from(order))?;
            wrote_any = true;
        }
        if !wrote_any {
            self.writer.write_record([
                "id",
                "status",
                "payment_status",
                "processing_completed",
                "tx_id",
                "transient_error_code",
                "hard_error_code",
            ])?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::OrderStatus;
    use crate::domain::sync::{ErrorCode, PaymentStatus, RetryAction};
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn render(orders: &[Order]) -> String {
        let mut out = Vec::new();
        ReportWriter::new(&mut out).write_orders(orders).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_report_rows() {
        let at = Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap();
        let mut settled = Order::new("1", dec!(10), "USD", OrderStatus::Complete, at);
        settled.sync.payment_status = Some(PaymentStatus::Settled);
        settled.sync.tx_id = Some("tx-1".to_string());
        settled.sync.complete();

        let mut failing = Order::new("2", dec!(10), "USD", OrderStatus::Canceled, at);
        failing.sync.record_transient(RetryAction::Refund, ErrorCode::E205, "refund failed");
        failing.sync.fail_hard(Some(RetryAction::Refund), ErrorCode::E909, "refund failed on chain");

        let csv = render(&[settled, failing]);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(
            lines[0],
            "id,status,payment_status,processing_completed,tx_id,transient_error_code,hard_error_code"
        );
        assert_eq!(lines[1], "1,complete,settled,yes,tx-1,,");
        assert_eq!(lines[2], "2,canceled,,no,,E205,E909");
    }

    #[test]
    fn test_empty_report_has_header() {
        let csv = render(&[]);
        assert_eq!(
            csv.trim_end(),
            "id,status,payment_status,processing_completed,tx_id,transient_error_code,hard_error_code"
        );
    }
}
