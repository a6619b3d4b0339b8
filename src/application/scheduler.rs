//! Polling loops.
//!
//! Three cron jobs feed per-order events into a [`Dispatch`]: the orders
//! loop pushes local changes out, the payments loop pulls provider changes
//! in and the retry loop re-runs transient failures. Each job keeps its own
//! checkpoint and never lets one order's failure stop the batch.

use super::synchronizer::{Dispatch, Operation, SyncEvent, SyncOutcome};
use crate::domain::order::{Order, OrderStatus};
use crate::domain::ports::{CursorKind, SharedClock, SharedOrderStore, SharedProvider};
use crate::domain::sync::{DataSource, PaymentStatus};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Counts of what one cron pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CronReport {
    pub dispatched: usize,
    pub changed: usize,
    pub errors: usize,
}

impl CronReport {
    fn record(&mut self, result: &Result<SyncOutcome>) {
        self.dispatched += 1;
        match result {
            Ok(SyncOutcome::Skipped(_) | SyncOutcome::NoChange | SyncOutcome::OperationPending) => {}
            Ok(_) => self.changed += 1,
            Err(_) => self.errors += 1,
        }
    }

    fn merge(&mut self, other: CronReport) {
        self.dispatched += other.dispatched;
        self.changed += other.changed;
        self.errors += other.errors;
    }
}

#[async_trait]
pub trait CronJob: Send + Sync {
    fn source(&self) -> DataSource;
    async fn run_once(&self) -> Result<CronReport>;
}

async fn dispatch_all(dispatcher: &dyn Dispatch, events: Vec<SyncEvent>, source: DataSource) -> CronReport {
    let mut report = CronReport::default();
    for event in events {
        let id = event.order_id().clone();
        let result = dispatcher.dispatch(event, source).await;
        if let Err(e) = &result {
            error!(order_id = %id, %source, "Processing failed: {}", e);
        }
        report.record(&result);
    }
    report
}

/// Pushes local order changes to the provider and follows up on operations.
pub struct OrdersCron {
    store: SharedOrderStore,
    dispatcher: Arc<dyn Dispatch>,
    clock: SharedClock,
}

impl OrdersCron {
    pub fn new(store: SharedOrderStore, dispatcher: Arc<dyn Dispatch>, clock: SharedClock) -> Self {
        Self {
            store,
            dispatcher,
            clock,
        }
    }

    /// Completed/canceled orders changed in `[since, until]`, oldest first.
    async fn updated_orders(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Order>> {
        let orders = self.store.orders_updated_between(since, until).await?;
        Ok(orders
            .into_iter()
            .filter(|o| OrderStatus::SETTLEMENT_TRIGGERS.contains(&o.status))
            .filter(|o| !o.sync.is_completed())
            .collect())
    }

    pub async fn sync_updated_orders(&self) -> Result<CronReport> {
        let source = self.source();
        let since = self
            .store
            .cursor(CursorKind::Orders)
            .await?
            .unwrap_or(DateTime::UNIX_EPOCH);
        info!(%source, %since, "Looking for orders modified after cursor");

        let until = self.clock.now();
        let orders = self.updated_orders(since, until).await?;
        let events = orders
            .into_iter()
            .map(|o| SyncEvent::OrderChanged(o.id))
            .collect::<Vec<_>>();
        let report = dispatch_all(self.dispatcher.as_ref(), events, source).await;

        // The window is inclusive, so an order written at `until` is seen again.
        self.store.set_cursor(CursorKind::Orders, until).await?;
        info!(%source, cursor = %until, "Advanced order cursor");
        Ok(report)
    }

    pub async fn verify_operation_completion(&self, operation: Operation) -> Result<CronReport> {
        let orders = self
            .store
            .orders_with_payment_status(&[operation.in_progress()])
            .await?;
        let events = orders
            .into_iter()
            .map(|o| SyncEvent::VerifyOperation(o.id, operation))
            .collect::<Vec<_>>();
        Ok(dispatch_all(self.dispatcher.as_ref(), events, self.source()).await)
    }

    pub async fn fail_unconfirmed_payment_orders(&self) -> Result<CronReport> {
        let orders = self
            .store
            .orders_with_status(&[OrderStatus::AwaitingConfirmation])
            .await?;
        let events = orders
            .into_iter()
            .map(|o| SyncEvent::ExpireUnconfirmed(o.id))
            .collect::<Vec<_>>();
        Ok(dispatch_all(self.dispatcher.as_ref(), events, self.source()).await)
    }

    pub async fn verify_complete_refund(&self) -> Result<CronReport> {
        let orders = self
            .store
            .orders_with_payment_status(&[PaymentStatus::Refunded])
            .await?;
        let events = orders
            .into_iter()
            .filter(|o| !o.sync.is_completed())
            .map(|o| SyncEvent::VerifyCompleteRefund(o.id))
            .collect::<Vec<_>>();
        Ok(dispatch_all(self.dispatcher.as_ref(), events, self.source()).await)
    }
}

#[async_trait]
impl CronJob for OrdersCron {
    fn source(&self) -> DataSource {
        DataSource::OrdersCron
    }

    async fn run_once(&self) -> Result<CronReport> {
        let mut report = self.sync_updated_orders().await?;
        report.merge(self.verify_operation_completion(Operation::Settle).await?);
        report.merge(self.fail_unconfirmed_payment_orders().await?);
        report.merge(self.verify_operation_completion(Operation::Refund).await?);
        report.merge(self.verify_complete_refund().await?);
        Ok(report)
    }
}

/// Pulls provider payment changes into local orders.
pub struct PaymentsCron {
    store: SharedOrderStore,
    provider: SharedProvider,
    dispatcher: Arc<dyn Dispatch>,
}

impl PaymentsCron {
    pub fn new(store: SharedOrderStore, provider: SharedProvider, dispatcher: Arc<dyn Dispatch>) -> Self {
        Self {
            store,
            provider,
            dispatcher,
        }
    }
}

#[async_trait]
impl CronJob for PaymentsCron {
    fn source(&self) -> DataSource {
        DataSource::PaymentsCron
    }

    async fn run_once(&self) -> Result<CronReport> {
        let source = self.source();
        let since = self
            .store
            .cursor(CursorKind::Payments)
            .await?
            .map_or(0, |at| at.timestamp());
        info!(%source, since, "Looking for payments modified after cursor");

        let mut report = CronReport::default();
        let mut next_token: Option<String> = None;
        loop {
            let page = match self
                .provider
                .list_payments(since, next_token.as_deref())
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    error!(%source, "listPayments failed, exiting: {}", err);
                    return Err(err.into());
                }
            };
            next_token = page.next().map(str::to_string);
            let last_updated = page.results.last().map(|p| p.updated_at);

            let events = page
                .results
                .into_iter()
                .map(SyncEvent::PaymentChanged)
                .collect::<Vec<_>>();
            report.merge(dispatch_all(self.dispatcher.as_ref(), events, source).await);

            if let Some(cursor) = last_updated.and_then(|at| DateTime::from_timestamp(at + 1, 0)) {
                self.store.set_cursor(CursorKind::Payments, cursor).await?;
                info!(%source, %cursor, "Advanced payment cursor");
            }
            if next_token.is_none() {
                return Ok(report);
            }
        }
    }
}

/// Re-runs actions that failed transiently.
pub struct RetryCron {
    store: SharedOrderStore,
    dispatcher: Arc<dyn Dispatch>,
}

impl RetryCron {
    pub fn new(store: SharedOrderStore, dispatcher: Arc<dyn Dispatch>) -> Self {
        Self { store, dispatcher }
    }
}

#[async_trait]
impl CronJob for RetryCron {
    fn source(&self) -> DataSource {
        DataSource::RetryCron
    }

    async fn run_once(&self) -> Result<CronReport> {
        let orders = self.store.transient_error_orders().await?;
        info!(source = %self.source(), count = orders.len(), "Looking for orders with transient errors");
        let events = orders
            .into_iter()
            .filter(|o| !o.sync.is_hard_failed())
            .map(|o| SyncEvent::Retry(o.id))
            .collect::<Vec<_>>();
        Ok(dispatch_all(self.dispatcher.as_ref(), events, self.source()).await)
    }
}

/// A job with the period it runs at.
pub struct Scheduled {
    pub job: Arc<dyn CronJob>,
    pub every: std::time::Duration,
}

/// Periodic driver for the cron jobs.
///
/// Jobs run one at a time on a single task, so their passes never overlap.
pub struct Scheduler {
    jobs: Vec<Scheduled>,
}

impl Scheduler {
    pub fn new(jobs: Vec<Scheduled>) -> Self {
        Self { jobs }
    }

    /// Runs until `shutdown` flips to true.
    ///
    /// Every job first runs immediately, then `every` after its previous pass
    /// finished.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let start = Instant::now();
        let mut next_due = vec![start; self.jobs.len()];

        loop {
            let Some((index, due)) = next_due
                .iter()
                .copied()
                .enumerate()
                .min_by_key(|(_, due)| *due)
            else {
                warn!("No cron jobs registered");
                return Ok(());
            };

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        info!("Shutdown channel closed, stopping scheduler");
                        return Ok(());
                    }
                    if *shutdown.borrow() {
                        info!("Shutdown signal received, stopping scheduler");
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep_until(due) => {
                    let scheduled = &self.jobs[index];
                    // Failures are logged; the next pass starts from the same checkpoint.
                    let _ = run_logged(scheduled.job.as_ref()).await;
                    next_due[index] = Instant::now() + scheduled.every;
                }
            }
        }
    }
}

async fn run_logged(job: &dyn CronJob) -> Result<CronReport> {
    let source = job.source();
    match job.run_once().await {
        Ok(report) => {
            info!(
                %source,
                dispatched = report.dispatched,
                changed = report.changed,
                errors = report.errors,
                "Cron pass finished"
            );
            Ok(report)
        }
        Err(e) => {
            error!(%source, "Cron pass aborted: {}", e);
            Err(e)
        }
    }
}
