//! Relays committed outbox rows to the message bus.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sdp_storage::{OutboxStore, StoreError};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bus::{BusError, Envelope, MessageBus};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Bus(#[from] BusError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub fetched: usize,
    pub sent: usize,
    /// Whether a publish failed and the rest of the batch was left for later.
    pub interrupted: bool,
}

pub struct OutboxDispatcher {
    store: Arc<dyn OutboxStore>,
    bus: Arc<dyn MessageBus>,
    batch_size: usize,
    poll_interval: Duration,
}

impl OutboxDispatcher {
    pub fn new(store: Arc<dyn OutboxStore>, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            store,
            bus,
            batch_size: 100,
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Publishes one batch in commit order. A row is marked sent only after the
    /// bus accepted it; the first failure stops the batch so order is kept.
    pub async fn dispatch_once(&self) -> Result<DispatchReport, DispatchError> {
        let rows = self.store.fetch_unsent(self.batch_size).await?;
        let mut report = DispatchReport {
            fetched: rows.len(),
            ..Default::default()
        };

        for row in rows {
            if let Err(err) = self.bus.publish(Envelope::from_outbox(&row)).await {
                warn!(
                    error = %err,
                    sequence_number = row.sequence_number,
                    message_type = %row.message_type,
                    "outbox publish failed; will retry"
                );
                report.interrupted = true;
                break;
            }
            self.store.mark_sent(row.sequence_number, Utc::now()).await?;
            report.sent += 1;
        }

        if report.sent > 0 {
            debug!(sent = report.sent, fetched = report.fetched, "outbox batch dispatched");
        }
        Ok(report)
    }

    /// Drains everything left unsent, e.g. after a restart. Stops at the first
    /// interrupted batch.
    pub async fn recover(&self) -> Result<usize, DispatchError> {
        let mut total = 0;
        loop {
            let report = self.dispatch_once().await?;
            total += report.sent;
            if report.interrupted || report.fetched < self.batch_size {
                break;
            }
        }
        if total > 0 {
            info!(recovered = total, "outbox recovered unsent messages");
        }
        Ok(total)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(poll_ms = self.poll_interval.as_millis() as u64, "outbox dispatcher started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let idle = match self.dispatch_once().await {
                Ok(report) => report.fetched == 0 || report.interrupted,
                Err(err) => {
                    warn!(error = %err, "outbox dispatch failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        info!("outbox dispatcher stopped");
    }
}
