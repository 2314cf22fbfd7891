//! Delivery settlement: ack, requeue or reject
//!
//! The decision is a pure function of the dispatch report and how many times
//! the message has already been tried. The attempt count comes from the
//! broker's `x-delivery-count` header when the queue type provides one,
//! otherwise from a [`RetryLedger`] kept by this process.
//!
//! [`process_delivery`] runs one delivery end to end against a
//! [`DeliveryAcker`]; the consumer task passes lapin's acker.

use crate::jobs::{DispatchReport, Dispatcher, Verdict};
use crate::observability::metrics;
use crate::transport::TransportError;
use async_trait::async_trait;
use lapin::acker::Acker;
use lapin::options::{BasicAckOptions, BasicNackOptions, BasicRejectOptions};
use lapin::types::AMQPValue;
use lapin::BasicProperties;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{info, warn};

const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

/// Ledger entries not touched for this long are assumed settled elsewhere
const LEDGER_ENTRY_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Remove the message from the queue
    Ack,
    /// Negative-acknowledge and put it back for another attempt
    Requeue,
    /// Negative-acknowledge without requeue (poison message)
    Reject,
}

/// Decide how to settle a delivery.
///
/// `report` is `None` when the body could not be parsed at all.
/// `prior_attempts` counts earlier deliveries of the same message.
pub fn settle(
    report: Option<&DispatchReport>,
    prior_attempts: u32,
    max_redeliveries: u32,
) -> Disposition {
    let Some(report) = report else {
        return Disposition::Reject;
    };
    match report.verdict {
        Verdict::Failed { retryable: true } if prior_attempts < max_redeliveries => {
            Disposition::Requeue
        }
        _ => Disposition::Ack,
    }
}

/// Settles a single delivery with the broker
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn settle(&self, disposition: Disposition) -> Result<(), TransportError>;
}

#[async_trait]
impl DeliveryAcker for Acker {
    async fn settle(&self, disposition: Disposition) -> Result<(), TransportError> {
        let settled = match disposition {
            Disposition::Ack => self.ack(BasicAckOptions::default()).await,
            Disposition::Requeue => {
                self.nack(BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                })
                .await
            }
            Disposition::Reject => self.reject(BasicRejectOptions { requeue: false }).await,
        };
        settled.map_err(|e| TransportError::SettleFailed(e.to_string()))
    }
}

/// What the consumer knows about one delivery before dispatching it
#[derive(Debug, Clone, Copy)]
pub struct InboundDelivery<'a> {
    pub body: &'a [u8],
    pub message_id: Option<&'a str>,
    pub delivery_count: Option<u32>,
}

/// Dispatch one delivery and settle it through `acker`.
///
/// A requeue only counts against the ledger once the broker accepted it.
pub async fn process_delivery(
    delivery: InboundDelivery<'_>,
    acker: &dyn DeliveryAcker,
    dispatcher: &Dispatcher,
    ledger: &RetryLedger,
    max_redeliveries: u32,
) -> Disposition {
    let key = ledger_key(delivery.message_id, delivery.body);

    let report = match serde_json::from_slice::<Value>(delivery.body) {
        Ok(payload) => Some(dispatcher.dispatch(&payload).await),
        Err(e) => {
            warn!(error = %e, "Discarding unparseable command message");
            None
        }
    };

    let prior = ledger.prior_attempts(delivery.delivery_count, &key);
    let disposition = settle(report.as_ref(), prior, max_redeliveries);
    let job_id = report
        .as_ref()
        .and_then(|r| r.job_id.clone())
        .unwrap_or_default();

    if disposition != Disposition::Requeue {
        ledger.forget(&key);
    }
    match acker.settle(disposition).await {
        Ok(()) if disposition == Disposition::Requeue => {
            let attempt = ledger.record_requeue(&key);
            metrics().job_requeued();
            info!(
                job_id = %job_id,
                attempt,
                max_redeliveries,
                "Requeued job after transient failure"
            );
        }
        Ok(()) => {}
        Err(e) => warn!(
            job_id = %job_id,
            disposition = ?disposition,
            error = %e,
            "Could not settle delivery; the broker will redeliver it"
        ),
    }
    disposition
}

/// Broker-maintained redelivery count, if the queue provides one
pub fn header_delivery_count(properties: &BasicProperties) -> Option<u32> {
    let headers = properties.headers().as_ref()?;
    let (_, value) = headers
        .inner()
        .iter()
        .find(|(name, _)| name.as_str() == DELIVERY_COUNT_HEADER)?;
    match value {
        AMQPValue::ShortShortUInt(n) => Some(u32::from(*n)),
        AMQPValue::ShortUInt(n) => Some(u32::from(*n)),
        AMQPValue::LongUInt(n) => Some(*n),
        AMQPValue::ShortShortInt(n) => u32::try_from(*n).ok(),
        AMQPValue::ShortInt(n) => u32::try_from(*n).ok(),
        AMQPValue::LongInt(n) => u32::try_from(*n).ok(),
        AMQPValue::LongLongInt(n) => u32::try_from(*n).ok(),
        _ => None,
    }
}

/// Stable identity of a message across redeliveries
pub fn ledger_key(message_id: Option<&str>, body: &[u8]) -> String {
    match message_id {
        Some(id) if !id.is_empty() => format!("id:{id}"),
        _ => format!("sha256:{:x}", Sha256::digest(body)),
    }
}

/// In-memory requeue counter for brokers without `x-delivery-count`
#[derive(Debug, Default)]
pub struct RetryLedger {
    entries: Mutex<HashMap<String, (u32, Instant)>>,
}

impl RetryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, (u32, Instant)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn attempts(&self, key: &str) -> u32 {
        self.entries().get(key).map_or(0, |(count, _)| *count)
    }

    /// Count one more requeue of `key`; returns the new total
    pub fn record_requeue(&self, key: &str) -> u32 {
        let mut entries = self.entries();
        let now = Instant::now();
        entries.retain(|_, (_, touched)| now.duration_since(*touched) < LEDGER_ENTRY_TTL);
        let entry = entries.entry(key.to_string()).or_insert((0, now));
        entry.0 += 1;
        entry.1 = now;
        entry.0
    }

    pub fn forget(&self, key: &str) {
        self.entries().remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Prior attempts for a delivery, preferring the broker's own count
    pub fn prior_attempts(&self, header_count: Option<u32>, key: &str) -> u32 {
        header_count.unwrap_or_else(|| self.attempts(key))
    }
}
