//! Partitioned ingest pipeline.
//!
//! Deliveries are read on the calling thread, unwrapped and normalized, then
//! routed to a fixed worker by a stable hash of the contact id. A worker owns
//! its own store connection and merges its queue in arrival order, so within
//! one process two merges for the same contact never race. Conditional puts
//! still guard against other processes sharing the database.

use std::io::BufRead;
use std::sync::mpsc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use contact_ledger_core::{
    normalize, ContactEvent, ContactId, ContactRecord, ErrorKind, FieldMappings, LedgerError,
    MergeEngine, RecordStore, SourceKind,
};
use contact_ledger_store_sqlite::SqliteRecordStore;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, info_span, warn};
use ulid::Ulid;

use crate::config::LedgerConfig;
use crate::envelope::{unwrap_envelope, Delivery};

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_MAX_REDELIVERIES: u32 = 3;
pub const DEFAULT_REDELIVERY_BASE_DELAY: Duration = Duration::from_millis(50);
/// Events a worker may have queued before the reader blocks.
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, Default, Serialize, Eq, PartialEq)]
pub struct IngestReport {
    pub deliveries: u64,
    pub events: u64,
    pub merged: u64,
    pub dropped_malformed: u64,
    pub failed: u64,
    pub redeliveries: u64,
}

impl IngestReport {
    fn absorb(&mut self, other: &Self) {
        self.deliveries += other.deliveries;
        self.events += other.events;
        self.merged += other.merged;
        self.dropped_malformed += other.dropped_malformed;
        self.failed += other.failed;
        self.redeliveries += other.redeliveries;
    }

    fn record(&mut self, outcome: &MergeOutcome) {
        match outcome.disposition {
            Disposition::Merged => self.merged += 1,
            Disposition::DroppedMalformed => self.dropped_malformed += 1,
            Disposition::Failed => self.failed += 1,
        }
        self.redeliveries += u64::from(outcome.redeliveries);
    }
}

/// How the runner reacts to retryable merge failures.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RedeliveryPolicy {
    pub max_redeliveries: u32,
    pub base_delay: Duration,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            max_redeliveries: DEFAULT_MAX_REDELIVERIES,
            base_delay: DEFAULT_REDELIVERY_BASE_DELAY,
        }
    }
}

impl RedeliveryPolicy {
    /// Backoff before redelivery number `attempt` (zero based), doubling
    /// each time.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1_u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Disposition {
    Merged,
    DroppedMalformed,
    Failed,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct MergeOutcome {
    pub disposition: Disposition,
    pub redeliveries: u32,
}

/// Merges one event, redelivering it after retryable failures.
///
/// Malformed events are dropped at once. Store outages and exhausted merge
/// conflicts are retried with exponential backoff until the policy's budget
/// runs out, after which the event counts as failed.
pub fn merge_with_redelivery<S: RecordStore>(
    engine: &MergeEngine<S>,
    event: &ContactEvent,
    policy: RedeliveryPolicy,
) -> MergeOutcome {
    let mut redeliveries = 0;
    loop {
        match engine.merge(&event.contact_id, event) {
            Ok(record) => {
                debug!(
                    contact_id = %record.contact_id,
                    revision = record.revision,
                    "event merged"
                );
                return MergeOutcome {
                    disposition: Disposition::Merged,
                    redeliveries,
                };
            }
            Err(err) if err.is_retryable() && redeliveries < policy.max_redeliveries => {
                let delay = policy.delay_for(redeliveries);
                warn!(
                    contact_id = %event.contact_id,
                    error = %err,
                    redelivery = redeliveries + 1,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "redelivering event"
                );
                std::thread::sleep(delay);
                redeliveries += 1;
            }
            Err(err) if err.kind() == ErrorKind::MalformedEvent => {
                warn!(contact_id = %event.contact_id, error = %err, "dropping malformed event");
                return MergeOutcome {
                    disposition: Disposition::DroppedMalformed,
                    redeliveries,
                };
            }
            Err(err) => {
                error!(
                    contact_id = %event.contact_id,
                    error = %err,
                    kind = err.kind().as_str(),
                    redeliveries,
                    "event failed"
                );
                return MergeOutcome {
                    disposition: Disposition::Failed,
                    redeliveries,
                };
            }
        }
    }
}

/// Unwraps and merges one delivery on the calling thread.
///
/// # Errors
/// Stops at the first event that fails and returns its error.
pub fn submit_delivery<S: RecordStore>(
    engine: &MergeEngine<S>,
    mappings: &FieldMappings,
    source_kind: SourceKind,
    payload: &Value,
) -> Result<Vec<ContactRecord>, LedgerError> {
    let mut records = Vec::new();
    for raw in unwrap_envelope(source_kind, payload) {
        records.push(engine.submit(source_kind, &raw?, mappings)?);
    }
    Ok(records)
}

/// Stable worker index for a contact.
#[must_use]
pub fn partition(contact_id: &ContactId, workers: usize) -> usize {
    let hash = contact_id
        .as_str()
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325_u64, |hash, byte| {
            (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
        });
    let buckets = u64::try_from(workers.max(1)).unwrap_or(u64::MAX);
    usize::try_from(hash % buckets).unwrap_or(0)
}

struct WorkItem {
    delivery_id: Ulid,
    event: ContactEvent,
}

pub struct Ingestor<'a> {
    config: &'a LedgerConfig,
    workers: usize,
    redelivery: RedeliveryPolicy,
    queue_depth: usize,
}

impl<'a> Ingestor<'a> {
    /// # Errors
    /// Returns [`LedgerError::Configuration`] when `workers` is zero.
    pub fn new(
        config: &'a LedgerConfig,
        workers: usize,
        redelivery: RedeliveryPolicy,
    ) -> Result<Self, LedgerError> {
        if workers == 0 {
            return Err(LedgerError::Configuration(
                "--workers MUST be >= 1".to_string(),
            ));
        }
        Ok(Self {
            config,
            workers,
            redelivery,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        })
    }

    /// Bounds each worker's queue; at least one slot is kept.
    #[must_use]
    pub fn with_queue_depth(mut self, queue_depth: usize) -> Self {
        self.queue_depth = queue_depth.max(1);
        self
    }

    /// Ingests newline-delimited deliveries until `reader` is exhausted.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or migrated, the
    /// input cannot be read, or a worker dies. Per-event failures are
    /// counted in the report instead.
    pub fn run<R: BufRead>(&self, reader: R) -> Result<IngestReport> {
        SqliteRecordStore::open_migrated(&self.config.db_path)?;

        let mut stores = Vec::with_capacity(self.workers);
        for _ in 0..self.workers {
            stores.push(SqliteRecordStore::open(&self.config.db_path)?);
        }

        std::thread::scope(|scope| -> Result<IngestReport> {
            let mut senders = Vec::with_capacity(self.workers);
            let mut handles = Vec::with_capacity(self.workers);
            for (worker, store) in stores.into_iter().enumerate() {
                let (sender, receiver) = mpsc::sync_channel::<WorkItem>(self.queue_depth);
                senders.push(sender);
                handles.push(scope.spawn(move || self.run_worker(worker, &store, &receiver)));
            }

            let mut report = self.dispatch(reader, &senders)?;
            drop(senders);

            for handle in handles {
                let tally = handle
                    .join()
                    .map_err(|_| anyhow!("ingest worker panicked"))??;
                report.absorb(&tally);
            }

            info!(
                deliveries = report.deliveries,
                events = report.events,
                merged = report.merged,
                dropped_malformed = report.dropped_malformed,
                failed = report.failed,
                redeliveries = report.redeliveries,
                "ingest finished"
            );
            Ok(report)
        })
    }

    fn dispatch<R: BufRead>(
        &self,
        reader: R,
        senders: &[mpsc::SyncSender<WorkItem>],
    ) -> Result<IngestReport> {
        let mut report = IngestReport::default();
        for line in reader.lines() {
            let line = line.context("failed to read delivery input")?;
            if line.trim().is_empty() {
                continue;
            }

            report.deliveries += 1;
            let delivery_id = Ulid::new();
            let span = info_span!("delivery", %delivery_id);
            let _entered = span.enter();

            let delivery = match Delivery::parse_line(&line) {
                Ok(value) => value,
                Err(err) => {
                    warn!(error = %err, "dropping malformed delivery");
                    report.dropped_malformed += 1;
                    continue;
                }
            };

            for raw in delivery.events() {
                report.events += 1;
                let normalized = raw.and_then(|payload| {
                    normalize(delivery.source_kind, &payload, &self.config.field_mappings)
                });
                let event = match normalized {
                    Ok(value) => value,
                    Err(err) => {
                        warn!(
                            source_kind = %delivery.source_kind,
                            error = %err,
                            "dropping malformed event"
                        );
                        report.dropped_malformed += 1;
                        continue;
                    }
                };

                let worker = partition(&event.contact_id, senders.len());
                let sender = senders
                    .get(worker)
                    .ok_or_else(|| anyhow!("no ingest worker at index {worker}"))?;
                sender
                    .send(WorkItem { delivery_id, event })
                    .map_err(|_| anyhow!("ingest worker {worker} stopped accepting events"))?;
            }
        }
        Ok(report)
    }

    fn run_worker(
        &self,
        worker: usize,
        store: &SqliteRecordStore,
        receiver: &mpsc::Receiver<WorkItem>,
    ) -> Result<IngestReport> {
        let engine = MergeEngine::new(
            store,
            self.config.expiry,
            self.config.max_merge_attempts,
        )?;

        let mut tally = IngestReport::default();
        for item in receiver {
            let span = info_span!("merge", delivery_id = %item.delivery_id, worker);
            let _entered = span.enter();
            let outcome = merge_with_redelivery(&engine, &item.event, self.redelivery);
            tally.record(&outcome);
        }
        debug!(worker, merged = tally.merged, "ingest worker drained");
        Ok(tally)
    }
}
