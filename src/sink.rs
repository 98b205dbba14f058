//! Durable write-behind sink.
//!
//! Producers (the poll engine, the orchestrator) hand events over a bounded
//! channel; a dedicated worker thread attempts immediate delivery to the
//! remote store and spills to the on-disk journal on failure. A periodic
//! drain retries the journal head-first once connectivity returns. The poll
//! thread therefore never blocks on store or disk I/O.
//!
//! Ordering: while the journal holds any records, fresh events are appended
//! behind them rather than delivered directly, so per-kind enqueue order
//! reaches the store intact.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::aft::{epoch_ms, AftOutcome, AftResult, TransferType};
use crate::error::Result;
use crate::journal::{EventKind, Journal, QueuedEvent};
use crate::meters::MeterChange;

/// Capacity of the producer-side event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

const DRAIN_INTERVAL: Duration = Duration::from_secs(5);
const RECV_TICK: Duration = Duration::from_millis(250);

/// Row written for every observed meter movement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterChangedRow {
    pub asset_number: u32,
    pub meter_code: u8,
    pub old_value: u64,
    pub new_value: u64,
    pub suspect: bool,
    pub observed_at: u64,
    pub sequence: u64,
}

/// Row written for every terminal AFT outcome.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AftResultRow {
    pub transaction_id: String,
    pub transfer_type: TransferType,
    pub cashable_cents: u64,
    pub restricted_cents: u64,
    pub non_restricted_cents: u64,
    pub status: AftOutcome,
    pub observed_at: u64,
    pub sequence: u64,
}

/// Row announcing the agent (and which machine it fronts) after startup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentOnlineRow {
    pub asset_number: u32,
    pub host_name: String,
    pub observed_at: u64,
    pub sequence: u64,
}

/// Events producers hand to the sink.
#[derive(Clone, Debug)]
pub enum Event {
    MeterChanged {
        asset_number: u32,
        change: MeterChange,
    },
    AftResult(AftResult),
    AgentOnline {
        asset_number: u32,
        host_name: String,
    },
}

impl Event {
    fn kind(&self) -> EventKind {
        match self {
            Event::MeterChanged { .. } => EventKind::MeterChanged,
            Event::AftResult(_) => EventKind::AftResult,
            Event::AgentOnline { .. } => EventKind::AgentOnline,
        }
    }

    fn into_queued(self, sequence: u64) -> Result<QueuedEvent> {
        let kind = self.kind();
        let body = match self {
            Event::MeterChanged {
                asset_number,
                change,
            } => serde_json::to_vec(&MeterChangedRow {
                asset_number,
                meter_code: change.meter_code,
                old_value: change.old_value,
                new_value: change.new_value,
                suspect: change.suspect,
                observed_at: change.observed_at,
                sequence,
            })?,
            Event::AftResult(result) => serde_json::to_vec(&AftResultRow {
                transaction_id: result.request.transaction_id.clone(),
                transfer_type: result.request.transfer_type,
                cashable_cents: result.request.cashable_cents,
                restricted_cents: result.request.restricted_cents,
                non_restricted_cents: result.request.non_restricted_cents,
                status: result.outcome,
                observed_at: result.observed_at,
                sequence,
            })?,
            Event::AgentOnline {
                asset_number,
                host_name,
            } => serde_json::to_vec(&AgentOnlineRow {
                asset_number,
                host_name,
                observed_at: epoch_ms(),
                sequence,
            })?,
        };

        Ok(QueuedEvent {
            sequence,
            kind,
            body,
            first_attempt: epoch_ms(),
            attempts: 0,
        })
    }
}

/// The remote store, as the sink sees it. Deliveries are at-least-once;
/// implementations deduplicate on `(kind, sequence)`.
pub trait RemoteStore: Send {
    fn commit(&mut self, event: &QueuedEvent) -> Result<()>;
}

/// Store adapter that only logs committed rows; the integration point for a
/// real database writer.
pub struct LoggingStore {
    table_name: String,
}

impl LoggingStore {
    pub fn new(table_name: &str) -> Self {
        Self {
            table_name: table_name.to_owned(),
        }
    }
}

impl RemoteStore for LoggingStore {
    fn commit(&mut self, event: &QueuedEvent) -> Result<()> {
        log::info!(
            "{} <- seq={} kind={} body={}",
            self.table_name,
            event.sequence,
            event.kind.as_str(),
            String::from_utf8_lossy(&event.body)
        );
        Ok(())
    }
}

/// Spawns the sink worker. Returns the producer handle and the thread.
pub fn spawn(
    mut store: Box<dyn RemoteStore>,
    mut journal: Journal,
    shutdown: Arc<AtomicBool>,
) -> Result<(SyncSender<Event>, JoinHandle<()>)> {
    let (tx, rx) = mpsc::sync_channel::<Event>(EVENT_CHANNEL_CAPACITY);

    let handle = thread::Builder::new()
        .name("sink".into())
        .spawn(move || worker(&mut *store, &mut journal, &rx, &shutdown))?;

    Ok((tx, handle))
}

fn worker(
    store: &mut dyn RemoteStore,
    journal: &mut Journal,
    rx: &Receiver<Event>,
    shutdown: &AtomicBool,
) {
    let mut sequence = journal.next_sequence();
    let mut next_drain = Instant::now() + drain_interval();
    let mut warned_near_full = false;

    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        match rx.recv_timeout(RECV_TICK) {
            Ok(event) => {
                accept(store, journal, event, &mut sequence, &mut warned_near_full);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if Instant::now() >= next_drain {
            drain(store, journal);
            next_drain = Instant::now() + drain_interval();
        }
    }

    // Flush whatever producers managed to enqueue before shutdown; the
    // journal survives the restart, direct delivery may not get a chance.
    while let Ok(event) = rx.try_recv() {
        accept(store, journal, event, &mut sequence, &mut warned_near_full);
    }
    drain(store, journal);

    log::debug!("sink worker stopped");
}

fn accept(
    store: &mut dyn RemoteStore,
    journal: &mut Journal,
    event: Event,
    sequence: &mut u64,
    warned_near_full: &mut bool,
) {
    let seq = *sequence;
    *sequence += 1;

    let mut queued = match event.into_queued(seq) {
        Ok(queued) => queued,
        Err(err) => {
            log::error!("failed to serialize event: {err}");
            return;
        }
    };

    // Never jump the queue: older records of the same kind may still be
    // journaled.
    if journal.is_empty() {
        queued.attempts = 1;
        match store.commit(&queued) {
            Ok(()) => return,
            Err(err) => log::warn!("store write failed, journaling seq={seq}: {err}"),
        }
    }

    match journal.append(queued) {
        Ok(()) => warn_near_full(journal, warned_near_full),
        Err(err) => log::error!("dropping event seq={seq}: {err}"),
    }
}

fn drain(store: &mut dyn RemoteStore, journal: &mut Journal) {
    loop {
        journal.note_attempt();

        let Some(head) = journal.head() else { return };
        let sequence = head.sequence;

        if let Err(err) = store.commit(head) {
            // One line per drain pass, not per retry; the head blocks the
            // rest of the queue anyway.
            log::debug!("journal drain stalled at seq={sequence}: {err}");
            return;
        }

        if let Err(err) = journal.ack_head() {
            log::error!("failed to remove acknowledged record seq={sequence}: {err}");
            return;
        }
    }
}

fn warn_near_full(journal: &Journal, warned: &mut bool) {
    let (used, cap) = journal.usage();
    let near_full = used * 10 >= cap * 8;

    if near_full && !*warned {
        log::warn!("journal at {used}/{cap} bytes (over 80% of cap)");
        *warned = true;
    } else if !near_full {
        *warned = false;
    }
}

// 5 s plus up to half a second of jitter.
fn drain_interval() -> Duration {
    DRAIN_INTERVAL + Duration::from_millis(epoch_ms() % 500)
}
