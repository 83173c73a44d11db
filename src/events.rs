//! Rate-limited, coalesced change stream.
//!
//! The store emits an unbounded stream of change records; clients watching
//! the engine must not be flooded by hot loops. The pump below multiplexes
//! the records into batches: at most one batch every [`EMIT_MIN_PERIOD`],
//! with at most [`EMIT_MAX_PENDING_WAIT`] of delay once something is
//! pending, ids de-duplicated within the window, and nothing at all
//! emitted while idle.

use std::sync::Arc;

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::model::NodeId;
use crate::store::{ChangeRecord, Store};

/// Hard floor between two emitted batches.
pub const EMIT_MIN_PERIOD: Duration = Duration::from_secs(2);

/// Upper wait before a pending batch is forced out.
pub const EMIT_MAX_PENDING_WAIT: Duration = Duration::from_secs(1);

const BROADCAST_CAPACITY: usize = 256;

/// One coalesced window of changes. Serializes to the wire shape pushed
/// over the server-sent event stream.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct ChangeBatch {
    pub started: bool,
    pub new_nodes: Vec<NodeId>,
    pub changed: Vec<NodeId>,
}

impl ChangeBatch {
    pub fn is_empty(&self) -> bool {
        !self.started && self.new_nodes.is_empty() && self.changed.is_empty()
    }
}

struct Pending {
    first_at: Instant,
    batch: ChangeBatch,
}

fn dedup(ids: Vec<NodeId>) -> Vec<NodeId> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

/// Drive records from `input` into coalesced batches on `output`.
///
/// Runs until the input closes; a final pending batch is flushed on
/// close regardless of the rate limit.
pub async fn pump(
    mut input: mpsc::UnboundedReceiver<ChangeRecord>,
    output: broadcast::Sender<ChangeBatch>,
) {
    let mut last_emit: Option<Instant> = None;
    let mut pending: Option<Pending> = None;

    loop {
        let deadline = pending.as_ref().map(|p| {
            let forced = p.first_at + EMIT_MAX_PENDING_WAIT;
            match last_emit {
                Some(t) => forced.max(t + EMIT_MIN_PERIOD),
                None => forced,
            }
        });

        tokio::select! {
            record = input.recv() => match record {
                Some(record) => {
                    let slot = pending.get_or_insert_with(|| Pending {
                        first_at: Instant::now(),
                        batch: ChangeBatch::default(),
                    });
                    match record {
                        ChangeRecord::Started => slot.batch.started = true,
                        ChangeRecord::NewNodes(ids) => slot.batch.new_nodes.extend(ids),
                        ChangeRecord::NodesChanged(ids) => slot.batch.changed.extend(ids),
                    }
                }
                None => break,
            },
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                if deadline.is_some() =>
            {
                if let Some(p) = pending.take() {
                    emit(&output, p.batch);
                    last_emit = Some(Instant::now());
                }
            }
        }
    }

    if let Some(p) = pending.take() {
        emit(&output, p.batch);
    }
}

fn emit(output: &broadcast::Sender<ChangeBatch>, mut batch: ChangeBatch) {
    batch.new_nodes = dedup(std::mem::take(&mut batch.new_nodes));
    batch.changed = dedup(std::mem::take(&mut batch.changed));
    if batch.is_empty() {
        return;
    }
    // Send fails only with zero subscribers, which is fine.
    if output.send(batch).is_err() {
        debug!("no change stream subscribers");
    }
}

/// Handle on the running change stream: subscribe for batches, abort at
/// shutdown.
pub struct ChangeStream {
    output: broadcast::Sender<ChangeBatch>,
    forwarder: JoinHandle<()>,
    pump_task: JoinHandle<()>,
}

impl ChangeStream {
    /// Wire the store's change feed through the rate limiter.
    pub fn start(store: Arc<Store>) -> Self {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (output, _) = broadcast::channel(BROADCAST_CAPACITY);

        let forwarder = tokio::spawn(async move {
            while let Some(record) = store.next_change().await {
                if raw_tx.send(record).is_err() {
                    break;
                }
            }
        });
        let pump_task = tokio::spawn(pump(raw_rx, output.clone()));

        Self {
            output,
            forwarder,
            pump_task,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeBatch> {
        self.output.subscribe()
    }

    pub fn sender(&self) -> broadcast::Sender<ChangeBatch> {
        self.output.clone()
    }

    pub fn abort(&self) {
        self.forwarder.abort();
        self.pump_task.abort();
    }
}

// ============================================================================
// Tests
// ============================================================================
