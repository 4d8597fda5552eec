//! Write-batch coalescer between the coordinator and storage.
//!
//! Puts and deletes enqueue in FIFO order and ride to storage in grouped
//! flushes. A flush fires when the queue reaches `max_batch_size`, when
//! `flush_interval` elapses after the first enqueue of the current batch,
//! or explicitly. Maximal runs of consecutive puts become one `put_batch`
//! each; deletes execute in order between them, so put/delete submission
//! order is preserved.
//!
//! Backpressure: while a flush is in progress and the queue holds twice the
//! batch size, new operations wait for the flush before enqueuing.
//!
//! A failing flush delivers the error to every ticket in the drained batch;
//! the queue is already empty, so subsequent operations proceed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};

use crate::error::StorageError;
use crate::record::VectorRecord;
use crate::storage::Storage;

enum PendingOp {
    Put {
        record: VectorRecord,
        ack: oneshot::Sender<Result<(), StorageError>>,
    },
    Delete {
        id: String,
        ack: oneshot::Sender<Result<bool, StorageError>>,
    },
}

struct State {
    queue: VecDeque<PendingOp>,
    flushing: bool,
    /// Bumped on every drain so a sleeping interval timer can tell whether
    /// the batch it was armed for still exists.
    epoch: u64,
}

pub struct BatchCoalescer {
    storage: Arc<dyn Storage>,
    max_batch_size: usize,
    flush_interval: Duration,
    state: Mutex<State>,
    flush_done: Notify,
}

/// Durability ticket for an enqueued put. Resolves once the record is
/// durable, or with the flush error that took its batch down. Dropping the
/// ticket is allowed; the flush outcome is logged either way.
pub type PutTicket = oneshot::Receiver<Result<(), StorageError>>;

impl BatchCoalescer {
    pub fn new(
        storage: Arc<dyn Storage>,
        max_batch_size: usize,
        flush_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            max_batch_size: max_batch_size.max(1),
            flush_interval,
            state: Mutex::new(State {
                queue: VecDeque::new(),
                flushing: false,
                epoch: 0,
            }),
            flush_done: Notify::new(),
        })
    }

    /// Enqueue an upsert.
    pub async fn put(self: &Arc<Self>, record: VectorRecord) -> PutTicket {
        self.admit().await;
        let (ack, ticket) = oneshot::channel();
        self.enqueue(PendingOp::Put { record, ack });
        ticket
    }

    /// Enqueue a deletion and wait for its flush; resolves with whether the
    /// id existed in storage.
    pub async fn delete(self: &Arc<Self>, id: &str) -> Result<bool, StorageError> {
        self.admit().await;
        let (ack, ticket) = oneshot::channel();
        self.enqueue(PendingOp::Delete { id: id.to_string(), ack });
        ticket
            .await
            .map_err(|_| StorageError::Unavailable("coalescer dropped the operation".into()))?
    }

    /// Drain the queue now and wait until everything queued so far is
    /// durable. Waits out an in-progress flush first.
    pub async fn flush(self: &Arc<Self>) -> Result<(), StorageError> {
        loop {
            let notified = self.flush_done.notified();
            let drained = {
                let mut state = self.state.lock();
                if state.flushing {
                    None
                } else if state.queue.is_empty() {
                    return Ok(());
                } else {
                    state.flushing = true;
                    state.epoch += 1;
                    Some(std::mem::take(&mut state.queue))
                }
            };
            match drained {
                Some(ops) => return self.run_flush(ops).await,
                None => notified.await,
            }
        }
    }

    /// Number of queued, not-yet-flushed operations.
    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    fn enqueue(self: &Arc<Self>, op: PendingOp) {
        let (arm_timer, trigger_flush, epoch) = {
            let mut state = self.state.lock();
            state.queue.push_back(op);
            let first = state.queue.len() == 1;
            let full = state.queue.len() >= self.max_batch_size;
            (first && !full, full, state.epoch)
        };

        if trigger_flush {
            let this = self.clone();
            tokio::spawn(async move {
                let _ = this.flush().await;
            });
        } else if arm_timer {
            let this = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(this.flush_interval).await;
                // An epoch bump means some flush already drained the batch
                // this timer was armed for. Otherwise flush now; flush()
                // itself waits out any flush still in progress.
                let due = {
                    let state = this.state.lock();
                    !state.queue.is_empty() && state.epoch == epoch
                };
                if due {
                    let _ = this.flush().await;
                }
            });
        }
    }

    /// Backpressure gate: hold new work while a flush is running and the
    /// queue is already twice the batch size.
    async fn admit(&self) {
        loop {
            let notified = self.flush_done.notified();
            {
                let state = self.state.lock();
                if !(state.flushing && state.queue.len() >= 2 * self.max_batch_size) {
                    return;
                }
            }
            notified.await;
        }
    }

    async fn run_flush(self: &Arc<Self>, ops: VecDeque<PendingOp>) -> Result<(), StorageError> {
        let result = self.apply_ops(ops).await;
        {
            self.state.lock().flushing = false;
        }
        self.flush_done.notify_waiters();
        if let Err(err) = &result {
            tracing::warn!(error = %err, "coalescer flush failed; batch rejected");
        }
        result
    }

    async fn apply_ops(&self, mut ops: VecDeque<PendingOp>) -> Result<(), StorageError> {
        while !ops.is_empty() {
            // Collect the maximal run of consecutive puts.
            let mut run: Vec<(VectorRecord, oneshot::Sender<Result<(), StorageError>>)> =
                Vec::new();
            while let Some(PendingOp::Put { .. }) = ops.front() {
                let Some(PendingOp::Put { record, ack }) = ops.pop_front() else {
                    unreachable!("front was a put");
                };
                run.push((record, ack));
            }

            if !run.is_empty() {
                let records: Vec<VectorRecord> = run.iter().map(|(r, _)| r.clone()).collect();
                match self.storage.put_batch(&records).await {
                    Ok(()) => {
                        for (_, ack) in run {
                            let _ = ack.send(Ok(()));
                        }
                    }
                    Err(err) => {
                        for (_, ack) in run {
                            let _ = ack.send(Err(err.clone()));
                        }
                        Self::reject_rest(ops, &err);
                        return Err(err);
                    }
                }
                continue;
            }

            match ops.pop_front() {
                Some(PendingOp::Delete { id, ack }) => match self.storage.delete(&id).await {
                    Ok(existed) => {
                        let _ = ack.send(Ok(existed));
                    }
                    Err(err) => {
                        let _ = ack.send(Err(err.clone()));
                        Self::reject_rest(ops, &err);
                        return Err(err);
                    }
                },
                Some(PendingOp::Put { .. }) => unreachable!("puts drained above"),
                None => break,
            }
        }
        Ok(())
    }

    fn reject_rest(ops: VecDeque<PendingOp>, err: &StorageError) {
        for op in ops {
            match op {
                PendingOp::Put { ack, .. } => {
                    let _ = ack.send(Err(err.clone()));
                }
                PendingOp::Delete { ack, .. } => {
                    let _ = ack.send(Err(err.clone()));
                }
            }
        }
    }
}
