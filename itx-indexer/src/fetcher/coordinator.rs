//! Buffered, concurrency bounded work coordinator.
//!
//! Block numbers submitted through a [`CoordinatorHandle`] land in a pending set deduplicated by
//! number. The [`Coordinator`] loop drains that set into batches and hands them to a
//! [`BatchProcessor`], keeping at most `max_concurrency` batches in flight. Batches that ask for a
//! retry go back into the pending set; there is no retry limit. A number submitted again while
//! its batch is in flight waits in the pending set until that batch completes, so concurrent
//! batches never share a block.

use std::{
    collections::{HashSet, VecDeque},
    panic::AssertUnwindSafe,
    sync::Arc,
    time::Duration,
};

use futures03::{stream::BoxStream, FutureExt, StreamExt};
use itx_common::{models::BlockNumber, storage::StorageError};
use metrics::{counter, gauge};
use tokio::{
    sync::{
        mpsc::{self, Receiver, Sender},
        Mutex, Notify,
    },
    task::{JoinError, JoinSet},
    time::MissedTickBehavior,
};
use tracing::{debug, error, info, instrument, warn, Instrument};

use crate::{
    config::FetcherConfig,
    fetcher::{BatchProcessor, RunOutcome},
    IndexerError,
};

pub enum ControlMessage {
    Stop,
}

#[derive(Debug, Default)]
struct PendingSet {
    queue: VecDeque<BlockNumber>,
    members: HashSet<BlockNumber>,
    /// Numbers of the batches currently running.
    in_flight_numbers: HashSet<BlockNumber>,
    in_flight: usize,
}

impl PendingSet {
    /// Adds the numbers not already pending, keeping submission order. Returns how many were new.
    fn extend(&mut self, block_numbers: impl IntoIterator<Item = BlockNumber>) -> usize {
        let mut added = 0;
        for n in block_numbers {
            if self.members.insert(n) {
                self.queue.push_back(n);
                added += 1;
            }
        }
        added
    }

    /// Takes up to `max_size` numbers, skipping those still in flight. Skipped numbers keep
    /// their place in the queue.
    fn take_batch(&mut self, max_size: usize) -> Vec<BlockNumber> {
        let mut batch = Vec::new();
        let mut held = Vec::new();
        while batch.len() < max_size {
            let Some(n) = self.queue.pop_front() else {
                break;
            };
            if self.in_flight_numbers.contains(&n) {
                held.push(n);
            } else {
                self.members.remove(&n);
                batch.push(n);
            }
        }
        for n in held.into_iter().rev() {
            self.queue.push_front(n);
        }
        self.in_flight_numbers
            .extend(batch.iter().copied());
        batch
    }

    fn release(&mut self, batch: &[BlockNumber]) {
        for n in batch {
            self.in_flight_numbers.remove(n);
        }
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}

/// The batch and its outcome, `None` if the processor panicked.
type BatchResult = (Vec<BlockNumber>, Option<RunOutcome>);

#[derive(Clone)]
pub struct CoordinatorHandle {
    pending: Arc<Mutex<PendingSet>>,
    notify: Arc<Notify>,
    max_batch_size: usize,
    control_tx: Sender<ControlMessage>,
}

impl CoordinatorHandle {
    /// Queues block numbers for processing without waiting for them. Numbers already pending
    /// are ignored.
    pub async fn submit(&self, block_numbers: Vec<BlockNumber>) -> usize {
        let (added, pending) = {
            let mut set = self.pending.lock().await;
            (set.extend(block_numbers), set.len())
        };
        gauge!("itx_pending_blocks").set(pending as f64);
        if pending >= self.max_batch_size {
            self.notify.notify_one();
        }
        added
    }

    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<(), IndexerError> {
        self.control_tx
            .send(ControlMessage::Stop)
            .await
            .map_err(|err| IndexerError::Stopped(err.to_string()))
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// True when nothing is pending and no batch is running.
    pub async fn is_idle(&self) -> bool {
        let set = self.pending.lock().await;
        set.queue.is_empty() && set.in_flight == 0
    }
}

pub struct Coordinator {
    processor: Arc<dyn BatchProcessor>,
    pending: Arc<Mutex<PendingSet>>,
    notify: Arc<Notify>,
    control_rx: Receiver<ControlMessage>,
    max_batch_size: usize,
    max_concurrency: usize,
    flush_interval: Duration,
}

impl Coordinator {
    pub fn new(
        config: &FetcherConfig,
        processor: Arc<dyn BatchProcessor>,
    ) -> (Self, CoordinatorHandle) {
        let pending = Arc::new(Mutex::new(PendingSet::default()));
        let notify = Arc::new(Notify::new());
        let (control_tx, control_rx) = mpsc::channel(1);
        let handle = CoordinatorHandle {
            pending: pending.clone(),
            notify: notify.clone(),
            max_batch_size: config.max_batch_size,
            control_tx,
        };
        let coordinator = Self {
            processor,
            pending,
            notify,
            control_rx,
            max_batch_size: config.max_batch_size,
            max_concurrency: config.max_concurrency,
            flush_interval: config.flush_interval(),
        };
        (coordinator, handle)
    }

    /// Runs until a stop message arrives or every handle is dropped.
    ///
    /// On stop no new batch is dispatched; running batches finish and their outcome is applied.
    pub async fn run(mut self) -> Result<(), IndexerError> {
        info!(
            max_batch_size = self.max_batch_size,
            max_concurrency = self.max_concurrency,
            "Coordinator started"
        );
        let mut tasks: JoinSet<BatchResult> = JoinSet::new();
        let mut flush = tokio::time::interval(self.flush_interval);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stopping = false;

        loop {
            tokio::select! {
                ctrl = self.control_rx.recv(), if !stopping => {
                    match ctrl {
                        Some(ControlMessage::Stop) => warn!("Stop signal received; finishing in-flight batches"),
                        None => warn!("All coordinator handles dropped; finishing in-flight batches"),
                    }
                    stopping = true;
                }
                _ = flush.tick(), if !stopping => {
                    self.dispatch(&mut tasks).await;
                }
                _ = self.notify.notified(), if !stopping => {
                    self.dispatch(&mut tasks).await;
                }
                Some(joined) = tasks.join_next() => {
                    self.complete(joined).await;
                    if !stopping {
                        self.dispatch(&mut tasks).await;
                    }
                }
            }

            if stopping && tasks.is_empty() {
                break;
            }
        }

        let dropped = self.pending.lock().await.len();
        info!(dropped, "Coordinator stopped");
        Ok(())
    }

    async fn dispatch(&self, tasks: &mut JoinSet<BatchResult>) {
        loop {
            let batch = {
                let mut set = self.pending.lock().await;
                if set.in_flight >= self.max_concurrency {
                    break;
                }
                let batch = set.take_batch(self.max_batch_size);
                if batch.is_empty() {
                    break;
                }
                set.in_flight += 1;
                gauge!("itx_pending_blocks").set(set.len() as f64);
                batch
            };

            let span = tracing::info_span!(
                parent: None,
                "itx_batch",
                batch_size = batch.len(),
                first_block = batch[0],
            );
            counter!("itx_batches_dispatched").increment(1);
            let processor = self.processor.clone();
            tasks.spawn(
                async move {
                    debug!("Processing batch");
                    let outcome = AssertUnwindSafe(async { processor.run(batch.clone()).await })
                        .catch_unwind()
                        .await
                        .ok();
                    (batch, outcome)
                }
                .instrument(span),
            );
        }
    }

    async fn complete(&self, joined: Result<BatchResult, JoinError>) {
        let mut set = self.pending.lock().await;
        set.in_flight = set.in_flight.saturating_sub(1);
        let (batch, outcome) = match joined {
            Ok(result) => result,
            Err(err) => {
                error!(error = %err, "Batch task was cancelled");
                return;
            }
        };
        set.release(&batch);
        match outcome {
            Some(RunOutcome::Done) => {}
            Some(RunOutcome::Ignore) => {
                debug!(block_count = batch.len(), "Batch ignored");
            }
            Some(RunOutcome::Retry(block_numbers)) => {
                counter!("itx_batches_retried").increment(1);
                let added = set.extend(block_numbers);
                debug!(added, "Batch re-queued");
            }
            None => {
                // the batch numbers are lost; a restart re-seeds them from the store
                error!(block_count = batch.len(), first_block = batch.first(), "Batch panicked");
            }
        }
        gauge!("itx_pending_blocks").set(set.len() as f64);
    }
}

/// Submits every block number of `stream` in chunks of `chunk_size`. Returns how many numbers
/// were newly queued.
#[instrument(skip_all)]
pub async fn seed_from_stream(
    handle: &CoordinatorHandle,
    mut stream: BoxStream<'static, Result<BlockNumber, StorageError>>,
    chunk_size: usize,
) -> Result<usize, IndexerError> {
    let chunk_size = chunk_size.max(1);
    let mut seeded = 0;
    let mut chunk = Vec::with_capacity(chunk_size);
    while let Some(block_number) = stream.next().await {
        chunk.push(block_number?);
        if chunk.len() == chunk_size {
            seeded += handle
                .submit(std::mem::take(&mut chunk))
                .await;
        }
    }
    if !chunk.is_empty() {
        seeded += handle.submit(chunk).await;
    }
    info!(seeded, "Seeded pending blocks");
    Ok(seeded)
}
