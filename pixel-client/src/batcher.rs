use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use pixel_common::{EventBatch, TrackedEvent};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::network::NetworkStatus;
use crate::transport::Transport;

/// Events buffered while offline are capped at this many flush thresholds,
/// the oldest go first.
pub const BUFFERED_BATCHES: usize = 10;

struct QueuedEvent {
    event: TrackedEvent,
    attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing queued
    Empty,
    /// Offline and not forced, events stay queued
    Deferred,
    /// Another flush is running
    InFlight,
    Sent(usize),
    /// Retryable failure: some events went back to the queue, the ones out of
    /// attempts were dropped
    Requeued { requeued: usize, dropped: usize },
    /// Permanent failure, the batch is gone
    Dropped(usize),
}

/// Buffers events and ships them in enqueue order.
///
/// The queue is only locked for the swap in and out, never across the
/// transport call. At most one flush runs at a time.
pub struct Batcher {
    queue: Mutex<VecDeque<QueuedEvent>>,
    transport: Arc<dyn Transport + Send + Sync>,
    network: Arc<dyn NetworkStatus + Send + Sync>,
    max_queue_size: usize,
    max_buffered: usize,
    max_attempts: u32,
    flushing: AtomicBool,
    idle: Notify,
}

struct FlushGuard<'a>(&'a Batcher);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.flushing.store(false, Ordering::Release);
        self.0.idle.notify_waiters();
    }
}

impl Batcher {
    pub fn new(
        transport: Arc<dyn Transport + Send + Sync>,
        network: Arc<dyn NetworkStatus + Send + Sync>,
        max_queue_size: usize,
        max_attempts: u32,
    ) -> Self {
        let max_queue_size = max_queue_size.max(1);
        Self {
            queue: Mutex::new(VecDeque::new()),
            transport,
            network,
            max_queue_size,
            max_buffered: max_queue_size.saturating_mul(BUFFERED_BATCHES),
            max_attempts: max_attempts.max(1),
            flushing: AtomicBool::new(false),
            idle: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<QueuedEvent>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Append an event, flushing right away once the size threshold is hit.
    pub async fn enqueue(&self, event: TrackedEvent) -> Option<FlushOutcome> {
        let len = {
            let mut queue = self.lock();
            queue.push_back(QueuedEvent { event, attempts: 0 });
            self.evict_overflow(&mut queue);
            queue.len()
        };

        if len >= self.max_queue_size {
            Some(self.flush(false).await)
        } else {
            None
        }
    }

    fn evict_overflow(&self, queue: &mut VecDeque<QueuedEvent>) {
        let overflow = queue.len().saturating_sub(self.max_buffered);
        if overflow > 0 {
            queue.drain(..overflow);
            debug!("queue full, evicted {} oldest events", overflow);
        }
    }

    /// Forget everything queued, returning how many events were dropped.
    pub fn clear(&self) -> usize {
        let mut queue = self.lock();
        let dropped = queue.len();
        queue.clear();
        dropped
    }

    #[instrument(skip(self))]
    pub async fn flush(&self, force: bool) -> FlushOutcome {
        if self.is_empty() {
            return FlushOutcome::Empty;
        }
        if !force && !self.network.is_online() {
            return FlushOutcome::Deferred;
        }
        if self
            .flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return FlushOutcome::InFlight;
        }
        let _guard = FlushGuard(self);

        let (events, attempts): (Vec<TrackedEvent>, Vec<u32>) = self
            .lock()
            .drain(..)
            .map(|queued| (queued.event, queued.attempts))
            .unzip();
        if events.is_empty() {
            return FlushOutcome::Empty;
        }

        let batch = EventBatch::new(events);
        let count = batch.len();
        debug!("flushing {} events", count);

        match self.transport.send(&batch).await {
            Ok(()) => FlushOutcome::Sent(count),
            Err(err) if err.is_retryable() => {
                debug!("failed to send tracking batch: {}", err);
                self.requeue(batch, attempts)
            }
            Err(err) => {
                debug!("dropping {} events after permanent failure: {}", count, err);
                FlushOutcome::Dropped(count)
            }
        }
    }

    fn requeue(&self, batch: EventBatch, attempts: Vec<u32>) -> FlushOutcome {
        let mut dropped = 0;
        let retry: Vec<QueuedEvent> = batch
            .events
            .into_iter()
            .zip(attempts)
            .filter_map(|(event, attempts)| {
                let attempts = attempts + 1;
                if attempts >= self.max_attempts {
                    dropped += 1;
                    None
                } else {
                    Some(QueuedEvent { event, attempts })
                }
            })
            .collect();

        if dropped > 0 {
            debug!("dropping {} events out of delivery attempts", dropped);
        }

        let requeued = retry.len();
        let mut queue = self.lock();
        // the failed batch goes back ahead of anything queued meanwhile
        for item in retry.into_iter().rev() {
            queue.push_front(item);
        }
        self.evict_overflow(&mut queue);

        FlushOutcome::Requeued { requeued, dropped }
    }

    /// Forced flush that waits out a flush already in flight instead of
    /// returning [`FlushOutcome::InFlight`], so events queued meanwhile still go.
    pub async fn drain(&self) -> FlushOutcome {
        loop {
            let idle = self.idle.notified();
            tokio::pin!(idle);
            // registered before trying, a flush ending in between still wakes us
            idle.as_mut().enable();

            match self.flush(true).await {
                FlushOutcome::InFlight => idle.await,
                outcome => return outcome,
            }
        }
    }

    /// Periodic non-forced flush. Stops when cancelled or once the batcher is dropped.
    pub fn spawn_flush_timer(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let batcher = Arc::downgrade(self);
        let interval = interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let Some(batcher) = batcher.upgrade() else {
                    break;
                };
                batcher.flush(false).await;
            }
        })
    }
}
