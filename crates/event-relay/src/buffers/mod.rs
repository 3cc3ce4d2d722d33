use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::BufferConfig;
use crate::event::{Attributes, EventClock, EventRecord};
use crate::transport::{Destination, Transport, TransportError};

/// Why a flush returned without sending anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoDestination,
    Empty,
    /// Another flush holds the in-flight guard.
    InFlight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Delivered { count: usize },
    Skipped(SkipReason),
}

#[derive(Debug, Error)]
pub enum FlushError {
    #[error("failed to deliver batch, {requeued} events requeued: {source}")]
    Transport {
        requeued: usize,
        #[source]
        source: TransportError,
    },
}

pub type FlushErrorHook = Arc<dyn Fn(&FlushError) + Send + Sync>;

/// Bounded FIFO of pending events. Pushing past capacity evicts the oldest.
#[derive(Debug)]
pub struct EventQueue {
    events: VecDeque<EventRecord>,
    capacity: usize,
    dropped: u64,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Total events evicted over the queue's lifetime.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn iter(&self) -> impl Iterator<Item = &EventRecord> {
        self.events.iter()
    }

    /// Append at the tail. Returns the number of events evicted.
    pub fn push(&mut self, event: EventRecord) -> usize {
        self.events.push_back(event);
        self.evict_to_capacity()
    }

    /// Remove up to `max` events from the head, in order.
    pub fn take_batch(&mut self, max: usize) -> Vec<EventRecord> {
        let n = max.min(self.events.len());
        self.events.drain(..n).collect()
    }

    /// Put a failed batch back in front of everything queued since it was
    /// taken. Returns the number of events evicted to stay within capacity.
    ///
    /// Capacity is re-applied right away, so if the batch plus whatever was
    /// recorded meanwhile exceeds it, the front of the batch is dropped and
    /// the result is not the full `batch ++ queued`.
    pub fn requeue(&mut self, batch: Vec<EventRecord>) -> usize {
        if batch.is_empty() {
            return 0;
        }
        let mut restored = VecDeque::from(batch);
        restored.append(&mut self.events);
        self.events = restored;
        self.evict_to_capacity()
    }

    fn evict_to_capacity(&mut self) -> usize {
        let excess = self.events.len().saturating_sub(self.capacity);
        if excess == 0 {
            return 0;
        }
        self.events.drain(..excess);
        self.dropped += excess as u64;
        warn!(
            count = excess,
            capacity = self.capacity,
            "event queue over capacity, oldest events dropped"
        );
        excess
    }
}

/// Everything mutable lives behind one mutex so there is no lock ordering
/// to get wrong.
struct BufferState {
    queue: EventQueue,
    clock: EventClock,
    actor: Option<String>,
    destination: Option<Destination>,
    in_flight: bool,
    /// A background flush was spawned but has not reached the guard yet.
    flush_pending: bool,
    flush_tasks: Vec<JoinHandle<()>>,
    on_error: Option<FlushErrorHook>,
}

struct Shared<T> {
    state: Mutex<BufferState>,
    transport: T,
    batch_size: usize,
}

impl<T> Shared<T> {
    /// The lock is never held across `.await` and no code path panics while
    /// holding it, so a poisoned lock still guards consistent data.
    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Per-session event buffer. Cheap to clone; clones share the same queue.
///
/// Uses `std::sync::Mutex` (not tokio) because the lock is never held across
/// `.await`: the only suspension point is the transport call, made after the
/// batch has been moved out of the queue.
pub struct EventBuffer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for EventBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Transport + 'static> EventBuffer<T> {
    pub fn new(transport: T, config: BufferConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BufferState {
                    queue: EventQueue::new(config.capacity()),
                    clock: EventClock::default(),
                    actor: None,
                    destination: None,
                    in_flight: false,
                    flush_pending: false,
                    flush_tasks: Vec::new(),
                    on_error: None,
                }),
                transport,
                batch_size: config.batch_size(),
            }),
        }
    }

    /// Set where batches go. Last call wins.
    pub fn configure(&self, destination: Destination) {
        debug!(endpoint = %destination.endpoint(), "event destination configured");
        self.shared.lock().destination = Some(destination);
    }

    /// Set the actor stamped on events recorded from now on. Events already
    /// queued keep the actor they were recorded with.
    pub fn set_actor(&self, actor: Option<String>) {
        self.shared.lock().actor = actor;
    }

    /// Register a callback for failures of flushes nobody is awaiting
    /// (record-triggered and periodic).
    pub fn on_flush_error(&self, hook: impl Fn(&FlushError) + Send + Sync + 'static) {
        self.shared.lock().on_error = Some(Arc::new(hook));
    }

    pub fn len(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.lock().queue.is_empty()
    }

    /// Events evicted for capacity since the buffer was created.
    pub fn dropped_count(&self) -> u64 {
        self.shared.lock().queue.dropped()
    }

    /// Copy of the queued events, head first.
    pub fn snapshot(&self) -> Vec<EventRecord> {
        self.shared.lock().queue.iter().cloned().collect()
    }

    /// Queue an event. Never blocks on I/O and never fails; once the batch
    /// threshold is reached a background flush is started.
    pub fn record(&self, name: impl Into<String>, data: Option<Attributes>) {
        let name = name.into();
        if name.is_empty() {
            warn!("ignoring event with empty name");
            return;
        }

        let mut state = self.shared.lock();
        let timestamp = state.clock.now();
        let event = EventRecord::new(name, data, timestamp, state.actor.clone());
        state.queue.push(event);

        if state.queue.len() >= self.shared.batch_size {
            self.try_spawn_flush(&mut state);
        }
    }

    /// Inner spawn logic, called with the lock already held.
    ///
    /// Returns `true` if a flush was spawned.
    fn try_spawn_flush(&self, state: &mut BufferState) -> bool {
        if state.in_flight || state.flush_pending || state.destination.is_none() {
            return false;
        }

        // Join finished tasks to surface panics before forgetting them.
        state.flush_tasks.retain_mut(|handle| {
            if !handle.is_finished() {
                return true;
            }
            let mut cx = Context::from_waker(Waker::noop());
            if let Poll::Ready(Err(e)) = Pin::new(handle).poll(&mut cx) {
                error!(error = %e, "background flush task panicked");
            }
            false
        });

        let Ok(runtime) = Handle::try_current() else {
            warn!("no async runtime available, batch flush deferred");
            return false;
        };

        let buffer = self.clone();
        state.flush_pending = true;
        state.flush_tasks.push(runtime.spawn(async move {
            let result = buffer.flush_inner(true).await;
            buffer.report(result);
        }));
        true
    }

    /// Flush and route any failure to the log and the registered hook
    /// instead of the caller.
    pub async fn flush_and_report(&self) -> Option<FlushOutcome> {
        let result = self.flush().await;
        self.report(result)
    }

    fn report(&self, result: Result<FlushOutcome, FlushError>) -> Option<FlushOutcome> {
        match result {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!(error = %e, "background flush failed");
                let hook = self.shared.lock().on_error.clone();
                if let Some(hook) = hook {
                    hook(&e);
                }
                None
            }
        }
    }

    /// Send at most one batch from the head of the queue.
    ///
    /// A failed batch goes back to the head of the queue, ahead of anything
    /// recorded while it was in flight. Only one flush runs at a time; a
    /// concurrent call is skipped rather than queued.
    pub async fn flush(&self) -> Result<FlushOutcome, FlushError> {
        self.flush_inner(false).await
    }

    /// `spawned` marks the flush started by `record`; it hands the pending
    /// trigger over to the in-flight guard (or gives it up when skipped).
    async fn flush_inner(&self, spawned: bool) -> Result<FlushOutcome, FlushError> {
        let (destination, mut guard) = {
            let mut state = self.shared.lock();
            if spawned {
                state.flush_pending = false;
            }
            let Some(destination) = state.destination.clone() else {
                return Ok(FlushOutcome::Skipped(SkipReason::NoDestination));
            };
            if state.queue.is_empty() {
                return Ok(FlushOutcome::Skipped(SkipReason::Empty));
            }
            if state.in_flight {
                return Ok(FlushOutcome::Skipped(SkipReason::InFlight));
            }
            state.in_flight = true;
            let batch = state.queue.take_batch(self.shared.batch_size);
            (destination, InFlight::new(Arc::clone(&self.shared), batch))
        };

        let count = guard.batch.len();
        debug!(count, endpoint = %destination.endpoint(), "sending event batch");

        match self.shared.transport.send(&destination, &guard.batch).await {
            Ok(()) => {
                guard.delivered();
                debug!(count, "event batch delivered");
                Ok(FlushOutcome::Delivered { count })
            }
            Err(source) => {
                drop(guard);
                Err(FlushError::Transport {
                    requeued: count,
                    source,
                })
            }
        }
    }

    /// Flush batch after batch until the queue is empty or a flush is skipped
    /// or fails. For shutdown; triggered flushes never chain like this.
    ///
    /// Returns the number of events delivered.
    pub async fn drain(&self) -> Result<usize, FlushError> {
        let mut delivered = 0;
        while let FlushOutcome::Delivered { count } = self.flush().await? {
            delivered += count;
        }
        Ok(delivered)
    }

    /// Wait for background flushes to complete, including any started by
    /// the ones being waited on.
    pub async fn join_flush_task(&self) {
        loop {
            let handles = std::mem::take(&mut self.shared.lock().flush_tasks);
            if handles.is_empty() {
                return;
            }
            for h in handles {
                if let Err(e) = h.await {
                    error!(error = %e, "background flush task panicked");
                }
            }
        }
    }
}

/// Holds the in-flight guard and the batch being sent. Unless delivery is
/// confirmed, dropping it puts the batch back at the head of the queue, so a
/// transport error, a panic, or a cancelled flush all leave the queue whole.
struct InFlight<T> {
    shared: Arc<Shared<T>>,
    batch: Vec<EventRecord>,
}

impl<T> InFlight<T> {
    fn new(shared: Arc<Shared<T>>, batch: Vec<EventRecord>) -> Self {
        Self { shared, batch }
    }

    fn delivered(&mut self) {
        self.batch.clear();
    }
}

impl<T> Drop for InFlight<T> {
    fn drop(&mut self) {
        let batch = std::mem::take(&mut self.batch);
        let mut state = self.shared.lock();
        if !batch.is_empty() {
            let count = batch.len();
            state.queue.requeue(batch);
            debug!(count, "event batch requeued");
        }
        state.in_flight = false;
    }
}
