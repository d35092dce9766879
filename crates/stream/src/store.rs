//! In-memory subscriber registry and replay window.
//!
//! A single mutex guards both the set of subscriber queues and the window of
//! recently sent events, so registration, deregistration and sends are
//! totally ordered. Nothing is written to a peer while the lock is held.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use evstream_types::Event;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::task::{TaskTracker, task_tracker::TaskTrackerToken};
use tracing::{debug, info, warn};

use crate::types::HandlerOptions;

/// Error types for handler operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("Handler is closed")]
    Closed,
}

struct Registry {
    subscribers: HashMap<u64, mpsc::Sender<Arc<Event>>>,
    replay: VecDeque<Arc<Event>>,
    next_id: u64,
    closed: bool,
}

/// Subscriber queues plus the replay window of one handler.
pub(crate) struct SubscriberStore {
    registry: Mutex<Registry>,
    options: HandlerOptions,
    tracker: TaskTracker,
}

impl SubscriberStore {
    pub(crate) fn new(options: HandlerOptions) -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(Registry {
                subscribers: HashMap::new(),
                replay: VecDeque::with_capacity(options.replay_capacity),
                next_id: 0,
                closed: false,
            }),
            options,
            tracker: TaskTracker::new(),
        })
    }

    /// Register a new subscriber.
    ///
    /// When `last_event_id` is given, the replay batch holds every retained
    /// event sent after the matching one, or the whole window when the id is
    /// no longer retained. The batch is taken in the same critical section as
    /// the registration so no event is both replayed and queued.
    pub(crate) fn register(
        self: &Arc<Self>,
        last_event_id: Option<&str>,
    ) -> Result<Subscription, HandlerError> {
        let mut registry = self.registry.lock();
        if registry.closed {
            return Err(HandlerError::Closed);
        }

        let id = registry.next_id;
        registry.next_id += 1;

        let (tx, rx) = mpsc::channel(self.options.effective_queue_capacity());
        registry.subscribers.insert(id, tx);

        let replay = match last_event_id {
            Some(last_event_id) => {
                let start = registry
                    .replay
                    .iter()
                    .rposition(|event| event.id == last_event_id)
                    .map_or(0, |index| index + 1);
                registry.replay.iter().skip(start).cloned().collect()
            }
            None => Vec::new(),
        };

        debug!(
            subscriber = id,
            subscribers = registry.subscribers.len(),
            replay = replay.len(),
            "Registered subscriber"
        );

        Ok(Subscription {
            id,
            queue: rx,
            replay,
            store: Arc::clone(self),
            _token: self.tracker.token(),
        })
    }

    /// Queue `event` for every subscriber and retain it for replay.
    ///
    /// Subscribers whose queue is full are evicted. Returns the number of
    /// subscribers the event was queued for.
    pub(crate) fn broadcast(&self, event: Event) -> usize {
        let event = Arc::new(event);
        let mut registry = self.registry.lock();

        registry
            .subscribers
            .retain(|id, tx| match tx.try_send(Arc::clone(&event)) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        subscriber = *id,
                        capacity = self.options.effective_queue_capacity(),
                        "Evicting slow subscriber"
                    );
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            });
        let delivered = registry.subscribers.len();

        if self.options.replay_capacity > 0 {
            registry.replay.push_back(event);
            while registry.replay.len() > self.options.replay_capacity {
                registry.replay.pop_front();
            }
        }

        delivered
    }

    fn remove(&self, id: u64) -> bool {
        self.registry.lock().subscribers.remove(&id).is_some()
    }

    /// Reject new subscribers and close every queue. Returns the number of
    /// subscribers that were still registered.
    pub(crate) fn close(&self) -> usize {
        let closed = {
            let mut registry = self.registry.lock();
            registry.closed = true;
            let count = registry.subscribers.len();
            registry.subscribers.clear();
            count
        };
        self.tracker.close();
        closed
    }

    /// Wait until every subscription has been dropped after [`close`].
    ///
    /// [`close`]: Self::close
    pub(crate) async fn wait_idle(&self) {
        self.tracker.wait().await;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.registry.lock().closed
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.registry.lock().subscribers.len()
    }

    pub(crate) fn replay_window(&self) -> Vec<Arc<Event>> {
        self.registry.lock().replay.iter().cloned().collect()
    }

    pub(crate) fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }
}

/// One registered subscriber.
///
/// Events sent after registration arrive through [`recv`](Self::recv). The
/// queue ends when the subscriber is evicted or the handler closes. Dropping
/// the subscription removes it from the handler.
pub struct Subscription {
    id: u64,
    queue: mpsc::Receiver<Arc<Event>>,
    replay: Vec<Arc<Event>>,
    store: Arc<SubscriberStore>,
    _token: TaskTrackerToken,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Retained events the subscriber missed, oldest first.
    pub fn replay(&self) -> &[Arc<Event>] {
        &self.replay
    }

    /// Take the replay batch, leaving it empty.
    pub fn take_replay(&mut self) -> Vec<Arc<Event>> {
        std::mem::take(&mut self.replay)
    }

    /// Wait for the next live event. `None` once the queue is closed.
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        self.queue.recv().await
    }

    /// Take a queued event without waiting.
    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        self.queue.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.store.remove(self.id) {
            info!(subscriber = self.id, "Subscriber disconnected");
        }
    }
}
