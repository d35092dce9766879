//! Configuration of a broadcast handler.

use std::{fmt, sync::Arc};

use axum::http::request::Parts;
use evstream_types::Event;
use serde::Deserialize;

/// Default number of sent events retained for resuming clients.
pub const DEFAULT_REPLAY_CAPACITY: usize = 10;

/// Default number of events buffered per subscriber before it is evicted.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4;

/// Derives the per-connection context from the inbound request.
pub type ConnectHook<C> = Arc<dyn Fn(&Parts) -> C + Send + Sync>;

/// Supplies events written to a subscriber right after it registers.
pub type InitHook<C> = Arc<dyn Fn(&C) -> Vec<Event> + Send + Sync>;

/// Decides whether an event is written to a given subscriber.
pub type FilterHook<C> = Arc<dyn Fn(&C, &Event) -> bool + Send + Sync>;

/// Numeric handler settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HandlerOptions {
    /// Number of sent events kept for clients presenting `Last-Event-ID`
    pub replay_capacity: usize,
    /// Events buffered per subscriber; a subscriber with a full queue is
    /// disconnected on the next send
    pub queue_capacity: usize,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            replay_capacity: DEFAULT_REPLAY_CAPACITY,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl HandlerOptions {
    /// Queue capacity usable for a bounded channel.
    pub(crate) fn effective_queue_capacity(&self) -> usize {
        self.queue_capacity.max(1)
    }
}

/// Handler configuration: options plus optional per-connection hooks.
///
/// `C` is the context type associated with every connection. Without a
/// connect hook each connection gets `C::default()`.
pub struct HandlerConfig<C = ()> {
    pub options: HandlerOptions,
    pub on_connect: Option<ConnectHook<C>>,
    pub on_init: Option<InitHook<C>>,
    pub filter: Option<FilterHook<C>>,
}

impl<C> Default for HandlerConfig<C> {
    fn default() -> Self {
        Self {
            options: HandlerOptions::default(),
            on_connect: None,
            on_init: None,
            filter: None,
        }
    }
}

impl<C> Clone for HandlerConfig<C> {
    fn clone(&self) -> Self {
        Self {
            options: self.options,
            on_connect: self.on_connect.clone(),
            on_init: self.on_init.clone(),
            filter: self.filter.clone(),
        }
    }
}

impl<C> fmt::Debug for HandlerConfig<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerConfig")
            .field("options", &self.options)
            .field("on_connect", &self.on_connect.is_some())
            .field("on_init", &self.on_init.is_some())
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

impl<C> HandlerConfig<C> {
    pub fn new(options: HandlerOptions) -> Self {
        Self {
            options,
            ..Default::default()
        }
    }

    /// Set the number of events kept for replay
    pub fn with_replay_capacity(mut self, capacity: usize) -> Self {
        self.options.replay_capacity = capacity;
        self
    }

    /// Set the per-subscriber queue capacity
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.options.queue_capacity = capacity;
        self
    }

    /// Derive a context value from each inbound request
    pub fn on_connect<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Parts) -> C + Send + Sync + 'static,
    {
        self.on_connect = Some(Arc::new(hook));
        self
    }

    /// Send events to each new subscriber before anything else
    pub fn on_init<F>(mut self, hook: F) -> Self
    where
        F: Fn(&C) -> Vec<Event> + Send + Sync + 'static,
    {
        self.on_init = Some(Arc::new(hook));
        self
    }

    /// Only write events for which `hook` returns `true`
    pub fn with_filter<F>(mut self, hook: F) -> Self
    where
        F: Fn(&C, &Event) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(hook));
        self
    }
}
