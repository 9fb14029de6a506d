//! Typed publish/subscribe bus for session events
//!
//! Handlers are registered per event kind and run in registration order.
//! Dispatch iterates a snapshot of the handler list, so a handler may
//! unsubscribe itself (or others) while an event is being delivered. A
//! handler returning an error is logged and the remaining handlers still run.

use crate::types::CloseError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

/// Events that can be routed by kind
pub trait EventKind {
    type Kind: Copy + Eq + Hash + Debug + Send;

    fn kind(&self) -> Self::Kind;
}

/// Handle returned by [`EventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler<E> = Arc<dyn Fn(&E) -> anyhow::Result<()> + Send + Sync>;

struct Subscribers<E: EventKind> {
    next_id: u64,
    handlers: HashMap<E::Kind, Vec<(SubscriptionId, Handler<E>)>>,
}

/// Event bus keyed by event kind
pub struct EventBus<E: EventKind> {
    inner: Mutex<Subscribers<E>>,
}

impl<E: EventKind> EventBus<E> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Subscribers {
                next_id: 1,
                handlers: HashMap::new(),
            }),
        }
    }

    /// Register a handler for one kind of event
    pub fn subscribe<F>(&self, kind: E::Kind, handler: F) -> SubscriptionId
    where
        F: Fn(&E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;
        inner
            .handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.lock();
        let mut removed = false;
        inner.handlers.retain(|_, list| {
            let before = list.len();
            list.retain(|(sub, _)| *sub != id);
            removed |= list.len() != before;
            !list.is_empty()
        });
        removed
    }

    /// Remove every handler
    pub fn clear(&self) {
        self.lock().handlers.clear();
    }

    pub fn handler_count(&self, kind: E::Kind) -> usize {
        self.lock().handlers.get(&kind).map_or(0, Vec::len)
    }

    /// Deliver an event. Returns the number of handlers that succeeded.
    pub fn emit(&self, event: &E) -> usize {
        let kind = event.kind();
        let snapshot: Vec<(SubscriptionId, Handler<E>)> = self
            .lock()
            .handlers
            .get(&kind)
            .cloned()
            .unwrap_or_default();

        let mut delivered = 0;
        for (id, handler) in snapshot {
            match handler(event) {
                Ok(()) => delivered += 1,
                Err(err) => warn!(?kind, subscription = id.0, error = %err, "Event handler failed"),
            }
        }
        delivered
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Subscribers<E>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<E: EventKind> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Events surfaced by a pull session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A recoverable or terminal error
    Error { code: String, message: String },
    /// The connection to the server closed for good
    Close { error: Option<CloseError> },
    /// No more fragments, and the buffer has ended
    Ended,
}

/// Kinds of [`SessionEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEventKind {
    Error,
    Close,
    Ended,
}

impl EventKind for SessionEvent {
    type Kind = SessionEventKind;

    fn kind(&self) -> SessionEventKind {
        match self {
            SessionEvent::Error { .. } => SessionEventKind::Error,
            SessionEvent::Close { .. } => SessionEventKind::Close,
            SessionEvent::Ended => SessionEventKind::Ended,
        }
    }
}

impl SessionEvent {
    pub fn error(err: &crate::Error) -> Self {
        SessionEvent::Error {
            code: err.error_code().to_string(),
            message: err.to_string(),
        }
    }
}
