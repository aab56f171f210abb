//! Configuration events and their delivery
//!
//! Every subscriber owns an unbounded channel, so emitting never
//! blocks and each subscriber sees events in emission order. There is
//! no backlog: a subscriber only receives events emitted after it
//! registered. Dropping an [`EventReceiver`] unsubscribes it.

use crate::error::ErrorCode;
use futures::Stream;
use serde::Serialize;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::debug;

/// Highest permille value a progress event may carry. Completion is
/// signalled by [`Event::Ready`], never by a progress value.
const MAX_PROGRESS: u16 = 999;

/// An event emitted while configuring an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// Progress of the running attempt, in permille (1..=999).
    ConfigureProgress { permille: u16 },
    /// Informational message from the negotiation.
    Info { message: String },
    /// Something went wrong but the attempt continues.
    Warning { message: String },
    /// Terminal: the account is configured.
    Ready { addr: String },
    /// Terminal: the attempt failed.
    Error { code: ErrorCode, message: String },
}

impl Event {
    #[must_use]
    pub const fn class(&self) -> EventClass {
        match self {
            Self::ConfigureProgress { .. } => EventClass::Progress,
            Self::Info { .. } => EventClass::Info,
            Self::Warning { .. } => EventClass::Warning,
            Self::Ready { .. } => EventClass::Ready,
            Self::Error { .. } => EventClass::Error,
        }
    }

    /// Whether this event ends a `configure` invocation.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready { .. } | Self::Error { .. })
    }

    /// The two payload slots of the event, as handed to wildcard
    /// listeners alongside [`Event::class`].
    #[must_use]
    pub fn data(&self) -> (Option<String>, Option<String>) {
        match self {
            Self::ConfigureProgress { permille } => (Some(permille.to_string()), None),
            Self::Info { message } | Self::Warning { message } => (None, Some(message.clone())),
            Self::Ready { addr } => (Some(addr.clone()), None),
            Self::Error { code, message } => (Some(code.to_string()), Some(message.clone())),
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (data1, data2) = self.data();
        write!(
            f,
            "{} {} {}",
            self.class(),
            data1.as_deref().unwrap_or("-"),
            data2.as_deref().unwrap_or("-")
        )
    }
}

/// The closed set of event classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventClass {
    Progress,
    Info,
    Warning,
    Ready,
    Error,
}

impl EventClass {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Progress => "progress",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Ready => "ready",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for EventClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which events a subscriber wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    /// Every event.
    All,
    /// Only events of one class.
    Class(EventClass),
}

impl EventFilter {
    #[must_use]
    pub fn matches(self, event: &Event) -> bool {
        match self {
            Self::All => true,
            Self::Class(class) => event.class() == class,
        }
    }
}

struct Subscriber {
    filter: EventFilter,
    tx: mpsc::UnboundedSender<Event>,
}

/// Fan-out point shared by the controller and its background tasks.
#[derive(Clone, Default)]
pub(crate) struct EventHub {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl EventHub {
    pub(crate) fn subscribe(&self, filter: EventFilter) -> EventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber { filter, tx });
        EventReceiver { rx }
    }

    pub(crate) fn emit(&self, event: Event) {
        debug!("event: {}", event);
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|sub| {
            if sub.filter.matches(&event) {
                sub.tx.send(event.clone()).is_ok()
            } else {
                !sub.tx.is_closed()
            }
        });
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Receiving end of a subscription.
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventReceiver {
    /// Wait for the next event. Returns `None` once the controller and
    /// all of its tasks are gone.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Take the next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Skip non-terminal events and return the next `Ready` or `Error`.
    pub async fn wait_terminal(&mut self) -> Option<Event> {
        while let Some(event) = self.rx.recv().await {
            if event.is_terminal() {
                return Some(event);
            }
        }
        None
    }
}

impl Stream for EventReceiver {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Non-terminal event sink handed to a negotiator.
///
/// Terminal events are reserved for the controller, so a negotiator
/// cannot end an invocation early or twice. The controller closes the
/// sink before it emits the terminal event; anything reported through a
/// closed sink, including clones held by leftover tasks, is dropped.
#[derive(Clone)]
pub struct Progress {
    hub: EventHub,
    closed: Arc<Mutex<bool>>,
}

impl Progress {
    pub(crate) fn new(hub: EventHub) -> Self {
        Self {
            hub,
            closed: Arc::new(Mutex::new(false)),
        }
    }

    /// Stop forwarding events. Returns once no emit is in flight.
    pub(crate) fn close(&self) {
        *self.closed.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }

    /// Report progress in permille. Values are clamped to 1..=999.
    pub fn permille(&self, permille: u16) {
        self.send(Event::ConfigureProgress {
            permille: permille.clamp(1, MAX_PROGRESS),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.send(Event::Info {
            message: message.into(),
        });
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.send(Event::Warning {
            message: message.into(),
        });
    }

    fn send(&self, event: Event) {
        // Held across the emit so `close` cannot slip in between.
        let closed = self.closed.lock().unwrap_or_else(PoisonError::into_inner);
        if *closed {
            debug!("dropping event after close: {}", event);
        } else {
            self.hub.emit(event);
        }
        drop(closed);
    }
}
