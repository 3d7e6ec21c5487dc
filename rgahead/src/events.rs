//! Notifications published by the head.
//!
//! Consumers call [`EventBus::subscribe`] and receive every later
//! [`HeadEvent`] on their own channel. Subscribers that hang up are pruned on
//! the next publish.

use {
    crate::{
        device::DeviceState,
        error::{Error, FailureKind},
    },
    log::{debug, info, warn},
    parking_lot::Mutex,
    std::sync::mpsc::{self, Receiver, Sender},
};

/// Something the head wants its consumers to know.
#[derive(Debug, Clone, PartialEq)]
pub enum HeadEvent {
    /// A command was written to the channel.
    TerminalLog(String),
    /// A failure was handled.
    Exception {
        /// Failure class.
        kind: FailureKind,
        /// Rendered error.
        message: String,
        /// Where it happened.
        context: String,
    },
    /// The state changed.
    StateChanged {
        /// Previous state.
        from: DeviceState,
        /// New state.
        to: DeviceState,
    },
    /// A scan finished and its result is readable.
    ScanCompleted,
}

/// Subscriber list for [`HeadEvent`]s.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<HeadEvent>>>,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> Receiver<HeadEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Deliver `event` to every subscriber.
    pub fn publish(&self, event: HeadEvent) {
        match &event {
            HeadEvent::TerminalLog(text) => debug!("> {text}"),
            HeadEvent::Exception {
                kind,
                message,
                context,
            } => warn!("{kind:?} in {context}: {message}"),
            HeadEvent::StateChanged { from, to } => info!("State {from} -> {to}"),
            HeadEvent::ScanCompleted => debug!("Scan completed"),
        }
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Publish an exception event for `error`.
    pub fn exception(&self, error: &Error, context: impl Into<String>) {
        self.publish(HeadEvent::Exception {
            kind: error.failure_kind(),
            message: error.to_string(),
            context: context.into(),
        });
    }
}
