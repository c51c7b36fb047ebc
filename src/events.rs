// Copyright 2020 Joyent, Inc.

use std::sync::{Mutex, MutexGuard, PoisonError};

use slog::{debug, warn, Logger};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Notifications surfaced to the embedding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The session reached its terminal state.
    Disconnected,
    /// An inbound frame that matched no pending request, or that could not
    /// be decoded at all.
    RawMessage(String),
}

/*
 * Delivery never blocks: the reader loop and the keepalive supervisor emit
 * events, and stalling either one would stall every in-flight call. When the
 * consumer falls behind, new events are dropped. Drops only warn once someone
 * has subscribed; an unclaimed channel fills up as a matter of course.
 */
pub(crate) struct EventSink {
    tx: mpsc::Sender<Event>,
    rx: Mutex<Option<mpsc::Receiver<Event>>>,
    log: Logger,
}

impl EventSink {
    pub(crate) fn new(capacity: usize, log: &Logger) -> EventSink {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        EventSink {
            tx,
            rx: Mutex::new(Some(rx)),
            log: log.clone(),
        }
    }

    pub(crate) fn emit(&self, event: Event) {
        match self.tx.try_send(event) {
            Ok(()) => (),
            Err(TrySendError::Full(event)) if self.subscribed() => {
                warn!(self.log, "event channel full, dropping event";
                      "event" => ?event);
            }
            Err(TrySendError::Full(event)) => {
                debug!(self.log, "no event subscriber, dropping event";
                       "event" => ?event);
            }
            Err(TrySendError::Closed(_)) => {
                debug!(self.log, "event receiver dropped");
            }
        }
    }

    pub(crate) fn raw_message(&self, frame: &[u8]) {
        let content = String::from_utf8_lossy(frame).into_owned();
        self.emit(Event::RawMessage(content));
    }

    /// Hands out the receiving end. Only the first call gets it.
    pub(crate) fn take_receiver(&self) -> Option<mpsc::Receiver<Event>> {
        self.parked().take()
    }

    fn subscribed(&self) -> bool {
        self.parked().is_none()
    }

    fn parked(&self) -> MutexGuard<'_, Option<mpsc::Receiver<Event>>> {
        self.rx.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
