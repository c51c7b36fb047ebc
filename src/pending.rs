// Copyright 2020 Joyent, Inc.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::Error;
use crate::protocol::PsyResponse;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Closed,
}

#[derive(Debug)]
pub(crate) enum Outcome {
    Response(PsyResponse),
    Closed,
}

struct PendingEntry {
    tx: oneshot::Sender<Outcome>,
    // Cancels the entry's `settled` token when the entry is dropped, however
    // it left the table.
    _settled: DropGuard,
}

impl PendingEntry {
    fn resolve(self, outcome: Outcome) {
        // The waiter may already be gone; nothing to deliver to then.
        let _ = self.tx.send(outcome);
    }
}

struct Inner {
    state: ConnectionState,
    entries: HashMap<String, PendingEntry>,
}

/// What `insert` hands back: the receiving end of the waiter, and a token
/// that fires once the entry has left the table.
pub(crate) struct Registration {
    pub(crate) rx: oneshot::Receiver<Outcome>,
    pub(crate) settled: CancellationToken,
}

/*
 * The connection state lives under the same lock as the entries, so "admit a
 * call" and "tear the connection down" can never interleave: an entry is only
 * inserted while Connected, and the transition to Closed drains every entry
 * in the same critical section.
 */
pub(crate) struct PendingTable {
    inner: Mutex<Inner>,
}

impl PendingTable {
    pub(crate) fn new() -> PendingTable {
        PendingTable {
            inner: Mutex::new(Inner {
                state: ConnectionState::Connected,
                entries: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub(crate) fn insert(&self, id: &str) -> Result<Registration, Error> {
        let mut inner = self.lock();
        if inner.state != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }

        match inner.entries.entry(id.to_string()) {
            Entry::Occupied(_) => Err(Error::DuplicateRequestId(id.to_string())),
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                let settled = CancellationToken::new();
                slot.insert(PendingEntry {
                    tx,
                    _settled: settled.clone().drop_guard(),
                });
                Ok(Registration { rx, settled })
            }
        }
    }

    /// Delivers `response` to the waiter registered under its response id.
    /// The response is handed back when nobody is waiting for it.
    pub(crate) fn resolve(&self, response: PsyResponse) -> Result<(), PsyResponse> {
        let entry = self.lock().entries.remove(&response.response_id);
        match entry {
            Some(entry) => {
                entry.resolve(Outcome::Response(response));
                Ok(())
            }
            None => Err(response),
        }
    }

    /// Removes the entry and wakes its waiter with a closed signal.
    pub(crate) fn cancel(&self, id: &str) -> bool {
        let entry = self.lock().entries.remove(id);
        match entry {
            Some(entry) => {
                entry.resolve(Outcome::Closed);
                true
            }
            None => false,
        }
    }

    /// Removes the entry without delivering anything.
    pub(crate) fn remove(&self, id: &str) -> bool {
        self.lock().entries.remove(id).is_some()
    }

    /// Moves the table to `Closed` and resolves every remaining entry with a
    /// closed signal. Returns the number of entries drained, or `None` if
    /// the table was already closed.
    pub(crate) fn close(&self) -> Option<usize> {
        let drained: Vec<PendingEntry> = {
            let mut inner = self.lock();
            if inner.state == ConnectionState::Closed {
                return None;
            }
            inner.state = ConnectionState::Closed;
            inner.entries.drain().map(|(_, entry)| entry).collect()
        };

        let count = drained.len();
        for entry in drained {
            entry.resolve(Outcome::Closed);
        }
        Some(count)
    }
}

/// The caller's half of a pending request: a slot filled at most once, with
/// either the response or a closed signal.
///
/// Dropping a `Waiter` before it resolves removes its pending entry.
pub struct Waiter {
    request_id: String,
    rx: oneshot::Receiver<Outcome>,
    table: Arc<PendingTable>,
}

impl Waiter {
    pub(crate) fn new(
        request_id: String,
        rx: oneshot::Receiver<Outcome>,
        table: Arc<PendingTable>,
    ) -> Waiter {
        Waiter {
            request_id,
            rx,
            table,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Waits for the response. Fails with [`Error::Closed`] if the session
    /// closed or the request was abandoned first.
    pub async fn recv(mut self) -> Result<PsyResponse, Error> {
        match (&mut self.rx).await {
            Ok(Outcome::Response(response)) => Ok(response),
            Ok(Outcome::Closed) | Err(_) => Err(Error::Closed),
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.table.remove(&self.request_id);
    }
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter")
            .field("request_id", &self.request_id)
            .finish()
    }
}
