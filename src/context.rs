// Copyright 2020 Joyent, Inc.

//! Caller-supplied scope for an RPC call.
//!
//! A [`CallContext`] pairs a cancellation token with an optional deadline.
//! Every outstanding call is bound to one; when the context is cancelled or
//! its deadline passes, the call's pending entry is removed and the caller is
//! unblocked with [`Error::Cancelled`] or [`Error::DeadlineExceeded`]. The
//! connection and other in-flight calls are unaffected.

use std::time::Duration;

use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::Error;

#[derive(Debug, Clone)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    /// A context that is never done unless explicitly cancelled.
    pub fn background() -> CallContext {
        CallContext {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_timeout(timeout: Duration) -> CallContext {
        CallContext::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> CallContext {
        CallContext {
            token: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// A context cancelled along with `self`, optionally with a tighter
    /// deadline.
    pub fn child(&self, timeout: Option<Duration>) -> CallContext {
        let deadline = match (self.deadline, timeout) {
            (Some(parent), Some(t)) => Some(parent.min(Instant::now() + t)),
            (None, Some(t)) => Some(Instant::now() + t),
            (parent, None) => parent,
        };
        CallContext {
            token: self.token.child_token(),
            deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The reason this context is done, or `None` while it is still live.
    pub fn err(&self) -> Option<Error> {
        if self.token.is_cancelled() {
            return Some(Error::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                Some(Error::DeadlineExceeded)
            }
            _ => None,
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> Error {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => Error::Cancelled,
                _ = time::sleep_until(deadline) => Error::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                Error::Cancelled
            }
        }
    }
}

impl Default for CallContext {
    fn default() -> Self {
        CallContext::background()
    }
}
