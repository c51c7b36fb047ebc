// Copyright 2020 Joyent, Inc.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use slog::{debug, warn};
use tokio::sync::Notify;
use tokio::time;

use crate::client::SessionCore;
use crate::protocol::PsyRequest;
use crate::transport::CloseReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProbeState {
    /// Waiting out the interval before the next probe.
    Disarmed,
    /// A probe is on the wire and the pong deadline is running.
    Armed,
    /// The supervisor has exited.
    Stopped,
}

/*
 * At most one probe is ever in flight: the next one is scheduled only after
 * the previous pong arrived. A missed pong is a dead connection.
 */
pub(crate) struct KeepAlive {
    interval: Duration,
    timeout: Duration,
    pong: Notify,
    state: Mutex<ProbeState>,
}

impl KeepAlive {
    pub(crate) fn new(interval: Duration, timeout: Duration) -> KeepAlive {
        KeepAlive {
            interval,
            timeout,
            pong: Notify::new(),
            state: Mutex::new(ProbeState::Disarmed),
        }
    }

    /// Wakes the supervisor if it is waiting on a pong. Dropped otherwise.
    pub(crate) fn pong_received(&self) {
        self.pong.notify_waiters();
    }

    pub(crate) fn state(&self) -> ProbeState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, next: ProbeState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != ProbeState::Stopped {
            *state = next;
        }
    }

    pub(crate) fn stop(&self) {
        self.transition(ProbeState::Stopped);
    }
}

pub(crate) async fn supervise(core: Arc<SessionCore>) {
    let keepalive = &core.keepalive;

    loop {
        tokio::select! {
            _ = core.shutdown.cancelled() => break,
            _ = time::sleep(keepalive.interval) => (),
        }

        if !core.is_connected() {
            break;
        }

        // Register for the pong before the ping goes out so a fast reply
        // can't slip past.
        let pong = keepalive.pong.notified();
        tokio::pin!(pong);
        pong.as_mut().enable();

        if let Err(err) = core.write(&PsyRequest::ping()).await {
            debug!(core.log, "failed to send ping"; "err" => %err);
            break;
        }
        keepalive.transition(ProbeState::Armed);
        debug!(core.log, "sent ping");

        tokio::select! {
            _ = core.shutdown.cancelled() => break,
            res = time::timeout(keepalive.timeout, pong) => match res {
                Ok(()) => {
                    keepalive.transition(ProbeState::Disarmed);
                    debug!(core.log, "received pong");
                }
                Err(_) => {
                    warn!(core.log, "no pong before deadline";
                          "timeout" => ?keepalive.timeout);
                    core.teardown(CloseReason::KeepAliveTimeout).await;
                    break;
                }
            },
        }
    }

    keepalive.stop();
}
