// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use slog::{debug, error, info, o, trace, warn, Drain, Logger};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::config::Config;
use crate::context::CallContext;
use crate::error::Error;
use crate::events::{Event, EventSink};
use crate::keepalive::{self, KeepAlive};
use crate::pending::{ConnectionState, PendingTable, Waiter};
use crate::protocol::{self, Inbound, PsyRequest, RequestIdAllocator, Signer};
use crate::transport::{
    self, CloseReason, FrameWriter, SessionCredentials, WsStream,
};

/*
 * Shared between the session handles, the reader loop, the keepalive
 * supervisor and the per-call cancellation watchers.
 */
pub(crate) struct SessionCore {
    pub(crate) log: Logger,
    signer: Signer,
    ids: Arc<RequestIdAllocator>,
    pending: Arc<PendingTable>,
    writer: FrameWriter,
    pub(crate) keepalive: KeepAlive,
    events: EventSink,
    pub(crate) shutdown: CancellationToken,
}

impl SessionCore {
    pub(crate) fn is_connected(&self) -> bool {
        self.pending.state() == ConnectionState::Connected
    }

    /// Encodes, signs and writes one frame. A failed write is fatal to the
    /// connection.
    pub(crate) async fn write(&self, request: &PsyRequest) -> Result<(), Error> {
        let frame = request.to_bytes(&self.signer);
        trace!(self.log, "writing frame";
               "frame" => %String::from_utf8_lossy(&frame));

        match self.writer.write(frame).await {
            Ok(()) => Ok(()),
            Err(err @ Error::WebSocket(_)) => {
                error!(self.log, "failed to write frame"; "err" => %err);
                self.teardown(CloseReason::WriteFailed).await;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Routes one inbound frame: pongs to the keepalive supervisor,
    /// correlated responses to their waiter, everything else to the event
    /// channel.
    pub(crate) fn handle_frame(&self, frame: &[u8]) {
        trace!(self.log, "received frame";
               "frame" => %String::from_utf8_lossy(frame));

        match protocol::decode(frame) {
            Ok(Inbound::Pong) => self.keepalive.pong_received(),
            Ok(Inbound::Response(response)) if response.response_id.is_empty() => {
                self.events.raw_message(frame);
            }
            Ok(Inbound::Response(response)) => {
                debug!(self.log, "received response";
                       "request_id" => &response.response_id);
                if let Err(unmatched) = self.pending.resolve(response) {
                    debug!(self.log, "response matched no pending request";
                           "request_id" => unmatched.response_id);
                    self.events.raw_message(frame);
                }
            }
            Err(err) => {
                warn!(self.log, "failed to decode frame"; "err" => %err);
                self.events.raw_message(frame);
            }
        }
    }

    /// The single transition to `Closed`. Only the first caller does any
    /// work; the rest return `false`.
    pub(crate) async fn teardown(&self, reason: CloseReason) -> bool {
        let abandoned = match self.pending.close() {
            Some(abandoned) => abandoned,
            None => return false,
        };
        info!(self.log, "closing session"; "reason" => %reason,
              "abandoned" => abandoned,
              "probe" => ?self.keepalive.state());

        self.shutdown.cancel();
        self.keepalive.stop();
        self.writer.shutdown(&self.log).await;
        self.events.emit(Event::Disconnected);
        true
    }
}

/// An authenticated RPC session over one WebSocket connection.
///
/// Handles are cheap to clone and all drive the same connection. The
/// connection stays open until [`RpcSession::close`] is called, the peer goes
/// away, a keepalive probe goes unanswered, or the last handle is dropped.
#[derive(Clone)]
pub struct RpcSession {
    core: Arc<SessionCore>,
    // Shared by every handle; the last one out fires the shutdown token and
    // the reader loop tears the session down.
    _shutdown: Arc<DropGuard>,
}

impl RpcSession {
    /// Dials `credentials.connect_url` and starts the reader loop and the
    /// keepalive supervisor. Request ids are drawn from `ids`, which may be
    /// shared with the bootstrap client that produced the credentials.
    pub async fn connect(
        config: &Config,
        credentials: &SessionCredentials,
        ids: Arc<RequestIdAllocator>,
        log: Option<&Logger>,
    ) -> Result<RpcSession, Error> {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
            .new(o!("session" => credentials.session_id.clone()));
        let signer = Signer::new(config.signing_key.as_bytes())?;
        let stream = transport::dial(config, credentials, &log).await?;

        Ok(RpcSession::start(stream, config, signer, ids, log))
    }

    fn start(
        stream: WsStream,
        config: &Config,
        signer: Signer,
        ids: Arc<RequestIdAllocator>,
        log: Logger,
    ) -> RpcSession {
        let (writer, source) = transport::split(stream);
        let session = RpcSession::new(writer, config, signer, ids, log);

        tokio::spawn(transport::read_loop(source, Arc::clone(&session.core)));
        tokio::spawn(keepalive::supervise(Arc::clone(&session.core)));

        session
    }

    fn new(
        writer: FrameWriter,
        config: &Config,
        signer: Signer,
        ids: Arc<RequestIdAllocator>,
        log: Logger,
    ) -> RpcSession {
        let shutdown = CancellationToken::new();
        let core = Arc::new(SessionCore {
            signer,
            ids,
            pending: Arc::new(PendingTable::new()),
            writer,
            keepalive: KeepAlive::new(config.ping_interval, config.pong_timeout),
            events: EventSink::new(config.event_capacity, &log),
            shutdown: shutdown.clone(),
            log,
        });

        RpcSession {
            core,
            _shutdown: Arc::new(shutdown.drop_guard()),
        }
    }

    /// Sends a request and returns as soon as it is on the wire. The
    /// returned [`Waiter`] yields the response envelope.
    ///
    /// If `ctx` is cancelled or times out before the response arrives, the
    /// pending entry is removed and the waiter resolves as closed.
    pub async fn call_async<T>(
        &self,
        ctx: &CallContext,
        service: &str,
        body: &T,
    ) -> Result<Waiter, Error>
    where
        T: Serialize + ?Sized,
    {
        let core = &self.core;
        if !core.is_connected() {
            return Err(Error::NotConnected);
        }

        let request_id = core.ids.next_id();
        let request = PsyRequest::call(service, &request_id, body)?;

        let registration = core.pending.insert(&request_id)?;
        // From here on, dropping the waiter (an error below, or the caller
        // abandoning this future) takes the entry back out.
        let waiter = Waiter::new(
            request_id.clone(),
            registration.rx,
            Arc::clone(&core.pending),
        );

        debug!(core.log, "sending request";
               "request_id" => &request_id, "service" => service);
        core.write(&request).await?;

        self.watch(ctx.clone(), request_id, registration.settled);
        Ok(waiter)
    }

    /// Sends a request and waits for its result, decoded as `R`.
    ///
    /// Errors distinguish a server-side failure ([`Error::Protocol`]), a
    /// result of the wrong shape ([`Error::Json`]), the caller giving up
    /// ([`Error::Cancelled`], [`Error::DeadlineExceeded`]) and the
    /// connection going away ([`Error::Closed`] and transport errors).
    pub async fn call<T, R>(
        &self,
        ctx: &CallContext,
        service: &str,
        body: &T,
    ) -> Result<R, Error>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let waiter = self.call_async(ctx, service, body).await?;

        let response = tokio::select! {
            response = waiter.recv() => response,
            err = ctx.done() => return Err(err),
        };

        match response {
            Ok(response) => response.into_result(),
            // The watcher may have beaten us to a cancelled context.
            Err(Error::Closed) => Err(ctx.err().unwrap_or(Error::Closed)),
            Err(err) => Err(err),
        }
    }

    fn watch(
        &self,
        ctx: CallContext,
        request_id: String,
        settled: CancellationToken,
    ) {
        let pending = Arc::clone(&self.core.pending);
        let log = self.core.log.clone();

        tokio::spawn(async move {
            tokio::select! {
                err = ctx.done() => {
                    if pending.cancel(&request_id) {
                        debug!(log, "request abandoned";
                               "request_id" => &request_id, "err" => %err);
                    }
                }
                _ = settled.cancelled() => (),
            }
        });
    }

    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.core.pending.state()
    }

    /// Closes the connection and fails every pending call with
    /// [`Error::Closed`]. Closing a closed session does nothing.
    pub async fn close(&self) -> Result<(), Error> {
        self.core.teardown(CloseReason::Requested).await;
        Ok(())
    }

    /// The bounded event channel. Only the first call receives it.
    pub fn events(&self) -> Option<mpsc::Receiver<Event>> {
        self.core.events.take_receiver()
    }

    /// Number of requests still waiting on a response.
    pub fn pending_count(&self) -> usize {
        self.core.pending.len()
    }

    pub fn request_ids(&self) -> &Arc<RequestIdAllocator> {
        &self.core.ids
    }
}

impl fmt::Debug for RpcSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcSession")
            .field("state", &self.state())
            .field("pending", &self.pending_count())
            .finish()
    }
}
