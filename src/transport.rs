// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::SplitStream;
use futures::{Sink, SinkExt, StreamExt};
use slog::{debug, error, info, Logger};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::USER_AGENT;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message, Utf8Bytes};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::client::SessionCore;
use crate::config::Config;
use crate::error::Error;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = Pin<Box<dyn Sink<Message, Error = tungstenite::Error> + Send>>;
type WsSource = SplitStream<WsStream>;

pub const BUILD_ID_HEADER: &str = "PsyBuildID";
pub const ENVIRONMENT_HEADER: &str = "PsyEnvironment";
pub const TOKEN_HEADER: &str = "PsyToken";
pub const SESSION_ID_HEADER: &str = "PsySessionID";

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// What the bootstrap exchange yields: where to dial, and the tokens the
/// socket must present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCredentials {
    pub connect_url: String,
    pub session_id: String,
    pub psy_token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReason {
    Requested,
    PeerClosed,
    ReadFailed,
    WriteFailed,
    KeepAliveTimeout,
    Dropped,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            CloseReason::Requested => "close requested",
            CloseReason::PeerClosed => "peer closed connection",
            CloseReason::ReadFailed => "read failed",
            CloseReason::WriteFailed => "write failed",
            CloseReason::KeepAliveTimeout => "keepalive timed out",
            CloseReason::Dropped => "every session handle dropped",
        };
        f.write_str(reason)
    }
}

pub(crate) async fn dial(
    config: &Config,
    credentials: &SessionCredentials,
    log: &Logger,
) -> Result<WsStream, Error> {
    let mut request = credentials.connect_url.as_str().into_client_request()?;
    let headers = request.headers_mut();
    headers.insert(BUILD_ID_HEADER, HeaderValue::from_str(&config.build_id)?);
    headers.insert(USER_AGENT, HeaderValue::from_str(&config.socket_user_agent())?);
    headers.insert(ENVIRONMENT_HEADER, HeaderValue::from_str(&config.environment)?);
    headers.insert(TOKEN_HEADER, HeaderValue::from_str(&credentials.psy_token)?);
    headers.insert(SESSION_ID_HEADER, HeaderValue::from_str(&credentials.session_id)?);

    debug!(log, "dialing websocket"; "url" => &credentials.connect_url);
    let (stream, response) = connect_async(request).await?;
    info!(log, "websocket connected"; "status" => %response.status());

    Ok(stream)
}

pub(crate) fn split(stream: WsStream) -> (FrameWriter, WsSource) {
    let (sink, source) = stream.split();
    (FrameWriter::new(sink), source)
}

/// The write half of the socket. Callers take turns; a frame is never
/// interleaved with another.
pub(crate) struct FrameWriter {
    sink: Mutex<Option<WsSink>>,
}

impl FrameWriter {
    pub(crate) fn new<S>(sink: S) -> FrameWriter
    where
        S: Sink<Message, Error = tungstenite::Error> + Send + 'static,
    {
        FrameWriter {
            sink: Mutex::new(Some(Box::pin(sink))),
        }
    }

    pub(crate) async fn write(&self, frame: Bytes) -> Result<(), Error> {
        // Text unless a caller attached a payload that is not UTF-8.
        let message = match Utf8Bytes::try_from(frame.clone()) {
            Ok(text) => Message::Text(text),
            Err(_) => Message::Binary(frame),
        };

        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(Error::NotConnected)?;
        sink.send(message).await?;
        Ok(())
    }

    /// Best-effort close notification to the peer, then releases the write
    /// half. Later writes fail with `NotConnected`.
    pub(crate) async fn shutdown(&self, log: &Logger) {
        let close = async {
            let mut guard = self.sink.lock().await;
            if let Some(mut sink) = guard.take() {
                if let Err(err) = sink.send(Message::Close(None)).await {
                    debug!(log, "failed to send close frame"; "err" => %err);
                }
                let _ = sink.close().await;
            }
        };
        if time::timeout(CLOSE_TIMEOUT, close).await.is_err() {
            debug!(log, "timed out closing websocket");
        }
    }
}

/*
 * The only reader of the socket. Frames are handled strictly in arrival
 * order. Any read failure, the peer closing, or the shutdown token firing
 * ends the loop and tears the session down. After a local close the teardown
 * here finds the session already closed and does nothing.
 */
pub(crate) async fn read_loop(mut source: WsSource, core: Arc<SessionCore>) {
    let reason = loop {
        let next = tokio::select! {
            _ = core.shutdown.cancelled() => break CloseReason::Dropped,
            next = source.next() => next,
        };

        match next {
            Some(Ok(Message::Text(text))) => {
                core.handle_frame(text.as_str().as_bytes())
            }
            Some(Ok(Message::Binary(data))) => core.handle_frame(&data),
            Some(Ok(Message::Close(frame))) => {
                debug!(core.log, "peer closed websocket"; "frame" => ?frame);
                break CloseReason::PeerClosed;
            }
            Some(Ok(_)) => (),
            Some(Err(err)) => {
                error!(core.log, "failed to read websocket message";
                       "err" => %err);
                break CloseReason::ReadFailed;
            }
            None => break CloseReason::ReadFailed,
        }
    };

    core.teardown(reason).await;
}
