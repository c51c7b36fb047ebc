// Copyright 2020 Joyent, Inc.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use slog::{o, Drain, Level, LevelFilter, Logger};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tokio_tungstenite::tungstenite::Message;

use psynet_rpc::{Config, RequestIdAllocator, RpcSession, SessionCredentials};

pub const SIGNING_KEY: &str = "test-signing-key";

/// Turns one inbound frame into the frames sent back.
pub type Handler = Box<dyn FnMut(&str) -> Vec<String> + Send>;

pub fn logger() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            Level::Info,
        ))
        .fuse(),
        o!("build-id" => "0.1.0"),
    )
}

pub fn config(ping_interval: Duration, pong_timeout: Duration) -> Config {
    let mut config = Config::new(SIGNING_KEY);
    config.ping_interval = ping_interval;
    config.pong_timeout = pong_timeout;
    config
}

pub fn header<'a>(frame: &'a str, name: &str) -> Option<&'a str> {
    let (headers, _) = frame.split_once("\r\n\r\n")?;
    headers
        .split("\r\n")
        .filter_map(|line| line.split_once(':'))
        .find(|(key, _)| key.trim() == name)
        .map(|(_, value)| value.trim())
}

pub fn body(frame: &str) -> &str {
    frame.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or("")
}

pub fn is_ping(frame: &str) -> bool {
    frame.starts_with("PsyPing:")
}

pub fn reply(request_id: &str, body: &str) -> String {
    format!(
        "PsyTime: 1700000000\r\nPsySig: test_sig\r\nPsyResponseID: {}\r\n\r\n{}",
        request_id, body
    )
}

pub fn pong() -> String {
    "PsyPong: \r\n\r\n".to_string()
}

/// Answers pings, and echoes each call's payload back as its result.
pub fn echo() -> Handler {
    Box::new(|frame: &str| {
        if is_ping(frame) {
            return vec![pong()];
        }
        match header(frame, "PsyRequestID") {
            Some(id) => vec![reply(id, &format!("{{\"Result\":{}}}", body(frame)))],
            None => vec![],
        }
    })
}

/// A WebSocket server that accepts exactly one connection.
pub struct MockServer {
    pub url: String,
    pub headers: Arc<Mutex<Vec<(String, String)>>>,
    pub frames: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
    push: mpsc::UnboundedSender<Message>,
}

impl MockServer {
    pub async fn start(handler: Handler) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let headers = Arc::new(Mutex::new(Vec::new()));
        let frames = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let (push, push_rx) = mpsc::unbounded_channel();

        let conn = serve(
            listener,
            handler,
            Arc::clone(&headers),
            Arc::clone(&frames),
            push_rx,
        );
        let done = Arc::clone(&closed);
        tokio::spawn(async move {
            conn.await;
            done.store(true, Ordering::SeqCst);
        });

        MockServer {
            url: format!("ws://{}/ws", addr),
            headers,
            frames,
            closed,
            push,
        }
    }

    pub fn credentials(&self) -> SessionCredentials {
        SessionCredentials {
            connect_url: self.url.clone(),
            session_id: "session-1".to_string(),
            psy_token: "psy-token-1".to_string(),
        }
    }

    pub async fn connect(&self, config: &Config) -> RpcSession {
        RpcSession::connect(
            config,
            &self.credentials(),
            Arc::new(RequestIdAllocator::default()),
            Some(&logger()),
        )
        .await
        .unwrap()
    }

    /// Sends a frame the client did not ask for.
    pub fn send(&self, frame: &str) {
        self.push.send(Message::text(frame.to_string())).unwrap();
    }

    pub fn close(&self) {
        let _ = self.push.send(Message::Close(None));
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .lock()
            .unwrap()
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.clone())
    }

    pub fn frames(&self) -> Vec<String> {
        self.frames.lock().unwrap().clone()
    }

    pub fn pings(&self) -> usize {
        self.frames().iter().filter(|f| is_ping(f)).count()
    }

    /// Whether the connection has ended, from the server's side.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

async fn serve(
    listener: TcpListener,
    mut handler: Handler,
    headers: Arc<Mutex<Vec<(String, String)>>>,
    frames: Arc<Mutex<Vec<String>>>,
    mut push: mpsc::UnboundedReceiver<Message>,
) {
    let (stream, _) = listener.accept().await.unwrap();
    let record = |request: &Request, response: Response| {
        let mut captured = headers.lock().unwrap();
        for (key, value) in request.headers() {
            captured.push((
                key.as_str().to_string(),
                value.to_str().unwrap_or_default().to_string(),
            ));
        }
        Ok::<_, ErrorResponse>(response)
    };
    let mut ws = match accept_hdr_async(stream, record).await {
        Ok(ws) => ws,
        Err(_) => return,
    };

    loop {
        tokio::select! {
            msg = ws.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text.as_str().to_string(),
                    Some(Ok(Message::Binary(data))) => {
                        String::from_utf8_lossy(&data).into_owned()
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                frames.lock().unwrap().push(text.clone());
                for out in handler(&text) {
                    if ws.send(Message::text(out)).await.is_err() {
                        return;
                    }
                }
            }
            Some(msg) = push.recv() => {
                let closing = matches!(msg, Message::Close(_));
                let _ = ws.send(msg).await;
                if closing {
                    // Keep reading until the client acknowledges.
                    while let Some(Ok(_)) = ws.next().await {}
                    break;
                }
            }
        }
    }
}
