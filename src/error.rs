// Copyright 2020 Joyent, Inc.

use std::fmt;

use serde_derive::Deserialize;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// The error carried in the `Error` member of a response envelope.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProtocolError {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "Message", default)]
    pub message: String,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Reasons an inbound frame could not be turned into a response envelope.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame does not contain the header delimiter")]
    MissingDelimiter,
    #[error("header block is not valid UTF-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("failed to parse JSON body: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// Coarse classification of [`Error`], for deciding whether to retry,
/// reconnect or give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The connection failed or could not be established. Reconnect.
    Transport,
    /// The session was already closed, or closed while the call was pending.
    Closed,
    /// The server answered with an `Error` envelope. Scoped to one request.
    Protocol,
    /// A payload could not be encoded or a result could not be decoded.
    Codec,
    /// The caller's context was cancelled or its deadline passed.
    Cancelled,
    /// The embedding application supplied unusable settings or reused a
    /// request id.
    Config,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("session is not connected")]
    NotConnected,
    #[error("session closed")]
    Closed,
    #[error("context cancelled")]
    Cancelled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
    #[error("{0}")]
    Protocol(ProtocolError),
    #[error("failed to decode frame: {0}")]
    Decode(#[from] DecodeError),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("websocket: {0}")]
    WebSocket(Box<tungstenite::Error>),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected http status: {0}")]
    HttpStatus(reqwest::StatusCode),
    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),
    #[error("invalid signing key")]
    InvalidSigningKey,
    #[error("request id {0} is already pending")]
    DuplicateRequestId(String),
    #[error("authentication response carried no connect url")]
    MissingConnectUrl,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotConnected | Error::Closed => ErrorKind::Closed,
            Error::Cancelled | Error::DeadlineExceeded => ErrorKind::Cancelled,
            Error::Protocol(_) | Error::MissingConnectUrl => ErrorKind::Protocol,
            Error::Decode(_) | Error::Json(_) => ErrorKind::Codec,
            Error::WebSocket(_) | Error::Http(_) | Error::HttpStatus(_) => {
                ErrorKind::Transport
            }
            Error::InvalidHeader(_)
            | Error::InvalidSigningKey
            | Error::DuplicateRequestId(_) => ErrorKind::Config,
        }
    }
}

impl From<tungstenite::Error> for Error {
    fn from(err: tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(err))
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn protocol_error_from_envelope() {
        let err: ProtocolError = serde_json::from_str(
            r#"{"Type":"InvalidParameters","Message":"bad id"}"#,
        )
        .unwrap();
        assert_eq!(err.kind, "InvalidParameters");
        assert_eq!(err.to_string(), "InvalidParameters: bad id");

        let err: ProtocolError =
            serde_json::from_str(r#"{"Type":"Unauthorized"}"#).unwrap();
        assert!(err.message.is_empty());
    }

    #[test]
    fn kinds() {
        assert_eq!(Error::Closed.kind(), ErrorKind::Closed);
        assert_eq!(Error::DeadlineExceeded.kind(), ErrorKind::Cancelled);
        assert_eq!(
            Error::from(DecodeError::MissingDelimiter).kind(),
            ErrorKind::Codec
        );
        let proto = ProtocolError {
            kind: "Denied".to_string(),
            message: String::new(),
        };
        assert_eq!(Error::from(proto).kind(), ErrorKind::Protocol);
        assert_eq!(
            Error::from(tungstenite::Error::ConnectionClosed).kind(),
            ErrorKind::Transport
        );
    }
}
