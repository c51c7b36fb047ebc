// Copyright 2020 Joyent, Inc.

//! PsyNet: authenticated RPC over a single WebSocket session
//!
//! A session is opened by a signed HTTP bootstrap call, which yields a connect
//! URL and two tokens. The WebSocket dialed with those tokens then carries
//! any number of concurrent request/response exchanges, correlated by a
//! request id scoped to the session.
//!
//! Protocol definition
//!
//! Every frame is a header block and an optional JSON payload:
//!
//! ```text
//! PsyService: Clubs/GetClubDetails v1\r\n
//! PsyRequestID: PsyNetMessage_X_7\r\n
//! PsySig: <base64 signature>\r\n
//! \r\n
//! {"ClubID":1234}
//! ```
//!
//! * Header lines are `Key: Value` terminated by CRLF. A blank line ends the
//!   header block.
//!
//! * PsySig is `base64(HMAC-SHA256(key, "-" ++ payload))`. It is present
//!   whenever a payload is attached, and covers the payload bytes only.
//!
//! * Responses carry `PsyResponseID`, echoing the request id, and a body of
//!   either `{"Result": ..}` or `{"Error": {"Type": .., "Message": ..}}`.
//!   Frames with no response id are unsolicited and surface as events.
//!
//! * A liveness probe is the single empty header `PsyPing: ` and no body.
//!   Its reply is any frame starting with `PsyPong:`, which carries no JSON.
//!
//! Request ids: `<prefix>_<n>` with `n` counting up from zero. The HTTP
//! bootstrap and the socket draw from the same sequence.
//!
//! The HTTP bootstrap signs its POST body the same way and answers with the
//! same `Result`/`Error` envelope.

#![allow(missing_docs)]

pub mod bootstrap;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
mod keepalive;
pub mod pending;
pub mod player;
pub mod protocol;
pub mod transport;

pub use crate::bootstrap::{AuthPlayerRequest, AuthPlayerResponse, BootstrapClient};
pub use crate::client::RpcSession;
pub use crate::config::Config;
pub use crate::context::CallContext;
pub use crate::error::{Error, ErrorKind, ProtocolError};
pub use crate::events::Event;
pub use crate::pending::{ConnectionState, Waiter};
pub use crate::player::{Platform, PlayerId};
pub use crate::protocol::{PsyResponse, RequestIdAllocator};
pub use crate::transport::SessionCredentials;
