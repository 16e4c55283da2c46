#![deny(missing_docs, clippy::unwrap_used)]
//! WebSocket session core for the Loxone miniserver.
//!
//! The miniserver speaks a dual-channel WebSocket protocol: JSON control
//! messages interleaved with typed binary event frames, behind a
//! challenge/response handshake that issues a time-limited session token
//! and, for privileged control commands, a secondary visualisation
//! credential. This crate owns that session: connection lifecycle,
//! authentication sequencing, request/response correlation,
//! secure-command gating, retry semantics, and the binary event
//! demultiplexer.
//!
//! The main entry point is [`LoxoneWebSocket`]. Responses and events are
//! delivered through the listener traits in [`listener`]; HTTP bootstrap
//! and the socket itself sit behind the [`http::HttpFetcher`] and
//! [`transport::WebSocketTransport`] seams so tests (and embedders) can
//! substitute their own.
//!
//! ```no_run
//! use loxone_client::{LoxoneProfile, LoxoneWebSocket};
//! use loxone_types::{LoxoneEndpoint, command::Command};
//! use secrecy::SecretString;
//!
//! # async fn run() -> Result<(), loxone_client::Error> {
//! let session = LoxoneWebSocket::new(
//!     LoxoneEndpoint::new("192.168.1.77", 80),
//!     LoxoneProfile::new("admin", SecretString::from("secret")),
//! );
//! session.send_command(Command::io_control("0f86a2fe", "on")).await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod http;
pub mod listener;
pub mod transport;

mod auth;
mod dispatch;
mod latch;
mod registry;
mod scheduler;
mod session;

pub use scheduler::Scheduler;
pub use session::{LoxoneProfile, LoxoneWebSocket, SessionState};

/// Errors surfaced by the session core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The connection or its authentication gate was not ready in time.
    /// Recoverable; the send path retries it.
    #[error("connection not ready")]
    ConnectionFailure,
    /// Retries exhausted without the authentication gate opening.
    #[error("authentication did not complete within the timeout ({attempts} attempts)")]
    AuthTimeoutExceeded {
        /// How many attempts were made before giving up.
        attempts: u32,
    },
    /// The command does not support the WebSocket channel.
    #[error("command does not support the WebSocket channel: {0}")]
    WsNotSupported(String),
    /// A malformed frame or JSON document.
    #[error(transparent)]
    Codec(#[from] codec::CodecError),
    /// A response's control path did not satisfy the command's expected
    /// fragment. Logged and dropped on the inbound pump.
    #[error("response control {actual:?} does not contain {expected:?}")]
    ProtocolMismatch {
        /// The fragment the command expected the control path to carry.
        expected: String,
        /// The control path the response actually carried.
        actual: String,
    },
    /// Credential hashing or key-exchange material failed.
    #[error(transparent)]
    Crypto(#[from] loxone_types::crypto::CryptoError),
    /// A response payload did not deserialize into the expected DTO.
    #[error("unexpected response payload: {0}")]
    Payload(#[from] serde_json::Error),
    /// The HTTP bootstrap fetch failed.
    #[error("bootstrap fetch failed: {0}")]
    Bootstrap(String),
    /// An internal invariant was violated; indicates a bug, not a
    /// network condition.
    #[error("invariant violation: {0}")]
    InvariantViolation(&'static str),
    /// Wrapped tungstenite error.
    #[error(transparent)]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
}
