//! Command descriptors for the miniserver WebSocket channel.
//!
//! A [`Command`] pairs the outbound wire text with the response category
//! the session core expects back, plus the control-path fragment used to
//! match the echoed `control` field of the answer. Commands whose
//! category is [`ResponseKind::None`] (the keep-alive) are written to the
//! wire but never correlated.
//!
//! Privileged control commands are re-addressed under the secured prefix
//! by [`SecuredCommand`], which signs the inner wire text with the
//! visualisation credential of the current session.

use serde::{Deserialize, Serialize};

use crate::LoxoneMessage;
use crate::crypto::VisuCredential;

/// Prefix of secured (visualisation-signed) control commands.
pub const SECURED_PREFIX: &str = "jdev/sps/ios";

/// Prefix of the encrypted command channel. Not implemented; responses
/// under this prefix are logged as unsupported and dropped.
pub const ENCRYPTED_PREFIX: &str = "dev/sys/enc";

/// The response category a command declares.
///
/// The session core correlates inbound text frames against the in-flight
/// FIFO and hands the parsed response to listeners subscribed to the
/// matching tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseKind {
    /// No response is expected; the command is never enqueued.
    None,
    /// A plain [`LoxoneMessage`] without a more specific payload.
    Message,
    /// API info from the bootstrap fetcher.
    ApiInfo,
    /// Acknowledgement of the session key-exchange.
    SessionKey,
    /// Salt and hash algorithm for the user credential.
    UserKey,
    /// A session token grant or refresh.
    Token,
    /// Salt and key for the visualisation credential.
    VisuSalt,
    /// Acknowledgement of the visualisation credential proof.
    VisuAuth,
    /// A raw JSON document that is not a [`LoxoneMessage`].
    Json,
}

/// An outbound request to the miniserver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    command: String,
    kind: ResponseKind,
    should_contain: Option<String>,
    ws_supported: bool,
}

impl Command {
    /// Creates a command from its parts.
    ///
    /// Prefer the named constructors below for the protocol vocabulary.
    pub fn new(
        command: impl Into<String>,
        kind: ResponseKind,
        should_contain: Option<String>,
        ws_supported: bool,
    ) -> Self {
        Self {
            command: command.into(),
            kind,
            should_contain,
            ws_supported,
        }
    }

    /// The keep-alive ping. Written to the wire, never enqueued.
    pub fn keep_alive() -> Self {
        Self::new("keepalive", ResponseKind::None, None, true)
    }

    /// Key-exchange carrying the RSA-encrypted session key material.
    pub fn key_exchange(encrypted_session_key: &str) -> Self {
        Self::new(
            format!("jdev/sys/keyexchange/{encrypted_session_key}"),
            ResponseKind::SessionKey,
            Some("keyexchange".to_owned()),
            true,
        )
    }

    /// Requests salt and hash algorithm for the user credential.
    pub fn get_key(user: &str) -> Self {
        Self::new(
            format!("jdev/sys/getkey2/{user}"),
            ResponseKind::UserKey,
            Some("getkey2".to_owned()),
            true,
        )
    }

    /// Requests a session token for the hashed credential.
    pub fn get_token(hash: &str, user: &str, permission: u8, client_id: &str, info: &str) -> Self {
        Self::new(
            format!("jdev/sys/gettoken/{hash}/{user}/{permission}/{client_id}/{info}"),
            ResponseKind::Token,
            Some("gettoken".to_owned()),
            true,
        )
    }

    /// Refreshes the session token before it expires.
    pub fn refresh_token(token_hash: &str, user: &str) -> Self {
        Self::new(
            format!("jdev/sys/refreshtoken/{token_hash}/{user}"),
            ResponseKind::Token,
            Some("refreshtoken".to_owned()),
            true,
        )
    }

    /// Requests salt and key for the visualisation credential.
    pub fn get_visu_salt(user: &str) -> Self {
        Self::new(
            format!("jdev/sys/getvisusalt/{user}"),
            ResponseKind::VisuSalt,
            Some("getvisusalt".to_owned()),
            true,
        )
    }

    /// Proves possession of the visualisation credential.
    pub fn auth_with_visu_hash(hash: &str, user: &str) -> Self {
        Self::new(
            format!("jdev/sys/authwithvisuhash/{hash}/{user}"),
            ResponseKind::VisuAuth,
            Some("authwithvisuhash".to_owned()),
            true,
        )
    }

    /// A control command addressed by its full wire path.
    pub fn control(path: impl Into<String>) -> Self {
        let path = path.into();
        Self::new(path.clone(), ResponseKind::Message, Some(path), true)
    }

    /// A control command targeting one control's action,
    /// `jdev/sps/io/{id}/{action}`.
    pub fn io_control(id: &str, action: &str) -> Self {
        Self::control(format!("jdev/sps/io/{id}/{action}"))
    }

    /// Bootstrap: API info. HTTP only, never valid on the socket.
    pub fn api_info() -> Self {
        Self::new(
            "jdev/cfg/apiKey",
            ResponseKind::ApiInfo,
            Some("apiKey".to_owned()),
            false,
        )
    }

    /// Bootstrap: the miniserver's RSA public key. HTTP only.
    pub fn public_key() -> Self {
        Self::new(
            "jdev/sys/getPublicKey",
            ResponseKind::Message,
            Some("getPublicKey".to_owned()),
            false,
        )
    }

    /// The wire text of this command.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// The declared response category.
    pub fn kind(&self) -> ResponseKind {
        self.kind
    }

    /// `true` iff an answer is expected and the command must be enqueued.
    pub fn expects_response(&self) -> bool {
        self.kind != ResponseKind::None
    }

    /// `true` iff this command may be submitted over the WebSocket.
    pub fn ws_supported(&self) -> bool {
        self.ws_supported
    }

    /// The control-path fragment a response's `control` field must carry.
    pub fn should_contain(&self) -> Option<&str> {
        self.should_contain.as_deref()
    }

    /// `true` iff the response `control` satisfies the expected fragment.
    ///
    /// A command without a fragment accepts any control path.
    pub fn matches_control(&self, control: &str) -> bool {
        match &self.should_contain {
            Some(fragment) => control.contains(fragment.as_str()),
            None => true,
        }
    }

    /// Adapts a non-[`LoxoneMessage`] response into the message shape.
    ///
    /// Only commands declaring [`ResponseKind::Json`] accept raw
    /// documents; anything else yields `None` and the caller drops the
    /// frame.
    pub fn ensure_response(&self, value: serde_json::Value) -> Option<LoxoneMessage> {
        match self.kind {
            ResponseKind::Json => Some(LoxoneMessage::ok(self.command.clone(), value)),
            _ => None,
        }
    }
}

/// A control command wrapped with a currently valid visualisation hash.
///
/// The wire form is `jdev/sps/ios/{hash}/{inner}` where `hash` is the
/// hex HMAC-SHA256 of the session's visualisation key over the inner
/// command string. A secured command is regenerated on every retry since
/// the visualisation credential may have rotated in between.
#[derive(Debug, Clone)]
pub struct SecuredCommand {
    wire: String,
    inner: Command,
}

impl SecuredCommand {
    /// Signs `inner` with the given visualisation credential.
    pub fn wrap(inner: Command, visu: &VisuCredential) -> Self {
        let hash = visu.sign(inner.command());
        let wire = format!("{SECURED_PREFIX}/{hash}/{}", inner.command());
        Self { wire, inner }
    }

    /// The secured wire text.
    pub fn command(&self) -> &str {
        &self.wire
    }

    /// The wrapped control command.
    pub fn inner(&self) -> &Command {
        &self.inner
    }

    /// The secured command as a submittable [`Command`].
    ///
    /// Keeps the inner response category and control fragment: the
    /// miniserver echoes the unsecured control path.
    pub fn to_command(&self) -> Command {
        Command::new(
            self.wire.clone(),
            self.inner.kind(),
            self.inner.should_contain.clone(),
            self.inner.ws_supported(),
        )
    }
}
