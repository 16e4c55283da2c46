#![deny(missing_docs)]
//! Core type definitions for the Loxone miniserver WebSocket client.
//!
//! This crate groups together the strongly-typed values and message
//! structures the session core exchanges with a miniserver. It provides:
//!
//! * The [`LoxoneMessage`] control-message envelope with its HTTP-like
//!   [`ResponseCode`] taxonomy.
//! * Command descriptors and the secured-command wrapper (see [`command`]
//!   module).
//! * Authentication data transfer objects (see [`auth`] module).
//! * Credential hashing and session-key material (see [`crypto`] module).
//! * Miniserver addressing via [`LoxoneEndpoint`].
//!
//! Use these types to pass, store, and (de)serialize protocol values in a
//! type-safe way throughout your application.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod auth;
pub mod command;
pub mod crypto;

/// A parsed JSON control message from the miniserver.
///
/// The miniserver answers commands with a small JSON document carrying the
/// echoed control path, an HTTP-like status code and a free-form value.
/// On the wire the document arrives either bare or wrapped in an `"LL"`
/// envelope whose code field is the string `"Code"`; both shapes
/// deserialize into this type.
#[derive(Debug, Clone, Serialize)]
pub struct LoxoneMessage {
    /// The control path this message answers.
    pub control: String,
    /// Status code, see [`ResponseCode`] for the taxonomy.
    pub code: u16,
    /// Command-specific payload.
    pub value: serde_json::Value,
}

impl LoxoneMessage {
    /// Creates a message with code 200 and the given control and value.
    pub fn ok(control: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            control: control.into(),
            code: ResponseCode::Ok.as_u16(),
            value,
        }
    }

    /// The [`ResponseCode`] classification of [`LoxoneMessage::code`].
    pub fn response_code(&self) -> ResponseCode {
        ResponseCode::from(self.code)
    }

    /// Deserializes the `value` payload into a concrete DTO.
    pub fn value_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.value.clone())
    }

    fn from_raw(raw: serde_json::Value) -> Result<Self, String> {
        let obj = match raw.get("LL") {
            Some(inner) => inner,
            None => &raw,
        };
        let control = obj
            .get("control")
            .and_then(serde_json::Value::as_str)
            .ok_or("missing control field")?
            .to_owned();
        let code = obj
            .get("code")
            .or_else(|| obj.get("Code"))
            .ok_or("missing code field")?;
        let code = match code {
            serde_json::Value::Number(n) => {
                u16::try_from(n.as_u64().ok_or("code is not an unsigned integer")?)
                    .map_err(|_| "code out of range")?
            }
            serde_json::Value::String(s) => s.parse::<u16>().map_err(|_| "code is not numeric")?,
            _ => return Err("code is neither number nor string".to_owned()),
        };
        let value = obj.get("value").cloned().unwrap_or(serde_json::Value::Null);
        Ok(Self {
            control,
            code,
            value,
        })
    }
}

impl<'de> Deserialize<'de> for LoxoneMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = serde_json::Value::deserialize(deserializer)?;
        Self::from_raw(raw).map_err(serde::de::Error::custom)
    }
}

/// The HTTP-like status taxonomy carried in [`LoxoneMessage::code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    /// Command accepted.
    Ok,
    /// Not authenticated yet; the command arrived before the handshake
    /// finished.
    NotAuthenticated,
    /// Authentication failed (bad credentials).
    AuthFailed,
    /// Addressed device/control not found.
    NotFound,
    /// Authentication took too long; the miniserver gave up on the cycle.
    AuthTooLong,
    /// Not authorised for a secured action (visualisation credential
    /// missing or wrong).
    Unauthorized,
    /// Anything the taxonomy does not know.
    Unknown(u16),
}

impl ResponseCode {
    /// The raw wire code.
    pub fn as_u16(self) -> u16 {
        match self {
            ResponseCode::Ok => 200,
            ResponseCode::NotAuthenticated => 400,
            ResponseCode::AuthFailed => 401,
            ResponseCode::NotFound => 404,
            ResponseCode::AuthTooLong => 420,
            ResponseCode::Unauthorized => 500,
            ResponseCode::Unknown(code) => code,
        }
    }
}

impl From<u16> for ResponseCode {
    fn from(code: u16) -> Self {
        match code {
            200 => ResponseCode::Ok,
            400 => ResponseCode::NotAuthenticated,
            401 => ResponseCode::AuthFailed,
            404 => ResponseCode::NotFound,
            420 => ResponseCode::AuthTooLong,
            500 => ResponseCode::Unauthorized,
            other => ResponseCode::Unknown(other),
        }
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

/// Network address of a miniserver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoxoneEndpoint {
    /// Host name or IP address.
    pub host: String,
    /// TCP port the miniserver listens on.
    pub port: u16,
}

impl LoxoneEndpoint {
    /// Creates an endpoint from host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The WebSocket URI of the miniserver's dual text/binary channel.
    pub fn ws_uri(&self) -> String {
        format!("ws://{}:{}/ws/rfc6455", self.host, self.port)
    }

    /// The HTTP URL used by the bootstrap fetcher for the given command.
    pub fn http_url(&self, command: &str) -> String {
        format!("http://{}:{}/{}", self.host, self.port, command)
    }
}

impl fmt::Display for LoxoneEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
