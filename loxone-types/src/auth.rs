//! Data transfer objects for the authentication handshake.
//!
//! These are the payloads carried in [`LoxoneMessage::value`] during the
//! challenge/response sequence: bootstrap API info, the user-key
//! challenge, the issued token, and the visualisation salt.
//!
//! [`LoxoneMessage::value`]: crate::LoxoneMessage

use serde::{Deserialize, Serialize};

/// Hash algorithm announced by the miniserver for credential hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HashAlg {
    /// SHA-1, the legacy default when the field is absent.
    #[default]
    #[serde(rename = "SHA1")]
    Sha1,
    /// SHA-256.
    #[serde(rename = "SHA256")]
    Sha256,
}

/// Bootstrap information fetched over HTTP before the socket opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiInfo {
    /// Serial number of the miniserver.
    pub snr: String,
    /// Firmware version string.
    pub version: String,
}

/// Answer to `getkey2/{user}`: the material for the credential hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserKeyResponse {
    /// Hex-encoded HMAC key.
    pub key: String,
    /// Per-user salt mixed into the password hash.
    pub salt: String,
    /// Hash algorithm to use for both hashing steps.
    #[serde(default, rename = "hashAlg")]
    pub hash_alg: HashAlg,
}

/// Answer to `gettoken`/`refreshtoken`: a time-limited session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    /// The opaque token string.
    pub token: String,
    /// Remaining validity in seconds.
    #[serde(rename = "validUntil")]
    pub valid_seconds: u64,
    /// Rights bitmask granted to this token.
    #[serde(default, rename = "tokenRights")]
    pub rights: Option<u32>,
    /// Whether the miniserver still runs with the default password.
    #[serde(default, rename = "unsecurePass")]
    pub unsecure_pass: Option<bool>,
}

/// Answer to `getvisusalt/{user}`: material for the visualisation
/// credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisuSaltResponse {
    /// Hex-encoded HMAC key, retained for secured-command signing.
    pub key: String,
    /// Per-user salt mixed into the visualisation password hash.
    pub salt: String,
    /// Hash algorithm for the credential proof.
    #[serde(default, rename = "hashAlg")]
    pub hash_alg: HashAlg,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_alg_defaults_to_sha1() {
        let parsed: UserKeyResponse =
            serde_json::from_str(r#"{"key": "4142", "salt": "73616c74"}"#).unwrap();
        assert_eq!(parsed.hash_alg, HashAlg::Sha1);
    }

    #[test]
    fn token_response_wire_names() {
        let parsed: TokenResponse = serde_json::from_str(
            r#"{"token": "abc", "validUntil": 3600, "tokenRights": 1666, "unsecurePass": false}"#,
        )
        .unwrap();
        assert_eq!(parsed.valid_seconds, 3600);
        assert_eq!(parsed.rights, Some(1666));
        assert_eq!(parsed.unsecure_pass, Some(false));
    }
}
