//! Credential hashing and key-exchange material.
//!
//! The handshake hashes credentials in two steps: the password is hashed
//! together with a per-user salt, then the result is authenticated with a
//! server-provided HMAC key. The same recipe, applied to the
//! visualisation password, yields the [`VisuCredential`] that also signs
//! secured commands for the rest of the session.
//!
//! Main types:
//! * [`VisuCredential`]
//! * [`SessionKey`]
//! * [`CryptoError`]

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use rand::{CryptoRng, RngCore};
use rsa::{Pkcs1v15Encrypt, RsaPublicKey, pkcs8::DecodePublicKey};
use secrecy::{ExposeSecret, SecretString};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::auth::{HashAlg, UserKeyResponse, VisuSaltResponse};

/// Errors from credential hashing and key-exchange material.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// A server-provided HMAC key was not valid hex.
    #[error("key is not valid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    /// Key material was not valid base64.
    #[error("key material is not valid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    /// The miniserver's public key could not be parsed.
    #[error("invalid RSA public key: {0}")]
    PublicKey(String),
    /// RSA encryption failed.
    #[error(transparent)]
    Rsa(#[from] rsa::Error),
}

fn digest_hex_upper(alg: HashAlg, data: &[u8]) -> String {
    let digest = match alg {
        HashAlg::Sha1 => Sha1::digest(data).to_vec(),
        HashAlg::Sha256 => Sha256::digest(data).to_vec(),
    };
    hex::encode_upper(digest)
}

fn hmac_hex(alg: HashAlg, key: &[u8], data: &[u8]) -> String {
    match alg {
        HashAlg::Sha1 => {
            let mut mac =
                Hmac::<Sha1>::new_from_slice(key).expect("HMAC accepts any key length");
            mac.update(data);
            hex::encode(mac.finalize().into_bytes())
        }
        HashAlg::Sha256 => {
            let mut mac =
                Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
            mac.update(data);
            hex::encode(mac.finalize().into_bytes())
        }
    }
}

/// Uppercase hex digest of `password:salt`.
pub fn password_hash(password: &SecretString, salt: &str, alg: HashAlg) -> String {
    let data = format!("{}:{salt}", password.expose_secret());
    digest_hex_upper(alg, data.as_bytes())
}

/// The login hash sent with `gettoken`: HMAC over `user:pw_hash`, keyed
/// with the hex-decoded user key from the `getkey2` challenge.
pub fn user_hash(
    user: &str,
    password: &SecretString,
    challenge: &UserKeyResponse,
) -> Result<String, CryptoError> {
    let key = hex::decode(&challenge.key)?;
    let pw_hash = password_hash(password, &challenge.salt, challenge.hash_alg);
    let data = format!("{user}:{pw_hash}");
    Ok(hmac_hex(challenge.hash_alg, &key, data.as_bytes()))
}

/// HMAC proof over the token string, keyed with the last user key.
///
/// Used by the proactive `refreshtoken` step.
pub fn token_hash(token: &str, challenge: &UserKeyResponse) -> Result<String, CryptoError> {
    let key = hex::decode(&challenge.key)?;
    Ok(hmac_hex(challenge.hash_alg, &key, token.as_bytes()))
}

/// The visualisation credential of one session.
///
/// Derived from the visualisation password and the `getvisusalt` answer.
/// Holds the proof hash for `authwithvisuhash` and the session key that
/// signs every secured command wire text.
#[derive(Clone)]
pub struct VisuCredential {
    key: Vec<u8>,
    auth_hash: String,
}

impl VisuCredential {
    /// Derives the credential from the visualisation password and the
    /// salt/key announced by the miniserver.
    pub fn derive(
        visu_password: &SecretString,
        response: &VisuSaltResponse,
    ) -> Result<Self, CryptoError> {
        let key = hex::decode(&response.key)?;
        let pw_hash = password_hash(visu_password, &response.salt, response.hash_alg);
        let auth_hash = hmac_hex(response.hash_alg, &key, pw_hash.as_bytes());
        Ok(Self { key, auth_hash })
    }

    /// The proof hash submitted with `authwithvisuhash`.
    pub fn auth_hash(&self) -> &str {
        &self.auth_hash
    }

    /// Signs a command wire text: lowercase hex HMAC-SHA256 under the
    /// session's visualisation key (64 characters).
    pub fn sign(&self, command: &str) -> String {
        hmac_hex(HashAlg::Sha256, &self.key, command.as_bytes())
    }
}

impl fmt::Debug for VisuCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VisuCredential").finish_non_exhaustive()
    }
}

/// The symmetric session key announced during key-exchange.
///
/// Generated per connection and sent to the miniserver encrypted under
/// its RSA public key. The session core never encrypts traffic with it
/// (the encrypted channel is unsupported), but the exchange is a
/// mandatory handshake step.
#[derive(Clone)]
pub struct SessionKey {
    key: [u8; 32],
    iv: [u8; 16],
}

impl SessionKey {
    /// Generates fresh key material.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut key = [0u8; 32];
        let mut iv = [0u8; 16];
        rng.fill_bytes(&mut key);
        rng.fill_bytes(&mut iv);
        Self { key, iv }
    }

    /// Encrypts `hex(key):hex(iv)` under the miniserver's RSA public key
    /// (PKCS#1 v1.5) and returns it base64-encoded for the key-exchange
    /// command.
    pub fn encrypt_for<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        public_key: &RsaPublicKey,
    ) -> Result<String, CryptoError> {
        let plain = format!("{}:{}", hex::encode(self.key), hex::encode(self.iv));
        let cipher = public_key.encrypt(rng, Pkcs1v15Encrypt, plain.as_bytes())?;
        Ok(BASE64.encode(cipher))
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKey").finish_non_exhaustive()
    }
}

/// Parses the public key served by the miniserver.
///
/// The miniserver labels the SPKI bytes as a `CERTIFICATE` block, so the
/// PEM armor is stripped manually before DER parsing.
pub fn parse_public_key(text: &str) -> Result<RsaPublicKey, CryptoError> {
    let body: String = text
        .lines()
        .filter(|line| !line.starts_with("-----"))
        .map(str::trim)
        .collect();
    let der = BASE64.decode(body)?;
    RsaPublicKey::from_public_key_der(&der).map_err(|err| CryptoError::PublicKey(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::RsaPrivateKey;
    use rsa::pkcs8::EncodePublicKey;

    fn secret(s: &str) -> SecretString {
        SecretString::from(s)
    }

    #[test]
    fn password_hash_is_uppercase_and_alg_sized() {
        let sha1 = password_hash(&secret("pw"), "salt", HashAlg::Sha1);
        let sha256 = password_hash(&secret("pw"), "salt", HashAlg::Sha256);
        assert_eq!(sha1.len(), 40);
        assert_eq!(sha256.len(), 64);
        assert!(sha1.chars().all(|c| !c.is_ascii_lowercase()));
        assert_ne!(
            sha1,
            password_hash(&secret("pw"), "other", HashAlg::Sha1),
            "salt must change the hash"
        );
    }

    #[test]
    fn user_hash_is_lowercase_hex() {
        let challenge = UserKeyResponse {
            key: "4142434445".to_owned(),
            salt: "73616c74".to_owned(),
            hash_alg: HashAlg::Sha256,
        };
        let hash = user_hash("admin", &secret("pw"), &challenge).unwrap();
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn user_hash_rejects_non_hex_key() {
        let challenge = UserKeyResponse {
            key: "not-hex".to_owned(),
            salt: "salt".to_owned(),
            hash_alg: HashAlg::Sha1,
        };
        assert!(matches!(
            user_hash("admin", &secret("pw"), &challenge),
            Err(CryptoError::InvalidHex(_))
        ));
    }

    #[test]
    fn visu_signature_depends_on_command() {
        let response = VisuSaltResponse {
            key: "41424344".to_owned(),
            salt: "abc".to_owned(),
            hash_alg: HashAlg::Sha256,
        };
        let visu = VisuCredential::derive(&secret("visu"), &response).unwrap();
        let a = visu.sign("jdev/sps/io/a/on");
        let b = visu.sign("jdev/sps/io/b/on");
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
        assert_eq!(a, visu.sign("jdev/sps/io/a/on"));
    }

    #[test]
    fn session_key_round_trips_through_rsa() {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let public = RsaPublicKey::from(&private);

        let session = SessionKey::generate(&mut rng);
        let encrypted = session.encrypt_for(&mut rng, &public).unwrap();
        let cipher = BASE64.decode(encrypted).unwrap();
        let plain = private.decrypt(Pkcs1v15Encrypt, &cipher).unwrap();
        let plain = String::from_utf8(plain).unwrap();

        let (key_hex, iv_hex) = plain.split_once(':').unwrap();
        assert_eq!(key_hex.len(), 64);
        assert_eq!(iv_hex.len(), 32);
    }

    #[test]
    fn parses_certificate_labelled_public_key() {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let public = RsaPublicKey::from(&private);
        let spki = public.to_public_key_der().unwrap();
        let armored = format!(
            "-----BEGIN CERTIFICATE-----\n{}\n-----END CERTIFICATE-----",
            BASE64.encode(spki.as_bytes())
        );
        let parsed = parse_public_key(&armored).unwrap();
        assert_eq!(parsed, public);
    }
}
