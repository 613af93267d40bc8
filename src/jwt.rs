//! Minimal JSON-web-token handling for the login chain and the server
//! handshake token.
//!
//! Tokens are parsed into their JSON header and payload so individual
//! claims can be rewritten, then re-signed with ES384 under the proxy's
//! key pair. Signing sets the header's `x5u` to the signer's public key,
//! which is where the peers look the verification key up.

use crate::crypto::KeyPair;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use p384::ecdsa::{
    signature::{Signer, Verifier},
    Signature, SigningKey, VerifyingKey,
};
use p384::PublicKey;
use serde_json::{json, Value};
use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("token is not three dot-separated parts")]
    Format,
    #[error("token part is not valid base64url")]
    Base64,
    #[error("token part is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("token is missing the {0} claim")]
    MissingClaim(&'static str),
}

/// A parsed JSON web token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Jwt {
    pub header: Value,
    pub payload: Value,
    signature: String,
}

fn encode_part(value: &Value) -> String {
    URL_SAFE_NO_PAD.encode(value.to_string())
}

fn decode_part(part: &str) -> Result<Value, JwtError> {
    let bytes = URL_SAFE_NO_PAD.decode(part).map_err(|_| JwtError::Base64)?;
    Ok(serde_json::from_slice(&bytes)?)
}

impl Jwt {
    /// A token with the given documents and no signature yet; callers
    /// are expected to [`sign`](Self::sign) it before serializing.
    pub fn new(header: Value, payload: Value) -> Self {
        Self {
            header,
            payload,
            signature: String::new(),
        }
    }

    pub fn parse(token: &str) -> Result<Self, JwtError> {
        let mut parts = token.split('.');
        let (Some(header), Some(payload), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(JwtError::Format);
        };
        Ok(Self {
            header: decode_part(header)?,
            payload: decode_part(payload)?,
            signature: signature.to_owned(),
        })
    }

    /// Looks up a string claim in the payload.
    pub fn payload_claim(&self, name: &'static str) -> Result<&str, JwtError> {
        self.payload
            .get(name)
            .and_then(Value::as_str)
            .ok_or(JwtError::MissingClaim(name))
    }

    /// Looks up a string claim in the header.
    pub fn header_claim(&self, name: &'static str) -> Result<&str, JwtError> {
        self.header
            .get(name)
            .and_then(Value::as_str)
            .ok_or(JwtError::MissingClaim(name))
    }

    /// Rewrites the signature: signs the current header and payload with
    /// ES384 and points `x5u` at the signer's public key.
    pub fn sign(&mut self, key_pair: &KeyPair) {
        self.header["alg"] = json!("ES384");
        self.header["x5u"] = json!(key_pair.public_key_base64());
        let message = format!("{}.{}", encode_part(&self.header), encode_part(&self.payload));
        let signing_key = SigningKey::from(key_pair.secret());
        let signature: Signature = signing_key.sign(message.as_bytes());
        self.signature = URL_SAFE_NO_PAD.encode(signature.to_bytes());
    }

    /// Checks the signature against a public key.
    pub fn verify(&self, public: &PublicKey) -> bool {
        let Ok(bytes) = URL_SAFE_NO_PAD.decode(&self.signature) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&bytes) else {
            return false;
        };
        let message = format!("{}.{}", encode_part(&self.header), encode_part(&self.payload));
        VerifyingKey::from(public)
            .verify(message.as_bytes(), &signature)
            .is_ok()
    }
}

impl fmt::Display for Jwt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}",
            encode_part(&self.header),
            encode_part(&self.payload),
            self.signature
        )
    }
}
