//! Key agreement primitives for the encryption handover.
//!
//! The handshake partners agree on a curve P-384 key pair per side and
//! derive the 32-byte batch key as SHA-256(salt || raw ECDH shared
//! secret), with the salt travelling base64-encoded inside the
//! handshake token.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use p384::{
    ecdh,
    pkcs8::{DecodePublicKey, EncodePublicKey},
    PublicKey, SecretKey,
};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid salt")]
    InvalidSalt,
}

/// An ephemeral P-384 key pair, generated per session at login
/// interception and used for both key agreement and token signing.
#[derive(Clone)]
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = SecretKey::random(&mut OsRng);
        let public = secret.public_key();
        Self { secret, public }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// The public key as base64 SPKI DER, the representation the
    /// handshake tokens carry.
    pub fn public_key_base64(&self) -> String {
        let der = self
            .public
            .to_public_key_der()
            .expect("SPKI encoding of a valid key");
        BASE64.encode(der.as_bytes())
    }

    pub(crate) fn secret(&self) -> &SecretKey {
        &self.secret
    }
}

/// Parses a base64 SPKI DER public key as carried by handshake tokens.
pub fn parse_public_key(base64_der: &str) -> Result<PublicKey, CryptoError> {
    let der = BASE64
        .decode(base64_der.trim())
        .map_err(|_| CryptoError::InvalidPublicKey)?;
    PublicKey::from_public_key_der(&der).map_err(|_| CryptoError::InvalidPublicKey)
}

/// Derives the 32-byte shared batch key from our key pair, the peer's
/// public key, and the base64 salt.
pub fn diffie_hellman(
    key_pair: &KeyPair,
    peer: &PublicKey,
    salt_base64: &str,
) -> Result<[u8; 32], CryptoError> {
    let salt = BASE64
        .decode(salt_base64)
        .map_err(|_| CryptoError::InvalidSalt)?;
    let shared = ecdh::diffie_hellman(key_pair.secret.to_nonzero_scalar(), peer.as_affine());
    let mut hasher = Sha256::new();
    hasher.update(&salt);
    hasher.update(shared.raw_secret_bytes());
    Ok(hasher.finalize().into())
}

/// Generates a fresh base64-encoded 16-byte salt.
pub fn random_salt() -> String {
    let mut salt = [0u8; 16];
    OsRng.fill_bytes(&mut salt);
    BASE64.encode(salt)
}
