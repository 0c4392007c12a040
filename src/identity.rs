//! # Identity and Cryptographic Primitives
//!
//! This module defines the core identity types used throughout the ring:
//!
//! - [`Keypair`]: Ed25519 signing keypair (secret + public key)
//! - [`Identity`]: 32-byte public key serving as the peer's unique identifier
//!
//! ## Identity Model
//!
//! A node's identity IS its Ed25519 public key. There is no separate identity
//! layer: possession of the private key proves identity, and the same key
//! pair drives both signing and the Diffie-Hellman key agreement that secures
//! each peer session.
//!
//! ## Key Agreement
//!
//! Session keys are agreed by scalar multiplication on the Edwards curve:
//! each side multiplies the peer's public point by its own private scalar,
//! producing the same 32-byte compressed point on both ends. The shared point
//! is fed through HKDF-SHA256 to derive the 32-byte key for the per-session
//! XChaCha20-Poly1305 suite.
//!
//! Identities are displayed in standard base64, which is also the format the
//! command line accepts for addressing private chats.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chacha20poly1305::{KeyInit, XChaCha20Poly1305};
use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;

/// Size of a serialized public key (and therefore of an [`Identity`]).
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of an EdDSA signature.
pub const SIGNATURE_SIZE: usize = 64;

/// Size of the Diffie-Hellman shared secret (a compressed Edwards point).
pub const SHARED_SECRET_SIZE: usize = 32;

/// Size of the derived AEAD session key.
pub const SESSION_KEY_SIZE: usize = 32;

/// Error type for key-material and signature failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// A public key, private key, or signature did not decode.
    KeyMaterial,
    /// Cryptographic signature verification failed.
    InvalidSignature,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::KeyMaterial => write!(f, "key material did not decode"),
            CryptoError::InvalidSignature => write!(f, "invalid signature"),
        }
    }
}

impl std::error::Error for CryptoError {}

/// A peer's cryptographic identity: its serialized Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identity([u8; PUBLIC_KEY_SIZE]);

impl Identity {
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// Parse an identity from its standard-base64 form.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|_| CryptoError::KeyMaterial)?;
        let bytes: [u8; PUBLIC_KEY_SIZE] =
            bytes.try_into().map_err(|_| CryptoError::KeyMaterial)?;
        Ok(Self(bytes))
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.to_base64())
    }
}

/// Long-term Ed25519 signing keypair.
///
/// Cloning is cheap; peers hold a snapshot of the node's keypair rather than
/// a reference back into the node.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a fresh keypair from the system CSPRNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// The public half of the keypair, which is the node's identity.
    pub fn identity(&self) -> Identity {
        Identity(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign a message, producing a 64-byte EdDSA signature.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Compute the Diffie-Hellman shared secret with a peer.
    ///
    /// Multiplies the peer's public point by our private scalar on the
    /// Edwards curve and serializes the resulting point. Both sides of a
    /// session compute the same 32 bytes.
    pub fn shared_secret(
        &self,
        peer: &Identity,
    ) -> Result<[u8; SHARED_SECRET_SIZE], CryptoError> {
        let point = CompressedEdwardsY(peer.0)
            .decompress()
            .ok_or(CryptoError::KeyMaterial)?;
        let shared = point * self.signing_key.to_scalar();
        Ok(shared.compress().to_bytes())
    }
}

/// Verify a 64-byte EdDSA signature made by `identity` over `message`.
pub fn verify(
    identity: &Identity,
    message: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    let key = VerifyingKey::from_bytes(identity.as_bytes())
        .map_err(|_| CryptoError::KeyMaterial)?;
    let bytes: [u8; SIGNATURE_SIZE] = signature
        .try_into()
        .map_err(|_| CryptoError::InvalidSignature)?;
    key.verify_strict(message, &Signature::from_bytes(&bytes))
        .map_err(|_| CryptoError::InvalidSignature)
}

/// Derive a 32-byte session key from a shared secret.
///
/// HKDF-SHA256 with no salt and no info; the secret is the sole input.
pub fn derive_session_key(
    secret: &[u8; SHARED_SECRET_SIZE],
) -> [u8; SESSION_KEY_SIZE] {
    let hkdf = Hkdf::<Sha256>::new(None, secret);
    let mut key = [0u8; SESSION_KEY_SIZE];
    hkdf.expand(&[], &mut key)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    key
}

/// Build the per-session AEAD suite seeded by a shared secret.
pub fn session_suite(secret: &[u8; SHARED_SECRET_SIZE]) -> XChaCha20Poly1305 {
    XChaCha20Poly1305::new(&derive_session_key(secret).into())
}
