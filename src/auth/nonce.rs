//! Nonce challenge for public-key identities
//!
//! Every connection greeted while auth is required receives a fresh random
//! nonce. A public-key identity proves itself by returning an Ed25519
//! signature over the raw nonce bytes.
//!
//! Wire formats:
//! - nonce: base64 URL-safe, no padding
//! - public key: `pk-` + base64 URL-safe (no padding) of the 32-byte key,
//!   or a NATS user nkey (`U...`, base32 with a CRC)
//! - seed: `sk-` + base64 URL-safe (no padding) of the 32-byte secret,
//!   or a NATS user seed (`SU...`)
//! - signature: standard base64 (URL-safe is also accepted)

use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH};
use nkeys::KeyPair;
use rand::Rng;
use std::fmt;
use thiserror::Error;

/// Raw nonce length in bytes
pub const NONCE_RAW_LEN: usize = 16;

pub const PUBLIC_KEY_PREFIX: &str = "pk-";
pub const SEED_PREFIX: &str = "sk-";

/// First character of a NATS user public key
pub const NKEY_USER_PREFIX: char = 'U';
/// First characters of a NATS user seed
pub const NKEY_USER_SEED_PREFIX: &str = "SU";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChallengeError {
    #[error("no nonce was issued to this connection")]
    MissingNonce,

    #[error("invalid nonce encoding")]
    InvalidNonce,

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid seed: {0}")]
    InvalidSeed(String),

    #[error("invalid signature encoding")]
    InvalidSignature,

    #[error("signature verification failed")]
    VerificationFailed,
}

/// A per-connection random challenge
#[derive(Clone, PartialEq, Eq)]
pub struct Nonce {
    raw: [u8; NONCE_RAW_LEN],
    encoded: String,
}

impl Nonce {
    /// Generate a new nonce from the thread-local CSPRNG
    pub fn generate() -> Self {
        let mut raw = [0u8; NONCE_RAW_LEN];
        rand::rng().fill(&mut raw);

        Self {
            encoded: URL_SAFE_NO_PAD.encode(raw),
            raw,
        }
    }

    /// Decode a nonce received in a greeting
    pub fn decode(encoded: &str) -> Result<Self, ChallengeError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| ChallengeError::InvalidNonce)?;
        let raw: [u8; NONCE_RAW_LEN] = bytes
            .try_into()
            .map_err(|_| ChallengeError::InvalidNonce)?;

        Ok(Self {
            raw,
            encoded: encoded.to_string(),
        })
    }

    /// The bytes a client signs
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// The transport encoding sent in the greeting
    pub fn as_str(&self) -> &str {
        &self.encoded
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nonce({})", self.encoded)
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encoded)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum KeyMaterial {
    Ed25519(VerifyingKey),
    /// Validated user nkey, kept encoded
    NKey(String),
}

/// A public-key identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyIdentity {
    key: KeyMaterial,
}

impl PublicKeyIdentity {
    /// Parse a `pk-` prefixed identity or a NATS user nkey
    pub fn parse(identity: &str) -> Result<Self, ChallengeError> {
        if identity.starts_with(NKEY_USER_PREFIX) {
            KeyPair::from_public_key(identity)
                .map_err(|e| ChallengeError::InvalidPublicKey(e.to_string()))?;
            return Ok(Self {
                key: KeyMaterial::NKey(identity.to_string()),
            });
        }

        let encoded = identity.strip_prefix(PUBLIC_KEY_PREFIX).ok_or_else(|| {
            ChallengeError::InvalidPublicKey(format!(
                "expected a '{}' key or a user nkey",
                PUBLIC_KEY_PREFIX
            ))
        })?;

        let bytes = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| ChallengeError::InvalidPublicKey(e.to_string()))?;
        let bytes: [u8; PUBLIC_KEY_LENGTH] = bytes.try_into().map_err(|_| {
            ChallengeError::InvalidPublicKey(format!("expected {} bytes", PUBLIC_KEY_LENGTH))
        })?;

        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| ChallengeError::InvalidPublicKey(e.to_string()))?;

        Ok(Self {
            key: KeyMaterial::Ed25519(key),
        })
    }

    pub fn encode(&self) -> String {
        match &self.key {
            KeyMaterial::Ed25519(key) => {
                format!("{}{}", PUBLIC_KEY_PREFIX, URL_SAFE_NO_PAD.encode(key.to_bytes()))
            }
            KeyMaterial::NKey(encoded) => encoded.clone(),
        }
    }

    /// Verify a base64 signature over `message`
    pub fn verify(&self, message: &[u8], signature: &str) -> Result<(), ChallengeError> {
        let bytes = STANDARD
            .decode(signature)
            .or_else(|_| URL_SAFE_NO_PAD.decode(signature))
            .map_err(|_| ChallengeError::InvalidSignature)?;
        let parsed = Signature::from_slice(&bytes).map_err(|_| ChallengeError::InvalidSignature)?;

        match &self.key {
            KeyMaterial::Ed25519(key) => key
                .verify(message, &parsed)
                .map_err(|_| ChallengeError::VerificationFailed),
            KeyMaterial::NKey(encoded) => KeyPair::from_public_key(encoded)
                .map_err(|e| ChallengeError::InvalidPublicKey(e.to_string()))?
                .verify(message, &bytes)
                .map_err(|_| ChallengeError::VerificationFailed),
        }
    }
}

impl fmt::Display for PublicKeyIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// Verify a client's signature over the nonce issued to its connection
pub fn verify_signature(
    public_key: &str,
    signature: &str,
    nonce: &Nonce,
) -> Result<(), ChallengeError> {
    PublicKeyIdentity::parse(public_key)?.verify(nonce.as_bytes(), signature)
}

/// Signing half of a public-key identity
#[derive(Clone)]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        rand::rng().fill(&mut secret);
        Self {
            signing_key: SigningKey::from_bytes(&secret),
        }
    }

    /// Restore from an `sk-` prefixed seed
    pub fn from_seed(seed: &str) -> Result<Self, ChallengeError> {
        let encoded = seed.strip_prefix(SEED_PREFIX).ok_or_else(|| {
            ChallengeError::InvalidSeed(format!("missing '{}' prefix", SEED_PREFIX))
        })?;
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| ChallengeError::InvalidSeed(e.to_string()))?;
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ChallengeError::InvalidSeed("expected 32 bytes".to_string()))?;

        Ok(Self {
            signing_key: SigningKey::from_bytes(&secret),
        })
    }

    pub fn seed(&self) -> String {
        format!("{}{}", SEED_PREFIX, URL_SAFE_NO_PAD.encode(self.signing_key.to_bytes()))
    }

    pub fn public_identity(&self) -> PublicKeyIdentity {
        PublicKeyIdentity {
            key: KeyMaterial::Ed25519(self.signing_key.verifying_key()),
        }
    }

    /// Sign the raw bytes of a nonce, returning standard base64
    pub fn sign_nonce(&self, nonce: &Nonce) -> String {
        STANDARD.encode(self.signing_key.sign(nonce.as_bytes()).to_bytes())
    }
}

/// Sign a nonce with either an `sk-` seed or a NATS user seed
pub fn sign_nonce_with_seed(seed: &str, nonce: &Nonce) -> Result<String, ChallengeError> {
    if seed.starts_with(NKEY_USER_SEED_PREFIX) {
        let kp = KeyPair::from_seed(seed).map_err(|e| ChallengeError::InvalidSeed(e.to_string()))?;
        let signature = kp
            .sign(nonce.as_bytes())
            .map_err(|e| ChallengeError::InvalidSeed(e.to_string()))?;
        return Ok(STANDARD.encode(signature));
    }
    Ok(IdentityKeyPair::from_seed(seed)?.sign_nonce(nonce))
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityKeyPair({})", self.public_identity())
    }
}
