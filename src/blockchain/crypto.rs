use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use secp256k1::{ecdsa::Signature, All, Message, PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use std::fmt;
use std::str::FromStr;

/// Shared secp256k1 context; building one is expensive and it is immutable afterwards.
static SECP256K1: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Decoding error: {0}")]
    DecodingError(String),
}

/// SHA-256 digest of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Represents a wallet address (compressed secp256k1 public key in hex format)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address(String);

impl Address {
    /// Creates a new address from a public key
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        Address(hex::encode(public_key.serialize()))
    }

    /// Converts the address back to a public key
    pub fn to_public_key(&self) -> Result<PublicKey, CryptoError> {
        let bytes = hex::decode(&self.0).map_err(|e| CryptoError::DecodingError(e.to_string()))?;

        PublicKey::from_slice(&bytes).map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
    }

    /// The hex form of the address
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Address {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| CryptoError::DecodingError(e.to_string()))?;
        let public_key =
            PublicKey::from_slice(&bytes).map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;

        // Re-encode so that upper and lower case hex name the same address
        Ok(Address::from_public_key(&public_key))
    }
}

/// A DER-encoded ECDSA signature, stored as hex
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigitalSignature(String);

impl DigitalSignature {
    /// Creates a new digital signature from a signature
    pub fn from_signature(signature: &Signature) -> Self {
        DigitalSignature(hex::encode(signature.serialize_der().to_vec()))
    }

    /// Wraps an already hex-encoded DER signature without checking it.
    ///
    /// Signatures arrive from untrusted sources; they are only parsed when verified.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        DigitalSignature(hex.into())
    }

    /// Converts the digital signature to a signature
    pub fn to_signature(&self) -> Result<Signature, CryptoError> {
        let bytes = hex::decode(&self.0).map_err(|e| CryptoError::DecodingError(e.to_string()))?;

        Signature::from_der(&bytes).map_err(|e| CryptoError::InvalidSignature(e.to_string()))
    }

    /// The hex form of the signature
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the signature holds no bytes at all
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A secp256k1 key pair held by a single participant
#[derive(Debug, Clone)]
pub struct KeyPair {
    secret_key: SecretKey,
    public_key: PublicKey,
    address: Address,
}

impl KeyPair {
    /// Creates a new key pair from the operating system's random source
    pub fn generate() -> Self {
        Self::generate_with(&mut OsRng)
    }

    /// Creates a new key pair from a caller-supplied cryptographically secure RNG
    pub fn generate_with<R: RngCore + CryptoRng + ?Sized>(rng: &mut R) -> Self {
        Self::from_secret_key(SecretKey::new(rng))
    }

    fn from_secret_key(secret_key: SecretKey) -> Self {
        let public_key = PublicKey::from_secret_key(&SECP256K1, &secret_key);
        let address = Address::from_public_key(&public_key);

        KeyPair {
            secret_key,
            public_key,
            address,
        }
    }

    /// Rebuilds a key pair from a hex-encoded 32-byte private scalar
    pub fn from_secret_hex(secret_hex: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(secret_hex).map_err(|e| CryptoError::DecodingError(e.to_string()))?;
        let secret_key =
            SecretKey::from_slice(&bytes).map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;

        Ok(Self::from_secret_key(secret_key))
    }

    /// Gets the key pair's address
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Gets the key pair's public key
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Exports the private scalar as hex
    pub fn secret_key_hex(&self) -> String {
        hex::encode(self.secret_key.secret_bytes())
    }

    /// Signs the SHA-256 digest of `payload` with the private key
    pub fn sign(&self, payload: &[u8]) -> DigitalSignature {
        let message = Message::from_digest(sha256(payload));
        let signature = SECP256K1.sign_ecdsa(&message, &self.secret_key);
        DigitalSignature::from_signature(&signature)
    }
}

/// Verifies a signature over the SHA-256 digest of `payload`.
///
/// Malformed keys and signatures are reported as `false`, never as errors.
pub fn verify_signature(public_key: &Address, signature: &DigitalSignature, payload: &[u8]) -> bool {
    let public_key = match public_key.to_public_key() {
        Ok(key) => key,
        Err(_) => return false,
    };
    let signature = match signature.to_signature() {
        Ok(sig) => sig,
        Err(_) => return false,
    };

    let message = Message::from_digest(sha256(payload));
    SECP256K1.verify_ecdsa(&message, &signature, &public_key).is_ok()
}
