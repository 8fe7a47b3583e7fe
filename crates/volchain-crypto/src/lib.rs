// volchain-crypto/src/lib.rs

//! Cryptographic primitives for the Volchain ledger
//!
//! This crate provides:
//! - SHA-256 hashing
//! - Ed25519 key pairs and signatures
//! - bech32 `v1` address derivation
//! - Resolution of user-supplied key strings (hex, base64, bech32)

pub mod hash;
pub mod keypair;
pub mod signature;

pub use hash::{sha256, Hash, Hashable};
pub use keypair::{resolve_key, Address, KeyPair, PublicKey, SecretKey, ADDRESS_HRP};
pub use signature::Signature;

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Errors that can occur during cryptographic operations
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid secret key")]
    InvalidSecretKey,

    #[error("Invalid hash")]
    InvalidHash,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crypto_basics() {
        let keypair = KeyPair::generate();
        let message = b"volchain";
        let signature = keypair.sign(message);
        assert!(keypair.public_key().verify(message, &signature));
        assert!(keypair.public_key().to_address().unwrap().as_str().starts_with("v1"));
    }
}
