// volchain-crypto/src/signature.rs

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

pub const SIGNATURE_SIZE: usize = 64;

/// Ed25519 signature, serialized as base64
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; SIGNATURE_SIZE]);

impl Signature {
    pub fn new(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, crate::CryptoError> {
        let bytes: [u8; SIGNATURE_SIZE] = slice
            .try_into()
            .map_err(|_| crate::CryptoError::InvalidSignature)?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn from_base64(s: &str) -> Result<Self, crate::CryptoError> {
        let bytes = STANDARD
            .decode(s.trim())
            .map_err(|_| crate::CryptoError::InvalidSignature)?;
        Self::from_slice(&bytes)
    }

    /// Verify this signature over `message` against `public_key`
    pub fn verify(&self, message: &[u8], public_key: &crate::PublicKey) -> bool {
        use ed25519_dalek::{Signature as Ed25519Sig, Verifier, VerifyingKey};

        let Ok(pk) = VerifyingKey::from_bytes(public_key.as_bytes()) else {
            return false;
        };
        let sig = Ed25519Sig::from_bytes(&self.0);
        pk.verify(message, &sig).is_ok()
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}...)", hex::encode(&self.0[..8]))
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Signature::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KeyPair;

    #[test]
    fn test_signature_ed25519() {
        let keypair = KeyPair::generate();
        let signature = keypair.sign(b"Test message");
        assert!(signature.verify(b"Test message", keypair.public_key()));
        assert!(!signature.verify(b"Wrong message", keypair.public_key()));
    }

    #[test]
    fn test_signature_wrong_key() {
        let signer = KeyPair::generate();
        let other = KeyPair::generate();
        let signature = signer.sign(b"payload");
        assert!(!signature.verify(b"payload", other.public_key()));
    }

    #[test]
    fn test_signature_base64() {
        let keypair = KeyPair::generate();
        let sig = keypair.sign(b"Test");
        let parsed = Signature::from_base64(&sig.to_base64()).unwrap();
        assert_eq!(sig, parsed);
        assert!(Signature::from_base64("AAAA").is_err());
    }
}
