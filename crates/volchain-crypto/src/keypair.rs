// volchain-crypto/src/keypair.rs

use crate::{hash::sha256, CryptoError, CryptoResult, Signature};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bech32::{FromBase32, ToBase32, Variant};
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Human readable part of every account address
pub const ADDRESS_HRP: &str = "v1";

pub const PUBLIC_KEY_SIZE: usize = 32;
const ADDRESS_PAYLOAD_SIZE: usize = 20;

/// Ed25519 public key. Serialized as 64 lowercase hex characters so it can
/// key JSON maps directly.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    pub fn new(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> CryptoResult<Self> {
        let bytes: [u8; PUBLIC_KEY_SIZE] = slice.try_into().map_err(|_| {
            CryptoError::InvalidPublicKey(format!("expected 32 bytes, got {}", slice.len()))
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> CryptoResult<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        signature.verify(message, self)
    }

    /// Derive the bech32 `v1` address of this key
    pub fn to_address(&self) -> CryptoResult<Address> {
        Address::from_public_key(self)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}...)", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for PublicKey {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        resolve_key(s)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        resolve_key(&s).map_err(serde::de::Error::custom)
    }
}

/// Resolve a user-supplied key string to its canonical 32-byte form.
///
/// Accepted forms, tried in order:
/// 1. 64 hex characters (either case)
/// 2. base64 encoding of exactly 32 bytes
/// 3. a bech32 `v1` address; its 20-byte payload is left-padded with zeros
///
/// The bech32 form cannot recover the original key. It yields a stable
/// placeholder that only matches accounts created from the same input.
pub fn resolve_key(input: &str) -> CryptoResult<PublicKey> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CryptoError::InvalidPublicKey("empty key".into()));
    }

    if input.len() == 64 && input.bytes().all(|b| b.is_ascii_hexdigit()) {
        return PublicKey::from_hex(&input.to_ascii_lowercase());
    }

    if let Ok(bytes) = STANDARD.decode(input) {
        if bytes.len() == PUBLIC_KEY_SIZE {
            return PublicKey::from_slice(&bytes);
        }
    }

    if let Ok(address) = Address::parse(input) {
        let mut bytes = [0u8; PUBLIC_KEY_SIZE];
        bytes[PUBLIC_KEY_SIZE - ADDRESS_PAYLOAD_SIZE..].copy_from_slice(&address.payload());
        return Ok(PublicKey(bytes));
    }

    Err(CryptoError::InvalidPublicKey(format!(
        "unrecognized key format: {input}"
    )))
}

/// Ed25519 secret key bytes, zeroed on drop
pub struct SecretKey([u8; 32]);

impl SecretKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> CryptoResult<Self> {
        let bytes = hex::decode(s.trim()).map_err(|_| CryptoError::InvalidSecretKey)?;
        let bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidSecretKey)?;
        Ok(Self(bytes))
    }
}

impl Drop for SecretKey {
    fn drop(&mut self) {
        self.0.iter_mut().for_each(|b| *b = 0);
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey([REDACTED])")
    }
}

/// Ed25519 key pair
pub struct KeyPair {
    public_key: PublicKey,
    secret_key: SecretKey,
}

impl KeyPair {
    /// Generate a new random keypair from the OS RNG
    pub fn generate() -> Self {
        Self::generate_with(&mut rand::rngs::OsRng)
    }

    pub fn generate_with<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let signing_key = ed25519_dalek::SigningKey::generate(rng);
        Self::from_signing_key(&signing_key)
    }

    pub fn from_secret(secret_key: SecretKey) -> Self {
        let signing_key = ed25519_dalek::SigningKey::from_bytes(secret_key.as_bytes());
        Self {
            public_key: PublicKey(signing_key.verifying_key().to_bytes()),
            secret_key,
        }
    }

    fn from_signing_key(signing_key: &ed25519_dalek::SigningKey) -> Self {
        Self {
            public_key: PublicKey(signing_key.verifying_key().to_bytes()),
            secret_key: SecretKey(signing_key.to_bytes()),
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }

    pub fn address(&self) -> CryptoResult<Address> {
        self.public_key.to_address()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        use ed25519_dalek::Signer;

        let signing_key = ed25519_dalek::SigningKey::from_bytes(self.secret_key.as_bytes());
        Signature::new(signing_key.sign(message).to_bytes())
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

/// bech32 `v1` account address: the first 20 bytes of SHA-256(pubkey)
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(String);

impl Address {
    pub fn from_public_key(public_key: &PublicKey) -> CryptoResult<Self> {
        let digest = sha256(public_key.as_bytes());
        let encoded = bech32::encode(
            ADDRESS_HRP,
            (&digest.as_bytes()[..ADDRESS_PAYLOAD_SIZE]).to_base32(),
            Variant::Bech32,
        )
        .map_err(|e| CryptoError::InvalidAddress(e.to_string()))?;
        Ok(Self(encoded))
    }

    /// Parse and validate a bech32 `v1` address
    pub fn parse(s: &str) -> CryptoResult<Self> {
        let (hrp, data, variant) =
            bech32::decode(s).map_err(|e| CryptoError::InvalidAddress(e.to_string()))?;
        if hrp != ADDRESS_HRP || variant != Variant::Bech32 {
            return Err(CryptoError::InvalidAddress(format!("not a {ADDRESS_HRP} address: {s}")));
        }
        let payload = Vec::<u8>::from_base32(&data)
            .map_err(|e| CryptoError::InvalidAddress(e.to_string()))?;
        if payload.len() != ADDRESS_PAYLOAD_SIZE {
            return Err(CryptoError::InvalidAddress("invalid address length".into()));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn payload(&self) -> [u8; ADDRESS_PAYLOAD_SIZE] {
        let mut out = [0u8; ADDRESS_PAYLOAD_SIZE];
        if let Ok((_, data, _)) = bech32::decode(&self.0) {
            if let Ok(bytes) = Vec::<u8>::from_base32(&data) {
                if bytes.len() == ADDRESS_PAYLOAD_SIZE {
                    out.copy_from_slice(&bytes);
                }
            }
        }
        out
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::parse(s)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Address::parse(&s).map_err(serde::de::Error::custom)
    }
}
