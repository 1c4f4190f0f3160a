//! WireGuard key material
//!
//! Keys are X25519 and travel as standard base64, exactly as `wg genkey`
//! and `wg pubkey` print them.

use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ipnet::Ipv6Net;
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;
use x25519_dalek::{PublicKey, StaticSecret};

const LINK_LOCAL_PREFIX_LEN: u8 = 64;

/// Decode a base64 key, requiring exactly 32 bytes
fn decode_key(value: &str) -> Result<[u8; 32]> {
    let bytes = BASE64
        .decode(value.trim())
        .map_err(|e| Error::InvalidKey(format!("bad base64: {}", e)))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| Error::InvalidKey(format!("expected 32 bytes, got {}", b.len())))
}

/// WireGuard public key
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WgKey(pub [u8; 32]);

impl WgKey {
    /// Parse a base64-encoded public key
    pub fn from_base64(value: &str) -> Result<Self> {
        decode_key(value).map(Self)
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Short hex prefix for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Link-local tunnel address with an interface id hashed from the key
    pub fn link_local(&self) -> Ipv6Net {
        let digest = blake3::hash(&self.0);
        let mut octets = [0u8; 16];
        octets[..2].copy_from_slice(&[0xfe, 0x80]);
        octets[8..].copy_from_slice(&digest.as_bytes()[..8]);
        let addr = Ipv6Addr::from(octets);
        Ipv6Net::new(addr, LINK_LOCAL_PREFIX_LEN).unwrap_or_else(|_| Ipv6Net::from(addr))
    }
}

impl fmt::Display for WgKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for WgKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WgKey({})", self.to_base64())
    }
}

impl FromStr for WgKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_base64(s)
    }
}

impl Serialize for WgKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for WgKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

/// WireGuard private key. Never printed.
#[derive(Clone)]
pub struct PrivateKey(StaticSecret);

impl PrivateKey {
    /// Generate a new key from the OS CSPRNG
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(OsRng))
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    /// Parse a base64-encoded private key
    pub fn from_base64(value: &str) -> Result<Self> {
        decode_key(value).map(Self::from_bytes)
    }

    /// Raw key bytes, for persistence only
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Encode as base64 (the form `wg` consumes)
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0.to_bytes())
    }

    /// Derive the matching public key
    pub fn public_key(&self) -> WgKey {
        WgKey(PublicKey::from(&self.0).to_bytes())
    }
}

impl PartialEq for PrivateKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bytes() == other.0.to_bytes()
    }
}

impl Eq for PrivateKey {}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

/// This gateway's WireGuard identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    /// Secret half, never transmitted
    pub private_key: PrivateKey,
    /// Public half, advertised to peers
    pub public_key: WgKey,
    /// UDP listen port of the tunnel interface
    pub listen_port: u16,
}

impl LocalIdentity {
    /// Generate a fresh identity
    pub fn generate(listen_port: u16) -> Self {
        Self::from_private_key(PrivateKey::generate(), listen_port)
    }

    /// Build an identity around an existing private key
    pub fn from_private_key(private_key: PrivateKey, listen_port: u16) -> Self {
        let public_key = private_key.public_key();
        Self {
            private_key,
            public_key,
            listen_port,
        }
    }
}
