//! Shared Consensus Types
//!
//! Fixed-size byte newtypes used across deposit and exit handling, plus the
//! hex and quoted-integer serde helpers used by the beacon API and the file
//! formats this crate reads and writes.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// 32-byte hash tree root
pub type Root = [u8; 32];

/// 4-byte fork version
pub type Version = [u8; 4];

/// 4-byte signing domain type
pub type DomainType = [u8; 4];

/// 32-byte signing domain
pub type Domain = [u8; 32];

/// Length of a compressed BLS public key
pub const PUBKEY_LEN: usize = 48;

/// Length of a compressed BLS signature
pub const SIGNATURE_LEN: usize = 96;

/// Errors from decoding hex-encoded fixed-size values
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HexError {
    #[error("invalid hex: {0}")]
    InvalidHex(String),

    #[error("expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// Decode an optionally `0x`-prefixed hex string into exactly `N` bytes.
///
/// # Errors
/// Returns an error if the string is not hex or does not decode to `N` bytes.
pub fn parse_hex_fixed<const N: usize>(s: &str) -> Result<[u8; N], HexError> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(s).map_err(|e| HexError::InvalidHex(e.to_string()))?;
    let actual = bytes.len();
    bytes
        .try_into()
        .map_err(|_| HexError::InvalidLength { expected: N, actual })
}

/// Encode bytes as a `0x`-prefixed lowercase hex string.
#[must_use]
pub fn to_prefixed_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Compressed BLS12-381 public key (48 bytes).
///
/// Displays as lowercase hex without a `0x` prefix, which is the form used in
/// exit filenames and as the grouping key for exit records.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlsPubkey(pub [u8; PUBKEY_LEN]);

impl BlsPubkey {
    /// Raw key bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; PUBKEY_LEN] {
        &self.0
    }

    /// `0x`-prefixed hex form used by the beacon API and preparation files
    #[must_use]
    pub fn to_prefixed_hex(&self) -> String {
        to_prefixed_hex(&self.0)
    }
}

impl Default for BlsPubkey {
    fn default() -> Self {
        Self([0u8; PUBKEY_LEN])
    }
}

impl fmt::Display for BlsPubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for BlsPubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlsPubkey({self})")
    }
}

impl FromStr for BlsPubkey {
    type Err = HexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hex_fixed(s).map(Self)
    }
}

impl Serialize for BlsPubkey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_prefixed_hex())
    }
}

impl<'de> Deserialize<'de> for BlsPubkey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Compressed BLS12-381 signature (96 bytes)
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BlsSignature(pub [u8; SIGNATURE_LEN]);

impl BlsSignature {
    /// Raw signature bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LEN] {
        &self.0
    }
}

impl fmt::Debug for BlsSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlsSignature(0x{})", hex::encode(self.0))
    }
}

impl FromStr for BlsSignature {
    type Err = HexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hex_fixed(s).map(Self)
    }
}

/// Serde helpers for fixed-size byte arrays as `0x`-prefixed hex strings.
///
/// Deserialization accepts the prefix as optional.
pub mod hex_fixed {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S, const N: usize>(bytes: &[u8; N], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::to_prefixed_hex(bytes))
    }

    pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        super::parse_hex_fixed(&s).map_err(serde::de::Error::custom)
    }
}

/// Serde helpers for `u64` values encoded as decimal strings (beacon API style)
pub mod quoted_u64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &u64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Decode a hex string at compile time. Panics (at compile time when used in a
/// `const`) on malformed input.
#[must_use]
pub const fn const_hex<const N: usize>(s: &str) -> [u8; N] {
    const fn nibble(c: u8) -> u8 {
        match c {
            b'0'..=b'9' => c - b'0',
            b'a'..=b'f' => c - b'a' + 10,
            b'A'..=b'F' => c - b'A' + 10,
            _ => panic!("invalid hex digit"),
        }
    }

    let bytes = s.as_bytes();
    assert!(bytes.len() == 2 * N, "hex string has wrong length");

    let mut out = [0u8; N];
    let mut i = 0;
    while i < N {
        out[i] = (nibble(bytes[2 * i]) << 4) | nibble(bytes[2 * i + 1]);
        i += 1;
    }
    out
}
