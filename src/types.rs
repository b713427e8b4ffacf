//! Core value types shared by the account, its extensions and the host.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Seconds since the Unix epoch, as reported by the host clock.
pub type Timestamp = u64;

/// Token amounts and native value, in the asset's smallest unit.
pub type Amount = u128;

/// A 32-byte public identifier. For signing identities this is the raw
/// ed25519 public key; for contracts and assets it is an opaque id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(pub [u8; 32]);

impl Address {
    pub const ZERO: Address = Address([0u8; 32]);

    pub fn new(bytes: [u8; 32]) -> Self {
        Address(bytes)
    }

    /// Deterministic id for a named contract or asset (tests, fixtures).
    pub fn from_label(label: &str) -> Self {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(b"compass-account:address:");
        hasher.update(label.as_bytes());
        let mut out = [0u8; 32];
        out.copy_from_slice(&hasher.finalize());
        Address(out)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, String> {
        let bytes = hex::decode(s.trim_start_matches("0x")).map_err(|e| e.to_string())?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| "address must be 32 bytes".to_string())?;
        Ok(Address(arr))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.to_hex())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps logs readable
        write!(f, "0x{}..", &self.to_hex()[..8])
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Address::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Asset identifier. Token assets use the token contract's address.
pub type AssetId = Address;

/// Reserved identifier for the native asset.
pub const NATIVE_ASSET: AssetId = Address([0xee; 32]);

/// What a call payload asks for, read from its leading bytes.
///
/// Only a payload of zero length is `Empty`; a payload too short to carry a
/// selector is `Truncated` and never matches an allowance.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Selector {
    Empty,
    Truncated,
    Function([u8; 4]),
}

impl Selector {
    /// Selector of a plain value transfer.
    pub const EMPTY: Selector = Selector::Empty;

    pub const fn new(bytes: [u8; 4]) -> Self {
        Selector::Function(bytes)
    }

    pub fn of(payload: &[u8]) -> Self {
        match payload {
            [] => Selector::Empty,
            [a, b, c, d, ..] => Selector::Function([*a, *b, *c, *d]),
            _ => Selector::Truncated,
        }
    }

    /// The four selector bytes, if the payload names a function.
    pub fn bytes(&self) -> Option<[u8; 4]> {
        match self {
            Selector::Function(bytes) => Some(*bytes),
            _ => None,
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Empty => f.write_str("0x"),
            Selector::Truncated => f.write_str("truncated"),
            Selector::Function(bytes) => write!(f, "0x{}", hex::encode(bytes)),
        }
    }
}

impl Serialize for Selector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Selector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s == "truncated" {
            return Ok(Selector::Truncated);
        }
        let bytes = hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom)?;
        if bytes.is_empty() {
            return Ok(Selector::Empty);
        }
        let arr: [u8; 4] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("selector must be 4 bytes"))?;
        Ok(Selector::Function(arr))
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A single call the account performs.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub target: Address,
    pub value: Amount,
    pub payload: Vec<u8>,
}

impl Call {
    pub fn new(target: Address, value: Amount, payload: Vec<u8>) -> Self {
        Self { target, value, payload }
    }

    /// Plain native-asset transfer with no payload.
    pub fn transfer_native(to: Address, value: Amount) -> Self {
        Self { target: to, value, payload: Vec::new() }
    }

    pub fn selector(&self) -> Selector {
        Selector::of(&self.payload)
    }
}

/// Deterministic bucket for rolling-window rate limits.
pub fn window_id(timestamp: Timestamp, window_length: u64) -> u64 {
    if window_length == 0 {
        return 0;
    }
    timestamp / window_length
}
