//! Primitive chain types and JSON-RPC protocol structures.
//!
//! # Type Categories
//!
//! ## Chain Primitives
//! - [`Address`]: 20-byte account or contract address
//! - [`Hash32`]: 32-byte block/transaction hash
//! - [`Word`]: 256-bit big-endian value used for native and token balances
//!
//! ## JSON-RPC Protocol Types
//! - [`JsonRpcRequest`], [`JsonRpcResponse`], [`JsonRpcError`]
//!
//! All primitives parse from and render to `0x`-prefixed hex, which is also their
//! serde representation so they can be used directly in configuration files.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{borrow::Cow, fmt, str::FromStr, sync::Arc};

/// JSON-RPC protocol version constant.
pub const JSONRPC_VERSION: &str = "2.0";

/// Pre-allocated `Cow` for the JSON-RPC version string.
pub const JSONRPC_VERSION_COW: Cow<'static, str> = Cow::Borrowed(JSONRPC_VERSION);

/// Error type for hex parsing of chain primitives.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HexParseError {
    #[error("missing 0x prefix")]
    MissingPrefix,
    #[error("invalid hex: {0}")]
    InvalidHex(String),
    #[error("invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("quantity does not fit in {0} bits")]
    Overflow(u32),
}

/// Decodes a `0x`-prefixed hex string into exactly `N` bytes.
fn decode_fixed<const N: usize>(value: &str) -> Result<[u8; N], HexParseError> {
    let hex_str = value.strip_prefix("0x").ok_or(HexParseError::MissingPrefix)?;
    let bytes = hex::decode(hex_str).map_err(|e| HexParseError::InvalidHex(e.to_string()))?;
    if bytes.len() != N {
        return Err(HexParseError::InvalidLength { expected: N, actual: bytes.len() });
    }
    let mut arr = [0u8; N];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}

/// Parses a JSON-RPC quantity (`0x`-prefixed, no leading zeros required) into a `u64`.
///
/// # Errors
///
/// Returns an error if the prefix is missing, the digits are not hex, or the value
/// exceeds 64 bits.
pub fn parse_quantity(value: &str) -> Result<u64, HexParseError> {
    let digits = value.strip_prefix("0x").ok_or(HexParseError::MissingPrefix)?;
    if digits.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(digits, 16).map_err(|e| match e.kind() {
        std::num::IntErrorKind::PosOverflow => HexParseError::Overflow(64),
        _ => HexParseError::InvalidHex(e.to_string()),
    })
}

/// Renders a block number or other integer as a JSON-RPC quantity.
#[must_use]
pub fn format_quantity(value: u64) -> String {
    format!("0x{value:x}")
}

macro_rules! hex_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(de::Error::custom)
            }
        }
    };
}

/// 20-byte account or contract address.
///
/// # Example
///
/// ```
/// use chronicle_core::types::Address;
///
/// let addr: Address = "0x00000000000000000000000000000000000000aa".parse().unwrap();
/// assert_eq!(addr.to_string(), "0x00000000000000000000000000000000000000aa");
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(pub [u8; 20]);

impl Address {
    /// Returns the address left-padded to a 32-byte log topic.
    #[must_use]
    pub fn to_topic(&self) -> Hash32 {
        let mut topic = [0u8; 32];
        topic[12..].copy_from_slice(&self.0);
        Hash32(topic)
    }

    /// Extracts an address from a 32-byte topic, rejecting non-zero padding.
    #[must_use]
    pub fn from_topic(topic: &Hash32) -> Option<Self> {
        if topic.0[..12].iter().any(|b| *b != 0) {
            return None;
        }
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&topic.0[12..]);
        Some(Self(arr))
    }

    /// Lowercase hex without the `0x` prefix, used in rate limiter tags.
    #[must_use]
    pub fn to_hex_lower(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for Address {
    type Err = HexParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_fixed::<20>(s).map(Self)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

hex_serde!(Address);

/// 32-byte hash (block hashes, transaction hashes, log topics, fingerprints).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash32(pub [u8; 32]);

impl TryFrom<&str> for Hash32 {
    type Error = HexParseError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        decode_fixed::<32>(value).map(Self)
    }
}

impl FromStr for Hash32 {
    type Err = HexParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s)
    }
}

impl From<[u8; 32]> for Hash32 {
    fn from(arr: [u8; 32]) -> Self {
        Self(arr)
    }
}

impl fmt::Display for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

hex_serde!(Hash32);

/// 256-bit unsigned value stored big-endian.
///
/// Balances are only ever compared for equality and hashed, so no arithmetic is
/// provided beyond construction from machine integers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Word(pub [u8; 32]);

impl Word {
    pub const ZERO: Self = Self([0u8; 32]);

    #[must_use]
    pub fn from_u128(value: u128) -> Self {
        let mut arr = [0u8; 32];
        arr[16..].copy_from_slice(&value.to_be_bytes());
        Self(arr)
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Parses a JSON-RPC quantity or a full 32-byte `eth_call` return word.
    ///
    /// # Errors
    ///
    /// Returns an error for a missing prefix, invalid digits, or more than 256 bits.
    pub fn from_quantity(value: &str) -> Result<Self, HexParseError> {
        let digits = value.strip_prefix("0x").ok_or(HexParseError::MissingPrefix)?;
        if digits.len() > 64 {
            return Err(HexParseError::Overflow(256));
        }
        let padded = format!("{digits:0>64}");
        let bytes = hex::decode(padded).map_err(|e| HexParseError::InvalidHex(e.to_string()))?;
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Builds a word from a big-endian byte slice of at most 32 bytes.
    #[must_use]
    pub fn from_be_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() > 32 {
            return None;
        }
        let mut arr = [0u8; 32];
        arr[32 - bytes.len()..].copy_from_slice(bytes);
        Some(Self(arr))
    }

    /// Renders the value as a minimal JSON-RPC quantity (`0x0` for zero).
    #[must_use]
    pub fn to_quantity(&self) -> String {
        let encoded = hex::encode(self.0);
        let trimmed = encoded.trim_start_matches('0');
        if trimmed.is_empty() {
            "0x0".to_string()
        } else {
            format!("0x{trimmed}")
        }
    }
}

impl FromStr for Word {
    type Err = HexParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_quantity(s)
    }
}

impl fmt::Display for Word {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_quantity())
    }
}

impl fmt::Debug for Word {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

hex_serde!(Word);

/// JSON-RPC 2.0 request structure.
///
/// `id` is an `Arc` so batch responses can be matched back to their requests
/// without deep-copying the JSON value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: Cow<'static, str>,
    pub method: String,
    pub params: Option<serde_json::Value>,
    pub id: Arc<serde_json::Value>,
}

impl JsonRpcRequest {
    #[must_use]
    pub fn new(method: &str, params: Option<serde_json::Value>, id: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION_COW,
            method: method.to_string(),
            params,
            id: Arc::new(id),
        }
    }
}

/// JSON-RPC 2.0 response structure. Carries either `result` or `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: Cow<'static, str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Arc<serde_json::Value>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    pub data: Option<serde_json::Value>,
}
