use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Number of hex characters in a textual record identifier.
pub const RECORD_ID_HEX_LEN: usize = 40;

/// Content identifier of a record held by a Merkle directory store.
///
/// Identifiers are supplied by callers and are conventionally a SHA-1 digest
/// of something meaningful (a revision, a file version). The store never
/// computes or verifies them; it only relies on the leading characters being
/// evenly distributed so that index shards stay balanced.
///
/// The mapping identifier → bytes is write-once: once an identifier exists in
/// a store its content never changes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordId([u8; 20]);

impl RecordId {
    /// Create a `RecordId` from its raw 20 bytes.
    pub const fn from_raw(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Derive an identifier from a domain tag and identifying parts.
    ///
    /// Used for records that have no natural identifier of their own (certs,
    /// deltas, public keys). Parts are NUL-separated so that `("ab", "c")`
    /// and `("a", "bc")` never collide.
    pub fn derive(domain: &str, parts: &[&[u8]]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(domain.as_bytes());
        hasher.update(b":");
        for part in parts {
            hasher.update(part);
            hasher.update(b"\0");
        }
        let mut out = [0u8; 20];
        out.copy_from_slice(&hasher.finalize().as_bytes()[..20]);
        Self(out)
    }

    /// Parse from a 40-character hex string (either case).
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        if s.len() != RECORD_ID_HEX_LEN {
            return Err(TypeError::InvalidLength {
                expected: RECORD_ID_HEX_LEN,
                actual: s.len(),
            });
        }
        let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// The raw 20-byte identifier.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Lowercase hex representation (40 characters).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short hex representation (first 8 characters).
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// The index shard responsible for this identifier.
    pub fn prefix(&self) -> ShardPrefix {
        ShardPrefix(self.0[0])
    }
}

impl fmt::Debug for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({})", self.short_hex())
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for RecordId {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl TryFrom<String> for RecordId {
    type Error = TypeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_hex(&s)
    }
}

impl From<RecordId> for String {
    fn from(id: RecordId) -> Self {
        id.to_hex()
    }
}

/// Two-hex-character prefix selecting one of the 256 index shards.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardPrefix(u8);

impl ShardPrefix {
    /// Number of shards in a store.
    pub const COUNT: usize = 256;

    pub const fn new(byte: u8) -> Self {
        Self(byte)
    }

    /// Every prefix, `00` through `ff`, in order.
    pub fn all() -> impl Iterator<Item = ShardPrefix> {
        (0..=u8::MAX).map(ShardPrefix)
    }

    /// Parse a two-character hex prefix.
    pub fn parse(s: &str) -> Result<Self, TypeError> {
        if s.len() != 2 {
            return Err(TypeError::InvalidPrefix(s.to_string()));
        }
        u8::from_str_radix(s, 16)
            .map(ShardPrefix)
            .map_err(|_| TypeError::InvalidPrefix(s.to_string()))
    }

    pub fn as_byte(&self) -> u8 {
        self.0
    }
}

impl fmt::Debug for ShardPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShardPrefix({:02x})", self.0)
    }
}

impl fmt::Display for ShardPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const HELLO: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    #[test]
    fn hex_roundtrip() {
        let id = RecordId::from_hex(HELLO).unwrap();
        assert_eq!(id.to_hex(), HELLO);
        assert_eq!(format!("{id}"), HELLO);
    }

    #[test]
    fn uppercase_is_normalized() {
        let id = RecordId::from_hex(&HELLO.to_uppercase()).unwrap();
        assert_eq!(id.to_hex(), HELLO);
    }

    #[test]
    fn wrong_length_rejected() {
        let err = RecordId::from_hex("abcd").unwrap_err();
        assert_eq!(
            err,
            TypeError::InvalidLength {
                expected: 40,
                actual: 4
            }
        );
    }

    #[test]
    fn non_hex_rejected() {
        let bad = "zz".repeat(20);
        assert!(matches!(
            RecordId::from_hex(&bad),
            Err(TypeError::InvalidHex(_))
        ));
    }

    #[test]
    fn prefix_is_first_byte() {
        let id: RecordId = "3f00000000000000000000000000000000000000".parse().unwrap();
        assert_eq!(id.prefix().to_string(), "3f");
        assert_eq!(id.prefix(), ShardPrefix::parse("3f").unwrap());
    }

    #[test]
    fn all_prefixes_cover_256_shards() {
        let all: Vec<_> = ShardPrefix::all().collect();
        assert_eq!(all.len(), ShardPrefix::COUNT);
        assert_eq!(all[0].to_string(), "00");
        assert_eq!(all[255].to_string(), "ff");
    }

    #[test]
    fn bad_prefix_rejected() {
        assert!(ShardPrefix::parse("0").is_err());
        assert!(ShardPrefix::parse("zz").is_err());
        assert!(ShardPrefix::parse("abc").is_err());
    }

    #[test]
    fn derive_is_domain_separated() {
        let a = RecordId::derive("cert", &[b"payload"]);
        let b = RecordId::derive("pubkey", &[b"payload"]);
        assert_ne!(a, b);
        assert_eq!(a, RecordId::derive("cert", &[b"payload"]));
    }

    #[test]
    fn derive_separates_parts() {
        let a = RecordId::derive("fdelta", &[b"ab", b"c"]);
        let b = RecordId::derive("fdelta", &[b"a", b"bc"]);
        assert_ne!(a, b);
    }

    #[test]
    fn serde_uses_hex_string() {
        let id = RecordId::from_hex(HELLO).unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{HELLO}\""));
        let back: RecordId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    proptest! {
        #[test]
        fn display_parses_back(bytes in any::<[u8; 20]>()) {
            let id = RecordId::from_raw(bytes);
            prop_assert_eq!(id.to_hex().parse::<RecordId>().unwrap(), id);
            prop_assert_eq!(id.prefix().as_byte(), bytes[0]);
        }
    }
}
