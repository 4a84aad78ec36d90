use rand::RngCore;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A 128-bit opaque identifier. Used for `NodeId`, `GroupId`, `InviteId` and
/// `Nonce` below. Ordering is the canonical byte-lexicographic order used
/// throughout the matrix (node ids sort this way to fix column ordering).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Id128([u8; 16]);

impl Id128 {
    pub const SIZE: usize = 16;

    #[inline]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Id128(bytes)
    }

    #[inline]
    pub fn none() -> Self {
        Id128([0u8; 16])
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        self.0 == [0u8; 16]
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Draw a random, non-zero id. Mirrors `UUID::random`'s retry-until-nonzero
    /// loop in `original_source/uuid.cpp`.
    pub fn random<R: RngCore>(rng: &mut R) -> Self {
        loop {
            let mut buf = [0u8; 16];
            rng.fill_bytes(&mut buf);
            if buf != [0u8; 16] {
                return Id128(buf);
            }
        }
    }
}

impl fmt::Display for Id128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode_upper(self.0))
    }
}

impl fmt::Debug for Id128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id128({})", self)
    }
}

impl std::str::FromStr for Id128 {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s)?;
        let mut bytes = [0u8; 16];
        if raw.len() != 16 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        bytes.copy_from_slice(&raw);
        Ok(Id128(bytes))
    }
}

impl Serialize for Id128 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Id128 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <&str>::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

macro_rules! id128_newtype {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Id128);

        impl $name {
            #[inline]
            pub fn none() -> Self {
                $name(Id128::none())
            }

            #[inline]
            pub fn is_none(&self) -> bool {
                self.0.is_none()
            }

            #[inline]
            pub fn random<R: RngCore>(rng: &mut R) -> Self {
                $name(Id128::random(rng))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = hex::FromHexError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok($name(s.parse()?))
            }
        }
    };
}

id128_newtype!(NodeId);
id128_newtype!(GroupId);
id128_newtype!(InviteId);
id128_newtype!(Nonce);

/// 256-bit symmetric key shared by all nodes in a group.
///
/// Serialized as hex, mirroring `flux::session::server::SessionKey`'s
/// base64-wrapped fixed-size-array pattern (here hex, to match the
/// original's `uuid_unparse`-style textual group-id file format).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Key(pub [u8; 32]);

impl Key {
    pub const SIZE: usize = 32;

    pub fn random<R: RngCore>(rng: &mut R) -> Self {
        let mut buf = [0u8; 32];
        rng.fill_bytes(&mut buf);
        Key(buf)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key(<redacted>)")
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <&str>::deserialize(deserializer)?;
        let raw = hex::decode(s).map_err(de::Error::custom)?;
        if raw.len() != 32 {
            return Err(de::Error::custom("key must be 32 bytes"));
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&raw);
        Ok(Key(bytes))
    }
}

/// 256-bit digest summarizing a node's matrix state (SHA-256 of the
/// `(NodeId‖row)` concatenation in NodeId order — see spec §3).
#[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatrixDigest(#[serde(with = "hex_32")] pub [u8; 32]);

impl MatrixDigest {
    pub fn zero() -> Self {
        MatrixDigest([0u8; 32])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Short prefix for debug logging, matching `SHA256::partial()`.
    pub fn partial(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for MatrixDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MatrixDigest({}..)", self.partial())
    }
}

mod hex_32 {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = <&str>::deserialize(d)?;
        let raw = hex::decode(s).map_err(de::Error::custom)?;
        if raw.len() != 32 {
            return Err(de::Error::custom("expected 32 bytes"));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&raw);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_roundtrips_through_display_and_parse() {
        let mut rng = rand::thread_rng();
        let id = NodeId::random(&mut rng);
        let text = id.to_string();
        let parsed: NodeId = text.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn none_is_all_zero_and_distinguishable() {
        let mut rng = rand::thread_rng();
        assert!(NodeId::none().is_none());
        assert!(!NodeId::random(&mut rng).is_none());
    }

    #[test]
    fn key_serde_roundtrip() {
        let mut rng = rand::thread_rng();
        let key = Key::random(&mut rng);
        let json = serde_json::to_string(&key).unwrap();
        let back: Key = serde_json::from_str(&json).unwrap();
        assert_eq!(key.0, back.0);
    }
}
