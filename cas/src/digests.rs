use bytes::Bytes;
use data_encoding::HEXLOWER;
use thiserror::Error;

/// A blake3 content address.
///
/// For chunks and bulk objects this is the digest of the *compressed* bytes,
/// which is also what is stored remotely; for catalogs it is the digest of
/// the compressed database file.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CasDigest(Bytes);

pub const DIGEST_LEN: usize = blake3::OUT_LEN;

#[derive(Error, Debug, PartialEq)]
pub enum Error {
    #[error("invalid digest length: {0}")]
    InvalidDigestLen(usize),
}

impl CasDigest {
    /// Digest a byte slice.
    pub fn of_bytes(data: &[u8]) -> Self {
        blake3::hash(data).as_bytes().into()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0[..]
    }

    pub fn to_hex(&self) -> String {
        HEXLOWER.encode(&self.0)
    }

    /// Remote key for a data chunk, sharded after the second hex character
    /// to keep directory fan-out bounded on filesystem-backed stores.
    pub fn chunk_key(&self) -> String {
        let hex = self.to_hex();
        format!("chunks/{}/{}", &hex[..2], hex)
    }

    /// Remote key for a catalog snapshot.
    pub fn catalog_key(&self) -> String {
        let hex = self.to_hex();
        format!("catalogs/{}/{}", &hex[..2], hex)
    }
}

impl From<&[u8; DIGEST_LEN]> for CasDigest {
    fn from(value: &[u8; DIGEST_LEN]) -> Self {
        Self(value.to_vec().into())
    }
}

impl From<CasDigest> for Bytes {
    fn from(value: CasDigest) -> Self {
        value.0
    }
}

impl TryFrom<Vec<u8>> for CasDigest {
    type Error = Error;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        if value.len() != DIGEST_LEN {
            Err(Error::InvalidDigestLen(value.len()))
        } else {
            Ok(Self(value.into()))
        }
    }
}

impl TryFrom<Bytes> for CasDigest {
    type Error = Error;

    fn try_from(value: Bytes) -> Result<Self, Self::Error> {
        if value.len() != DIGEST_LEN {
            Err(Error::InvalidDigestLen(value.len()))
        } else {
            Ok(Self(value))
        }
    }
}

impl std::fmt::Display for CasDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for CasDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CasDigest({})", self.to_hex())
    }
}

impl serde::Serialize for CasDigest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for CasDigest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct DigestVisitor;

        impl<'de> serde::de::Visitor<'de> for DigestVisitor {
            type Value = CasDigest;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(f, "{} digest bytes", DIGEST_LEN)
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                CasDigest::try_from(v.to_vec()).map_err(E::custom)
            }

            fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
                CasDigest::try_from(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_byte_buf(DigestVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_vec_checks_length() {
        assert_eq!(
            CasDigest::try_from(vec![0u8; 16]),
            Err(Error::InvalidDigestLen(16))
        );
        assert!(CasDigest::try_from(vec![0u8; DIGEST_LEN]).is_ok());
    }

    #[test]
    fn keys_are_sharded() {
        let digest = CasDigest::of_bytes(b"hello");
        let hex = digest.to_hex();
        assert_eq!(digest.chunk_key(), format!("chunks/{}/{}", &hex[..2], hex));
        assert!(digest.catalog_key().starts_with("catalogs/"));
    }

    #[test]
    fn digest_matches_blake3() {
        let digest = CasDigest::of_bytes(b"canopy");
        assert_eq!(digest.as_slice(), blake3::hash(b"canopy").as_bytes());
    }
}
