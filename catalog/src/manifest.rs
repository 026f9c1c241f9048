//! The signed top-level record emitted by a commit.
//!
//! Line-oriented: one field letter per line, then a separator and the
//! signature over everything above it. The signer is external; anything
//! implementing the ed25519 `Signer` trait works.

use canopy_cas::CasDigest;
use data_encoding::{BASE64, HEXLOWER};
use ed25519::signature::Signer;
use thiserror::Error;

#[derive(Clone, Debug, PartialEq)]
pub struct Manifest {
    pub root_digest: CasDigest,
    pub revision: u64,
    pub timestamp: i64,
    /// Catalogs known to the publish that produced this manifest.
    pub catalog_count: u64,
    /// Compressed size of the root catalog snapshot.
    pub root_catalog_size: u64,
    /// Digest of the published tag history database, once uploaded.
    pub history_digest: Option<CasDigest>,
}

#[derive(Error, Debug, PartialEq)]
pub enum ManifestError {
    #[error("missing field '{0}'")]
    MissingField(char),
    #[error("malformed line: {0}")]
    MalformedLine(String),
    #[error("malformed signature block")]
    MalformedSignature,
}

impl Manifest {
    pub fn with_history_digest(mut self, digest: CasDigest) -> Self {
        self.history_digest = Some(digest);
        self
    }

    /// The canonical text the signature covers.
    pub fn fingerprint(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("C{}\n", self.root_digest.to_hex()));
        out.push_str(&format!("R{}\n", self.revision));
        out.push_str(&format!("T{}\n", self.timestamp));
        out.push_str(&format!("N{}\n", self.catalog_count));
        out.push_str(&format!("S{}\n", self.root_catalog_size));
        if let Some(history) = &self.history_digest {
            out.push_str(&format!("H{}\n", history.to_hex()));
        }
        out
    }

    pub fn parse(text: &str) -> Result<Self, ManifestError> {
        let mut root_digest = None;
        let mut revision = None;
        let mut timestamp = None;
        let mut catalog_count = None;
        let mut root_catalog_size = None;
        let mut history_digest = None;

        for line in text.lines() {
            if line == "--" {
                break;
            }
            let Some(tag) = line.chars().next() else {
                continue;
            };
            let value = &line[1..];
            match tag {
                'C' => root_digest = Some(parse_digest(value)?),
                'R' => revision = Some(parse_number(value)?),
                'T' => {
                    timestamp = Some(value.parse::<i64>().map_err(|_| {
                        ManifestError::MalformedLine(line.to_string())
                    })?)
                }
                'N' => catalog_count = Some(parse_number(value)?),
                'S' => root_catalog_size = Some(parse_number(value)?),
                'H' => history_digest = Some(parse_digest(value)?),
                _ => return Err(ManifestError::MalformedLine(line.to_string())),
            }
        }

        Ok(Self {
            root_digest: root_digest.ok_or(ManifestError::MissingField('C'))?,
            revision: revision.ok_or(ManifestError::MissingField('R'))?,
            timestamp: timestamp.ok_or(ManifestError::MissingField('T'))?,
            catalog_count: catalog_count.ok_or(ManifestError::MissingField('N'))?,
            root_catalog_size: root_catalog_size.ok_or(ManifestError::MissingField('S'))?,
            history_digest,
        })
    }

    /// Attach a detached signature over the fingerprint.
    pub fn sign<S>(self, key_name: &str, key: &S) -> SignedManifest
    where
        S: Signer<ed25519::Signature>,
    {
        let signature = key.sign(self.fingerprint().as_bytes());
        SignedManifest {
            manifest: self,
            key_name: key_name.to_string(),
            signature,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SignedManifest {
    pub manifest: Manifest,
    pub key_name: String,
    pub signature: ed25519::Signature,
}

impl SignedManifest {
    pub fn verify(&self, verifying_key: &ed25519_dalek::VerifyingKey) -> bool {
        verifying_key
            .verify_strict(self.manifest.fingerprint().as_bytes(), &self.signature)
            .is_ok()
    }

    pub fn parse(text: &str) -> Result<Self, ManifestError> {
        let manifest = Manifest::parse(text)?;
        let signature_line = text
            .lines()
            .skip_while(|line| *line != "--")
            .nth(1)
            .ok_or(ManifestError::MalformedSignature)?;
        let (key_name, signature64) = signature_line
            .split_once(':')
            .ok_or(ManifestError::MalformedSignature)?;

        let decoded = BASE64
            .decode(signature64.as_bytes())
            .map_err(|_| ManifestError::MalformedSignature)?;
        let bytes: [u8; 64] = decoded
            .try_into()
            .map_err(|_| ManifestError::MalformedSignature)?;

        Ok(Self {
            manifest,
            key_name: key_name.to_string(),
            signature: ed25519::Signature::from_bytes(&bytes),
        })
    }
}

impl std::fmt::Display for SignedManifest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}--\n{}:{}\n",
            self.manifest.fingerprint(),
            self.key_name,
            BASE64.encode(&self.signature.to_bytes())
        )
    }
}

fn parse_digest(value: &str) -> Result<CasDigest, ManifestError> {
    let bytes = HEXLOWER
        .decode(value.as_bytes())
        .map_err(|_| ManifestError::MalformedLine(value.to_string()))?;
    CasDigest::try_from(bytes).map_err(|_| ManifestError::MalformedLine(value.to_string()))
}

fn parse_number(value: &str) -> Result<u64, ManifestError> {
    value
        .parse::<u64>()
        .map_err(|_| ManifestError::MalformedLine(value.to_string()))
}
