//! Content digests.
//!
//! A [`Digest`] is an `(algorithm, hex)` pair. Only allowlisted algorithms
//! with lowercase hex of the exact expected length are accepted, so a parsed
//! digest is always safe to use as a path component.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256, Sha512};
use std::fmt;
use std::io::Read;
use std::str::FromStr;

/// Supported hash algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Algorithm {
    Sha256,
    Sha512,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }

    /// Number of hex characters in a digest of this algorithm.
    pub fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha512 => 128,
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "sha256" => Some(Algorithm::Sha256),
            "sha512" => Some(Algorithm::Sha512),
            _ => None,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies a byte sequence by its cryptographic hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    /// Build a digest from parts, validating the hex against the algorithm.
    pub fn new(algorithm: Algorithm, hex: impl Into<String>) -> Result<Self> {
        let hex = hex.into();
        if hex.len() != algorithm.hex_len() {
            return Err(StoreError::InvalidDigest {
                digest: format!("{}:{}", algorithm, hex),
                reason: format!(
                    "expected {} hex characters, got {}",
                    algorithm.hex_len(),
                    hex.len()
                ),
            });
        }
        if !hex.bytes().all(|c| c.is_ascii_digit() || (b'a'..=b'f').contains(&c)) {
            return Err(StoreError::InvalidDigest {
                digest: format!("{}:{}", algorithm, hex),
                reason: "contains non-lowercase-hexadecimal characters".to_string(),
            });
        }
        Ok(Self { algorithm, hex })
    }

    /// SHA256 digest of an in-memory buffer.
    pub fn sha256_of(data: &[u8]) -> Self {
        Self {
            algorithm: Algorithm::Sha256,
            hex: hex::encode(Sha256::digest(data)),
        }
    }

    /// Hash everything `reader` yields with `algorithm`.
    pub fn compute<R: Read>(algorithm: Algorithm, reader: &mut R) -> std::io::Result<Self> {
        let mut hasher = ContentHasher::new(algorithm);
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
        Ok(hasher.finalize())
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// First 12 hex characters, as shown in listings.
    pub fn short(&self) -> &str {
        &self.hex[..12]
    }

    /// Whether `s` has the `<alg>:<hex>` shape of a digest.
    pub fn looks_like_digest(s: &str) -> bool {
        s.parse::<Digest>().is_ok()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Digest {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        let (alg, hex) = s.split_once(':').ok_or_else(|| StoreError::InvalidDigest {
            digest: s.to_string(),
            reason: "expected <algorithm>:<hex>".to_string(),
        })?;
        let algorithm = Algorithm::parse(alg).ok_or_else(|| StoreError::InvalidDigest {
            digest: s.to_string(),
            reason: format!("algorithm {:?} not in allowlist", alg),
        })?;
        Digest::new(algorithm, hex)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Incremental hasher producing a [`Digest`].
pub enum ContentHasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl ContentHasher {
    pub fn new(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::Sha256 => ContentHasher::Sha256(Sha256::new()),
            Algorithm::Sha512 => ContentHasher::Sha512(Sha512::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            ContentHasher::Sha256(h) => h.update(data),
            ContentHasher::Sha512(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Digest {
        match self {
            ContentHasher::Sha256(h) => Digest {
                algorithm: Algorithm::Sha256,
                hex: hex::encode(h.finalize()),
            },
            ContentHasher::Sha512(h) => Digest {
                algorithm: Algorithm::Sha512,
                hex: hex::encode(h.finalize()),
            },
        }
    }
}
