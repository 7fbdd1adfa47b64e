//! Content hashes naming immutable source blobs.
//!
//! A content hash is a string of the form `<algorithm>:<hex-digest>`, e.g.
//! `sha256:e3b0c4...`. Blobs in the store are named by their content hash and
//! are verified against it when they are placed there.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::{Error, Result};

/// Digest algorithms a manifest may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
  Md5,
  Sha1,
  Sha256,
  Sha384,
  Sha512,
}

impl HashAlgorithm {
  /// Length of the hex-encoded digest for this algorithm.
  pub fn hex_len(self) -> usize {
    match self {
      HashAlgorithm::Md5 => 32,
      HashAlgorithm::Sha1 => 40,
      HashAlgorithm::Sha256 => 64,
      HashAlgorithm::Sha384 => 96,
      HashAlgorithm::Sha512 => 128,
    }
  }

  /// The algorithm's name as it appears in a content hash string.
  pub fn name(self) -> &'static str {
    match self {
      HashAlgorithm::Md5 => "md5",
      HashAlgorithm::Sha1 => "sha1",
      HashAlgorithm::Sha256 => "sha256",
      HashAlgorithm::Sha384 => "sha384",
      HashAlgorithm::Sha512 => "sha512",
    }
  }

  /// Hex digest of the full contents of `reader`.
  pub fn digest_reader<R: Read>(self, reader: &mut R) -> io::Result<String> {
    fn drive<D: Digest, R: Read>(reader: &mut R) -> io::Result<String> {
      let mut hasher = D::new();
      let mut buf = [0u8; 64 * 1024];
      loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
          break;
        }
        hasher.update(&buf[..n]);
      }
      Ok(hex::encode(hasher.finalize()))
    }

    match self {
      HashAlgorithm::Md5 => drive::<Md5, R>(reader),
      HashAlgorithm::Sha1 => drive::<Sha1, R>(reader),
      HashAlgorithm::Sha256 => drive::<Sha256, R>(reader),
      HashAlgorithm::Sha384 => drive::<Sha384, R>(reader),
      HashAlgorithm::Sha512 => drive::<Sha512, R>(reader),
    }
  }

  /// Hex digest of a byte slice.
  pub fn digest_bytes(self, mut bytes: &[u8]) -> String {
    // Reading from a slice cannot fail.
    self.digest_reader(&mut bytes).expect("infallible read from slice")
  }
}

impl FromStr for HashAlgorithm {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "md5" => Ok(HashAlgorithm::Md5),
      "sha1" => Ok(HashAlgorithm::Sha1),
      "sha256" => Ok(HashAlgorithm::Sha256),
      "sha384" => Ok(HashAlgorithm::Sha384),
      "sha512" => Ok(HashAlgorithm::Sha512),
      other => Err(Error::UnsupportedAlgorithm(other.to_string())),
    }
  }
}

impl fmt::Display for HashAlgorithm {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/// A parsed `<algorithm>:<hex-digest>` content hash.
///
/// The string form doubles as the blob's filename in the store, so parsing
/// rejects anything that is not plain lowercase hex of the exact digest
/// length. That also rules out path traversal through reference strings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash {
  algorithm: HashAlgorithm,
  digest: String,
}

impl ContentHash {
  /// Parse a `<algorithm>:<hex>` string.
  pub fn parse(s: &str) -> Result<Self> {
    let (algo, digest) = s
      .split_once(':')
      .ok_or_else(|| Error::InvalidContentHash(s.to_string()))?;
    let algorithm: HashAlgorithm = algo.parse()?;

    if digest.len() != algorithm.hex_len()
      || !digest.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
      return Err(Error::InvalidContentHash(s.to_string()));
    }

    Ok(ContentHash {
      algorithm,
      digest: digest.to_string(),
    })
  }

  /// Compute the hash of a file with the given algorithm.
  pub fn of_file(algorithm: HashAlgorithm, path: &Path) -> Result<Self> {
    let mut file = File::open(path)?;
    let digest = algorithm.digest_reader(&mut file)?;
    Ok(ContentHash { algorithm, digest })
  }

  pub fn algorithm(&self) -> HashAlgorithm {
    self.algorithm
  }

  pub fn digest(&self) -> &str {
    &self.digest
  }

  /// Check whether the file at `path` has these contents.
  pub fn verify_file(&self, path: &Path) -> Result<bool> {
    let computed = ContentHash::of_file(self.algorithm, path)?;
    Ok(computed == *self)
  }
}

impl fmt::Display for ContentHash {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.algorithm, self.digest)
  }
}

impl FromStr for ContentHash {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    ContentHash::parse(s)
  }
}

impl Serialize for ContentHash {
  fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(self)
  }
}

impl<'de> Deserialize<'de> for ContentHash {
  fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    ContentHash::parse(&s).map_err(serde::de::Error::custom)
  }
}
