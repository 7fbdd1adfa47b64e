//! Error types for osforge-core.

use thiserror::Error;

/// Errors produced by the shared osforge types.
#[derive(Debug, Error)]
pub enum Error {
  /// A content hash string did not have the `<algo>:<hex>` shape.
  #[error("invalid content hash '{0}': expected <algorithm>:<hex-digest>")]
  InvalidContentHash(String),

  /// A content hash named an algorithm outside the supported set.
  #[error("unsupported hash algorithm '{0}'")]
  UnsupportedAlgorithm(String),

  /// An object identifier was not a 64-character lowercase hex string.
  #[error("invalid object identifier '{0}'")]
  InvalidIdentifier(String),

  /// The manifest violated the schema.
  #[error("invalid manifest: {0}")]
  Manifest(String),

  /// JSON (de)serialization failed.
  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  /// I/O error while reading a manifest or hashing file contents.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}
