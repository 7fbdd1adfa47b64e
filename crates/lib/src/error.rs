//! Engine error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use osforge_core::ObjectId;

/// A structured failure reported by a stage over the host API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageException {
  pub kind: String,
  pub message: String,
}

/// Errors surfaced by the engine.
///
/// Nothing is retried automatically: stages are assumed deterministic, and
/// partial results in the store are reproducible, so they are preserved
/// rather than rolled back.
#[derive(Debug, Error)]
pub enum Error {
  /// Schema violation or unknown stage/input/source type. Fatal at load.
  #[error("invalid manifest: {0}")]
  ManifestInvalid(String),

  /// A fetcher failed or a requested blob could not be produced. Fatal for
  /// dependent pipelines; no stage of those pipelines runs.
  #[error("source '{source_type}' unavailable: {reason}")]
  SourceUnavailable { source_type: String, reason: String },

  /// A fetched blob did not hash to its requested name. The partial blob is
  /// deleted before this is raised.
  #[error("source blob '{reference}' is invalid: {reason}")]
  SourceInvalid { reference: String, reason: String },

  /// The stage exited non-zero. Carries the captured output and, when the
  /// stage sent one, the structured exception payload.
  #[error("stage '{name}' ({id}) failed with exit status {status}")]
  StageFailed {
    name: String,
    id: ObjectId,
    status: String,
    logs: String,
    exception: Option<StageException>,
  },

  /// Mount, clone or spawn failure while building the stage environment.
  /// Infrastructure, not stage, failure.
  #[error("sandbox error for '{id}': {message}")]
  Sandbox { id: ObjectId, message: String },

  /// The filesystem holding the store ran out of space.
  #[error("store is out of space")]
  StorageFull,

  /// The store itself misbehaved (e.g. permission failure during commit).
  #[error("store is corrupt: {0}")]
  StoreCorrupt(String),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("io error: {0}")]
  Io(std::io::Error),
}

impl From<std::io::Error> for Error {
  fn from(e: std::io::Error) -> Self {
    if e.kind() == std::io::ErrorKind::StorageFull {
      Error::StorageFull
    } else {
      Error::Io(e)
    }
  }
}

impl From<osforge_core::Error> for Error {
  fn from(e: osforge_core::Error) -> Self {
    match e {
      osforge_core::Error::Manifest(m) => Error::ManifestInvalid(m),
      osforge_core::Error::Json(e) => Error::Json(e),
      osforge_core::Error::Io(e) => Error::from(e),
      other => Error::ManifestInvalid(other.to_string()),
    }
  }
}
