//! osforge-core: shared types for the osforge pipeline engine.
//!
//! This crate holds everything both sides of the engine need to agree on:
//! content hashes and object identifiers, the canonical JSON form those
//! identifiers are computed over, the manifest data model, and the host API
//! wire protocol spoken between the engine and sandboxed stages.

pub mod canon;
mod error;
pub mod hash;
mod id;
pub mod manifest;
pub mod wire;

pub use error::Error;
pub use hash::{ContentHash, HashAlgorithm};
pub use id::ObjectId;
pub use manifest::{Input, InputOrigin, Manifest, Pipeline, References, Stage};

/// Result type for osforge-core operations.
pub type Result<T> = std::result::Result<T, Error>;
