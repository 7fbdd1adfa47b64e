//! Object identifiers.
//!
//! An object identifier is the SHA-256 of the canonical JSON description of
//! the invocation that produced the object. Identifiers are deterministic:
//! equal invocations hash to the same identifier, which is what makes the
//! store a sound cache.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::{canon, Error, Result};

/// A 256-bit object identifier, rendered as 64 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(String);

impl ObjectId {
  /// Parse an identifier, rejecting anything that is not 64 lowercase hex
  /// characters. Identifiers double as directory names in the store.
  pub fn parse(s: &str) -> Result<Self> {
    if s.len() != 64 || !s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
      return Err(Error::InvalidIdentifier(s.to_string()));
    }
    Ok(ObjectId(s.to_string()))
  }

  /// Identifier of a stage invocation.
  ///
  /// The hashed description covers the stage name, the identifier of the
  /// runtime root (`build`, null for host builds), the identifier of the
  /// upstream object (`base`, null for the first stage of a pipeline), the
  /// stage options in canonical form, and the ordered input identifiers.
  /// The runtime root participates so that replacing a build pipeline
  /// changes every identifier downstream of it.
  pub fn for_stage(
    name: &str,
    build: Option<&ObjectId>,
    base: Option<&ObjectId>,
    options: &Value,
    inputs: &[ObjectId],
  ) -> Result<Self> {
    let description = json!({
      "name": name,
      "build": build.map(|id| id.as_str()),
      "base": base.map(|id| id.as_str()),
      "options": options,
      "inputs": inputs.iter().map(|id| id.as_str()).collect::<Vec<_>>(),
    });
    Self::of_value(&description)
  }

  /// Identifier of a resolved input: its module type, origin, and references
  /// (already ordered, or sorted, by the planner).
  pub fn for_input(input_type: &str, origin: &str, references: &Value) -> Result<Self> {
    let description = json!({
      "type": input_type,
      "origin": origin,
      "references": references,
    });
    Self::of_value(&description)
  }

  /// Hash an arbitrary JSON value in canonical form.
  pub fn of_value(value: &Value) -> Result<Self> {
    let canonical = canon::to_string(value)?;
    let digest = Sha256::digest(canonical.as_bytes());
    Ok(ObjectId(hex::encode(digest)))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for ObjectId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl FromStr for ObjectId {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    ObjectId::parse(s)
  }
}

impl Serialize for ObjectId {
  fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.0)
  }
}

impl<'de> Deserialize<'de> for ObjectId {
  fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    ObjectId::parse(&s).map_err(serde::de::Error::custom)
  }
}
