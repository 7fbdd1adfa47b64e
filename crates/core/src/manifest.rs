//! Manifest data model.
//!
//! A manifest describes a tree of pipelines plus the source options the
//! fetchers need. This module only covers structure: existence of the named
//! stage and source programs is checked by the planner against the module
//! library, not here.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ContentHash, Error, ObjectId, Result};

/// Top-level manifest: the root pipeline and per-source-type options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
  pub pipeline: Pipeline,

  /// Options per source type, handed verbatim to the fetcher program.
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub sources: BTreeMap<String, Value>,
}

/// A pipeline: an optional build pipeline providing the runtime root, an
/// ordered stage sequence, and an optional terminal assembler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pipeline {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub build: Option<Box<Pipeline>>,

  /// Runner program wrapping stage execution inside the runtime root.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub runner: Option<String>,

  #[serde(default)]
  pub stages: Vec<Stage>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub assembler: Option<Stage>,
}

/// A single stage (or assembler) invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
  pub name: String,

  #[serde(default = "empty_object", skip_serializing_if = "Value::is_null")]
  pub options: Value,

  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub inputs: BTreeMap<String, Input>,
}

fn empty_object() -> Value {
  Value::Object(serde_json::Map::new())
}

/// Where an input's references come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputOrigin {
  /// References are content hashes of blobs in the source store.
  #[serde(rename = "org.osbuild.source")]
  Source,
  /// References are identifiers of committed objects.
  #[serde(rename = "org.osbuild.pipeline")]
  Pipeline,
}

impl InputOrigin {
  pub fn name(self) -> &'static str {
    match self {
      InputOrigin::Source => "org.osbuild.source",
      InputOrigin::Pipeline => "org.osbuild.pipeline",
    }
  }
}

/// A declared stage input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Input {
  #[serde(rename = "type")]
  pub input_type: String,

  pub origin: InputOrigin,

  #[serde(default)]
  pub references: References,
}

/// Input references: either an ordered array of reference strings, or a map
/// keyed by reference carrying per-reference metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum References {
  Ordered(Vec<String>),
  Keyed(BTreeMap<String, RefEntry>),
}

/// Per-reference payload in the keyed form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefEntry {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub metadata: Option<Value>,
}

impl Default for References {
  fn default() -> Self {
    References::Ordered(Vec::new())
  }
}

impl References {
  /// Reference strings in manifest order (keyed references iterate in
  /// sorted key order, which is why the keyed form is inherently unordered).
  pub fn strings(&self) -> Vec<&str> {
    match self {
      References::Ordered(refs) => refs.iter().map(String::as_str).collect(),
      References::Keyed(map) => map.keys().map(String::as_str).collect(),
    }
  }

  pub fn is_empty(&self) -> bool {
    match self {
      References::Ordered(refs) => refs.is_empty(),
      References::Keyed(map) => map.is_empty(),
    }
  }

  pub fn len(&self) -> usize {
    match self {
      References::Ordered(refs) => refs.len(),
      References::Keyed(map) => map.len(),
    }
  }

  /// Normalize to the keyed JSON form (`{reference: metadata-or-null}`),
  /// which is what stages receive as the input's `data`.
  pub fn to_keyed_value(&self) -> Value {
    let mut map = serde_json::Map::new();
    match self {
      References::Ordered(refs) => {
        for r in refs {
          map.insert(r.clone(), Value::Null);
        }
      }
      References::Keyed(keyed) => {
        for (r, entry) in keyed {
          map.insert(r.clone(), entry.metadata.clone().unwrap_or(Value::Null));
        }
      }
    }
    Value::Object(map)
  }

  /// The JSON value hashed into the input identifier. Ordered inputs keep
  /// the array as written; unordered inputs sort it, so that swapping two
  /// references only changes the identifier when order is significant.
  pub fn to_id_value(&self, ordered: bool) -> Value {
    match self {
      References::Ordered(refs) => {
        let mut refs: Vec<&str> = refs.iter().map(String::as_str).collect();
        if !ordered {
          refs.sort_unstable();
        }
        Value::Array(refs.into_iter().map(|r| Value::String(r.to_string())).collect())
      }
      References::Keyed(_) => self.to_keyed_value(),
    }
  }
}

impl Manifest {
  /// Load and validate a manifest from a JSON file.
  pub fn load(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)?;
    let manifest: Manifest =
      serde_json::from_str(&contents).map_err(|e| Error::Manifest(format!("{}: {}", path.display(), e)))?;
    manifest.validate()?;
    Ok(manifest)
  }

  /// Build a manifest from an in-memory JSON value and validate it.
  pub fn from_value(value: Value) -> Result<Self> {
    let manifest: Manifest = serde_json::from_value(value).map_err(|e| Error::Manifest(e.to_string()))?;
    manifest.validate()?;
    Ok(manifest)
  }

  /// Structural validation: non-empty pipelines, well-formed references, and
  /// well-formed per-reference metadata keys.
  pub fn validate(&self) -> Result<()> {
    validate_pipeline(&self.pipeline)
  }
}

impl Pipeline {
  /// The build chain in execution order: deepest build pipeline first, this
  /// pipeline last. The chain is finite by construction because build
  /// pipelines nest as JSON values.
  pub fn chain(&self) -> Vec<&Pipeline> {
    let mut chain = Vec::new();
    let mut current = self;
    loop {
      chain.push(current);
      match &current.build {
        Some(build) => current = build,
        None => break,
      }
    }
    chain.reverse();
    chain
  }

  /// Stages followed by the assembler, in execution order.
  pub fn members(&self) -> impl Iterator<Item = &Stage> {
    self.stages.iter().chain(self.assembler.iter())
  }
}

fn validate_pipeline(pipeline: &Pipeline) -> Result<()> {
  if let Some(build) = &pipeline.build {
    validate_pipeline(build)?;
  }

  if pipeline.stages.is_empty() {
    return Err(Error::Manifest("pipeline must contain at least one stage".to_string()));
  }

  for stage in pipeline.members() {
    if stage.name.is_empty() {
      return Err(Error::Manifest("stage name must not be empty".to_string()));
    }
    if !stage.options.is_object() {
      return Err(Error::Manifest(format!("stage '{}': options must be an object", stage.name)));
    }
    for (input_name, input) in &stage.inputs {
      validate_input(&stage.name, input_name, input)?;
    }
  }

  Ok(())
}

fn validate_input(stage: &str, name: &str, input: &Input) -> Result<()> {
  for reference in input.references.strings() {
    match input.origin {
      InputOrigin::Source => {
        ContentHash::parse(reference).map_err(|e| {
          Error::Manifest(format!("stage '{}', input '{}': bad source reference: {}", stage, name, e))
        })?;
      }
      InputOrigin::Pipeline => {
        ObjectId::parse(reference).map_err(|e| {
          Error::Manifest(format!("stage '{}', input '{}': bad pipeline reference: {}", stage, name, e))
        })?;
      }
    }
  }

  if let References::Keyed(map) = &input.references {
    for (reference, entry) in map {
      let Some(metadata) = &entry.metadata else { continue };
      let Value::Object(fields) = metadata else {
        return Err(Error::Manifest(format!(
          "stage '{}', input '{}', reference '{}': metadata must be an object",
          stage, name, reference
        )));
      };
      for key in fields.keys() {
        if !is_metadata_key(key) {
          return Err(Error::Manifest(format!(
            "stage '{}', input '{}', reference '{}': bad metadata key '{}'",
            stage, name, reference, key
          )));
        }
      }
    }
  }

  Ok(())
}

/// Metadata keys are namespaced `word.word` pairs, e.g. `rpm.check_gpg`.
fn is_metadata_key(key: &str) -> bool {
  let Some((prefix, suffix)) = key.split_once('.') else {
    return false;
  };
  let word = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_');
  word(prefix) && word(suffix)
}
