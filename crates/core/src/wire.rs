//! Host API wire protocol.
//!
//! Stages talk to the engine over a unix socket using length-prefixed JSON
//! messages: a 4-byte big-endian length followed by one JSON document. The
//! exchange is strictly request/response, one outstanding request at a time.
//!
//! The message types live here so the engine's server and the stage-side
//! client cannot drift apart.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Upper bound on a single message, to keep a misbehaving peer from forcing
/// unbounded allocation. Metadata payloads are far below this.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Requests a stage may send to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Request {
  /// Ask for the stage's parameters. Idempotent; normally called once.
  #[serde(rename = "arguments")]
  Arguments,

  /// Allocate a scratch directory inside the stage's temp root.
  #[serde(rename = "store.mkdtemp")]
  Mkdtemp { prefix: String },

  /// Resolve the blob directory for a source type.
  #[serde(rename = "store.source")]
  Source {
    #[serde(rename = "type")]
    source_type: String,
  },

  /// Attach structured metadata to the object this stage produces.
  #[serde(rename = "metadata")]
  Metadata { metadata: Value },

  /// Forward a log line to the engine.
  #[serde(rename = "log")]
  Log { text: String },

  /// Report a structured failure; the stage exits non-zero afterwards.
  #[serde(rename = "exception")]
  Exception {
    #[serde(rename = "exception_kind")]
    kind: String,
    message: String,
  },
}

/// Responses the engine sends back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Response {
  #[serde(rename = "arguments")]
  Arguments(StageArguments),

  #[serde(rename = "path")]
  Path { path: PathBuf },

  #[serde(rename = "ok")]
  Ok,

  /// Error reply; the connection stays open.
  #[serde(rename = "error")]
  Error { message: String },
}

/// The argument envelope delivered for `arguments`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StageArguments {
  /// The tree the stage is expected to modify.
  pub tree: PathBuf,

  /// Materialized inputs by declared name.
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub inputs: BTreeMap<String, InputArgument>,

  pub options: Value,

  pub meta: StageMeta,

  /// Artifact directory, present only for assembler invocations.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub output: Option<PathBuf>,
}

/// One materialized input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputArgument {
  /// Directory containing the referenced files, read-only.
  pub path: PathBuf,

  /// References in keyed form: `{reference: metadata-or-null}`.
  pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StageMeta {
  /// The invocation's object identifier.
  pub id: String,
}

/// Write one length-prefixed message.
pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> io::Result<()> {
  let body = serde_json::to_vec(message).map_err(io::Error::other)?;
  if body.len() > MAX_MESSAGE_SIZE {
    return Err(io::Error::new(
      io::ErrorKind::InvalidInput,
      format!("message of {} bytes exceeds limit", body.len()),
    ));
  }
  writer.write_all(&(body.len() as u32).to_be_bytes())?;
  writer.write_all(&body)?;
  writer.flush()
}

/// Read one length-prefixed message. Returns `None` on clean end-of-stream
/// (peer closed the connection between messages).
pub fn read_message<R: Read>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
  let mut header = [0u8; 4];
  if let Err(e) = reader.read_exact(&mut header) {
    if e.kind() == io::ErrorKind::UnexpectedEof {
      return Ok(None);
    }
    return Err(e);
  }

  let len = u32::from_be_bytes(header) as usize;
  if len > MAX_MESSAGE_SIZE {
    return Err(io::Error::new(
      io::ErrorKind::InvalidData,
      format!("message of {} bytes exceeds limit", len),
    ));
  }

  let mut body = vec![0u8; len];
  reader.read_exact(&mut body)?;
  Ok(Some(body))
}

/// Decode a message body into a typed value.
pub fn decode<T: DeserializeOwned>(body: &[u8]) -> serde_json::Result<T> {
  serde_json::from_slice(body)
}

/// Extract the `kind` tag from a message body, typed or not. Used to answer
/// unknown message kinds without dropping the connection.
pub fn kind_of(body: &[u8]) -> Option<String> {
  let value: Value = serde_json::from_slice(body).ok()?;
  value.get("kind")?.as_str().map(str::to_string)
}
