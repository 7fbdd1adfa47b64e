//! Source blob materialization through fetcher programs.
//!
//! A source is a fetcher executable keyed by type name. For every source
//! type the plan references, the engine computes the set of content hashes
//! not yet present in the store and runs `<libdir>/sources/<type>` with a
//! JSON request on stdin. The fetcher places each blob, named by its hash,
//! into the supplied output directory; the engine verifies every blob
//! against its name before moving it into the store, so a blob's filename
//! always equals the hash of its contents.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::process::Stdio;

use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use osforge_core::ContentHash;

use crate::modules::{ModuleKind, ModuleRegistry};
use crate::plan::SourceRequirement;
use crate::store::Store;
use crate::{Error, Result};

/// The request a fetcher reads from stdin.
#[derive(Debug, Serialize)]
struct SourceRequest<'a> {
  items: BTreeMap<&'a str, &'a Value>,
  options: &'a Value,
  checksums: Vec<&'a str>,
  cache: PathBuf,
  output: PathBuf,
}

/// Fetch every blob the plan requires and install it into the store.
///
/// Blobs already present are not requested again, which is what makes the
/// at-most-once download guarantee hold across runs. Any failure here aborts
/// before a single stage executes.
pub async fn materialize(
  store: &Store,
  registry: &ModuleRegistry,
  options: &BTreeMap<String, Value>,
  requirements: &BTreeMap<String, SourceRequirement>,
) -> Result<()> {
  let no_options = Value::Object(serde_json::Map::new());

  for (source_type, requirement) in requirements {
    let mut missing: Vec<ContentHash> = Vec::new();
    for checksum in &requirement.checksums {
      let hash = ContentHash::parse(checksum)?;
      if !store.source_blob_path(source_type, &hash).is_file() {
        missing.push(hash);
      }
    }

    if missing.is_empty() {
      debug!(source = %source_type, "all blobs present, skipping fetcher");
      continue;
    }

    if !registry.exists(ModuleKind::Source, source_type) {
      return Err(Error::SourceUnavailable {
        source_type: source_type.clone(),
        reason: format!("no fetcher provides {} missing blob(s)", missing.len()),
      });
    }
    let fetcher = registry.find(ModuleKind::Source, source_type)?;

    let output = store.scratch("source-")?;
    let checksums: Vec<String> = missing.iter().map(|h| h.to_string()).collect();
    let request = SourceRequest {
      items: checksums
        .iter()
        .filter_map(|c| requirement.items.get(c).map(|v| (c.as_str(), v)))
        .collect(),
      options: options.get(source_type).unwrap_or(&no_options),
      checksums: checksums.iter().map(String::as_str).collect(),
      cache: store.source_cache_dir(source_type)?,
      output: output.path().to_path_buf(),
    };

    info!(source = %source_type, blobs = missing.len(), "running fetcher");
    run_fetcher(source_type, &fetcher.path, &request).await?;

    store.source_dir(source_type)?;
    for hash in &missing {
      install_blob(store, source_type, hash, output.path().join(hash.to_string()))?;
    }
  }

  Ok(())
}

async fn run_fetcher(source_type: &str, program: &std::path::Path, request: &SourceRequest<'_>) -> Result<()> {
  let body = serde_json::to_vec(request)?;

  // Fetchers run with a scrubbed environment; they get everything they need
  // through the request.
  let mut child = Command::new(program)
    .stdin(Stdio::piped())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .env_clear()
    .env("PATH", "/usr/bin:/bin")
    .spawn()
    .map_err(|e| Error::SourceUnavailable {
      source_type: source_type.to_string(),
      reason: format!("failed to spawn fetcher: {}", e),
    })?;

  if let Some(mut stdin) = child.stdin.take() {
    stdin.write_all(&body).await?;
  }

  let output = child.wait_with_output().await?;
  let stdout = String::from_utf8_lossy(&output.stdout);

  // A failing fetcher reports `{"error": ...}` on stdout and exits non-zero.
  let reply: Value = serde_json::from_str(stdout.trim()).unwrap_or(Value::Null);
  if let Some(error) = reply.get("error").and_then(Value::as_str) {
    return Err(Error::SourceUnavailable {
      source_type: source_type.to_string(),
      reason: error.to_string(),
    });
  }

  if !output.status.success() {
    let stderr = String::from_utf8_lossy(&output.stderr);
    return Err(Error::SourceUnavailable {
      source_type: source_type.to_string(),
      reason: format!("fetcher exited with {}: {}", output.status, stderr.trim()),
    });
  }

  Ok(())
}

/// Verify a fetched blob against its requested hash and move it into the
/// store. The move is atomic; when two engines race for the same blob the
/// loser's copy is simply unlinked with the drop of its scratch directory.
fn install_blob(store: &Store, source_type: &str, hash: &ContentHash, fetched: PathBuf) -> Result<()> {
  if !fetched.is_file() {
    return Err(Error::SourceUnavailable {
      source_type: source_type.to_string(),
      reason: format!("fetcher did not provide '{}'", hash),
    });
  }

  if !hash.verify_file(&fetched)? {
    let _ = fs::remove_file(&fetched);
    return Err(Error::SourceInvalid {
      reference: hash.to_string(),
      reason: "content does not match its checksum".to_string(),
    });
  }

  let target = store.source_blob_path(source_type, hash);
  if target.is_file() {
    let _ = fs::remove_file(&fetched);
    return Ok(());
  }
  fs::rename(&fetched, &target)?;
  debug!(source = %source_type, blob = %hash, "blob installed");
  Ok(())
}
