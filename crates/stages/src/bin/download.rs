//! `org.osbuild.files` — source fetcher for plain file downloads.
//!
//! Reads the engine's request from stdin, downloads every requested
//! checksum from `options.urls`, verifies the content, and places the blob
//! under its hash in the output directory. Verified downloads are kept in
//! the per-type cache so a re-run does not hit the network again.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::exit;

use serde::Deserialize;
use serde_json::{json, Value};

use osforge_core::ContentHash;

#[derive(Debug, Deserialize)]
struct FetchRequest {
  #[serde(default)]
  items: BTreeMap<String, Value>,
  #[serde(default)]
  options: Value,
  checksums: Vec<String>,
  cache: PathBuf,
  output: PathBuf,
}

fn main() {
  let mut body = String::new();
  if let Err(e) = std::io::stdin().read_to_string(&mut body) {
    fail(&format!("cannot read request: {}", e));
  }
  let request: FetchRequest = match serde_json::from_str(&body) {
    Ok(request) => request,
    Err(e) => fail(&format!("bad request: {}", e)),
  };

  match fetch_all(&request) {
    Ok(()) => println!("{}", json!({})),
    Err(e) => fail(&e),
  }
}

fn fail(message: &str) -> ! {
  println!("{}", json!({"error": message}));
  exit(1)
}

fn fetch_all(request: &FetchRequest) -> Result<(), String> {
  fs::create_dir_all(&request.cache).map_err(|e| e.to_string())?;

  for checksum in &request.checksums {
    let hash = ContentHash::parse(checksum).map_err(|e| e.to_string())?;
    let target = request.output.join(checksum);
    let cached = request.cache.join(checksum);

    if !cached.is_file() || !verifies(&hash, &cached) {
      let url = url_for(request, checksum)?;
      let bytes = fetch_url(&url)?;

      let digest = hash.algorithm().digest_bytes(&bytes);
      if digest != hash.digest() {
        return Err(format!("'{}' from {} hashes to {}", checksum, url, digest));
      }

      let partial = request.cache.join(format!("{}.part", checksum));
      fs::write(&partial, &bytes).map_err(|e| e.to_string())?;
      fs::rename(&partial, &cached).map_err(|e| e.to_string())?;
    }

    if fs::hard_link(&cached, &target).is_err() {
      fs::copy(&cached, &target).map_err(|e| e.to_string())?;
    }
  }

  Ok(())
}

fn verifies(hash: &ContentHash, path: &Path) -> bool {
  hash.verify_file(path).unwrap_or(false)
}

/// The URL for a checksum: per-reference metadata (`files.url`) wins over
/// the source-wide `urls` table.
fn url_for(request: &FetchRequest, checksum: &str) -> Result<String, String> {
  if let Some(url) = request
    .items
    .get(checksum)
    .and_then(|item| item.get("files.url"))
    .and_then(Value::as_str)
  {
    return Ok(url.to_string());
  }
  request
    .options
    .get("urls")
    .and_then(|urls| urls.get(checksum))
    .and_then(Value::as_str)
    .map(str::to_string)
    .ok_or_else(|| format!("no url known for '{}'", checksum))
}

fn fetch_url(url: &str) -> Result<Vec<u8>, String> {
  if let Some(path) = url.strip_prefix("file://") {
    return fs::read(path).map_err(|e| format!("{}: {}", url, e));
  }

  let response = reqwest::blocking::get(url).map_err(|e| format!("{}: {}", url, e))?;
  if !response.status().is_success() {
    return Err(format!("{}: http status {}", url, response.status()));
  }
  response.bytes().map(|b| b.to_vec()).map_err(|e| format!("{}: {}", url, e))
}
