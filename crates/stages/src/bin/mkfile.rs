//! `org.osbuild.mkfile` — write a file into the tree.
//!
//! Options: `path` (absolute within the tree), `contents` (default empty),
//! `mode` (optional integer).

use std::fs;
use std::os::unix::fs::PermissionsExt;

use serde_json::Value;

use osforge_stages::{require_str, tree_path};

fn main() {
  osforge_stages::run(|client, arguments| {
    let path = require_str(&arguments.options, "path")?;
    let contents = arguments.options.get("contents").and_then(Value::as_str).unwrap_or("");

    let dest = tree_path(&arguments.tree, path);
    if let Some(parent) = dest.parent() {
      fs::create_dir_all(parent)?;
    }
    // Unlink first: the tree may be a hardlink clone, so rewriting a file
    // in place would reach through to the committed object.
    if dest.exists() {
      fs::remove_file(&dest)?;
    }
    fs::write(&dest, contents)?;

    if let Some(mode) = arguments.options.get("mode").and_then(Value::as_u64) {
      fs::set_permissions(&dest, fs::Permissions::from_mode(mode as u32))?;
    }

    client.log(&format!("mkfile: wrote {} ({} bytes)", path, contents.len()))?;
    Ok(())
  })
}
