//! `org.osbuild.copy` — copy input files into the tree.
//!
//! Options:
//! - `paths`: list of `{from, to, mode?}` entries, where `from` is a
//!   reference in an input and `to` an absolute path inside the tree.
//! - `input`: input name the references come from (default `files`).
//!
//! Without `paths`, every file of every input is copied into the tree root
//! under its reference name.

use std::fs;
use std::os::unix::fs::PermissionsExt;

use serde_json::Value;

use osforge_stages::{require_str, tree_path};

fn main() {
  osforge_stages::run(|client, arguments| {
    let mut copied = 0usize;

    if let Some(paths) = arguments.options.get("paths").and_then(Value::as_array) {
      let input_name = arguments.options.get("input").and_then(Value::as_str).unwrap_or("files");
      let input = arguments
        .inputs
        .get(input_name)
        .ok_or_else(|| format!("no input named '{}'", input_name))?;

      for entry in paths {
        let from = require_str(entry, "from")?;
        let to = require_str(entry, "to")?;
        let dest = tree_path(&arguments.tree, to);
        if let Some(parent) = dest.parent() {
          fs::create_dir_all(parent)?;
        }
        if dest.exists() {
          fs::remove_file(&dest)?;
        }
        fs::copy(input.path.join(from), &dest)?;
        if let Some(mode) = entry.get("mode").and_then(Value::as_u64) {
          fs::set_permissions(&dest, fs::Permissions::from_mode(mode as u32))?;
        }
        copied += 1;
      }
    } else {
      for input in arguments.inputs.values() {
        for entry in fs::read_dir(&input.path)? {
          let entry = entry?;
          if entry.file_type()?.is_file() {
            let dest = arguments.tree.join(entry.file_name());
            if dest.exists() {
              fs::remove_file(&dest)?;
            }
            fs::copy(entry.path(), &dest)?;
            copied += 1;
          }
        }
      }
    }

    client.log(&format!("copy: {} file(s)", copied))?;
    Ok(())
  })
}
