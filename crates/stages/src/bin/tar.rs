//! `org.osbuild.tar` — assembler archiving the final tree.
//!
//! Options: `filename` (default `tree.tar`). The archive lands in the
//! output directory the engine provides.

use std::fs::File;

use serde_json::{json, Value};

fn main() {
  osforge_stages::run(|client, arguments| {
    let filename = arguments
      .options
      .get("filename")
      .and_then(Value::as_str)
      .unwrap_or("tree.tar");
    let output = arguments.output.as_ref().ok_or("assembler invoked without an output directory")?;

    let path = output.join(filename);
    let file = File::create(&path)?;
    let mut archive = tar::Builder::new(file);
    archive.follow_symlinks(false);
    archive.append_dir_all(".", &arguments.tree)?;
    archive.finish()?;

    let size = std::fs::metadata(&path)?.len();
    client.metadata(json!({"filename": filename, "size": size}))?;
    client.log(&format!("tar: {} ({} bytes)", filename, size))?;
    Ok(())
  })
}
