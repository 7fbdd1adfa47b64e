//! `org.osbuild.append` — append text to a file in the tree.
//!
//! Options: `path` (absolute within the tree), `text`.

use std::fs;

use osforge_stages::{require_str, tree_path};

fn main() {
  osforge_stages::run(|client, arguments| {
    let path = require_str(&arguments.options, "path")?;
    let text = require_str(&arguments.options, "text")?;

    let dest = tree_path(&arguments.tree, path);
    if let Some(parent) = dest.parent() {
      fs::create_dir_all(parent)?;
    }

    // Unlink-then-rewrite, never append in place: the tree may be a
    // hardlink clone sharing inodes with committed objects.
    let mut contents = match fs::read_to_string(&dest) {
      Ok(contents) => contents,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
      Err(e) => return Err(e.into()),
    };
    contents.push_str(text);
    if dest.exists() {
      fs::remove_file(&dest)?;
    }
    fs::write(&dest, &contents)?;

    client.log(&format!("append: {} += {} bytes", path, text.len()))?;
    Ok(())
  })
}
