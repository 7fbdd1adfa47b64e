//! The module library: stage, assembler, source and runner programs.
//!
//! Modules are external executables dispatched by name, living under the
//! library directory:
//!
//! ```text
//! <libdir>/
//! ├── stages/<name>        # tree-mutating programs
//! ├── assemblers/<name>    # artifact-producing programs
//! ├── sources/<name>       # blob fetchers
//! └── runners/<name>       # per-distribution execution wrappers
//! ```
//!
//! Next to each program may sit `<name>.meta.json`, loaded as plain data at
//! planning time: a human summary, the option keys the program requires,
//! and which of its inputs are order-sensitive.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// Default library directory on an installed system.
pub const DEFAULT_LIBDIR: &str = "/usr/lib/osbuild";

/// The kinds of programs the library holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
  Stage,
  Assembler,
  Source,
  Runner,
}

impl ModuleKind {
  pub fn directory(self) -> &'static str {
    match self {
      ModuleKind::Stage => "stages",
      ModuleKind::Assembler => "assemblers",
      ModuleKind::Source => "sources",
      ModuleKind::Runner => "runners",
    }
  }

  fn label(self) -> &'static str {
    match self {
      ModuleKind::Stage => "stage",
      ModuleKind::Assembler => "assembler",
      ModuleKind::Source => "source",
      ModuleKind::Runner => "runner",
    }
  }
}

/// Metadata sitting next to a module program.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleMeta {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub summary: Option<String>,

  /// Option keys the module requires to be present.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub required_options: Vec<String>,

  /// Per-input declarations.
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub inputs: BTreeMap<String, InputMeta>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputMeta {
  /// Whether the order of this input's references is significant for the
  /// invocation's identifier.
  #[serde(default)]
  pub ordered: bool,
}

/// A resolved module: its executable and its metadata.
#[derive(Debug, Clone)]
pub struct ModuleInfo {
  pub kind: ModuleKind,
  pub name: String,
  pub path: PathBuf,
  pub meta: ModuleMeta,
}

impl ModuleInfo {
  /// Check `options` against the module's required keys.
  pub fn check_options(&self, options: &Value) -> Result<()> {
    for key in &self.meta.required_options {
      if options.get(key).is_none() {
        return Err(Error::ManifestInvalid(format!(
          "{} '{}': missing required option '{}'",
          self.kind.label(),
          self.name,
          key
        )));
      }
    }
    Ok(())
  }

  /// Whether the named input's reference order is significant.
  pub fn input_ordered(&self, input: &str) -> bool {
    self.meta.inputs.get(input).map(|m| m.ordered).unwrap_or(false)
  }

  /// Path of the module relative to the library root, used to resolve the
  /// program inside a runtime root that carries its own library.
  pub fn relative_path(&self) -> PathBuf {
    Path::new(self.kind.directory()).join(&self.name)
  }
}

/// Resolves module names against a library directory.
#[derive(Debug, Clone)]
pub struct ModuleRegistry {
  libdir: PathBuf,
}

impl ModuleRegistry {
  pub fn new(libdir: impl Into<PathBuf>) -> Self {
    ModuleRegistry { libdir: libdir.into() }
  }

  pub fn libdir(&self) -> &Path {
    &self.libdir
  }

  /// Look a module up by kind and name. Unknown names are a manifest error:
  /// the manifest asked for a program this library does not provide.
  pub fn find(&self, kind: ModuleKind, name: &str) -> Result<ModuleInfo> {
    if name.is_empty() || name.contains('/') || name.starts_with('.') {
      return Err(Error::ManifestInvalid(format!("invalid {} name '{}'", kind.label(), name)));
    }

    let path = self.libdir.join(kind.directory()).join(name);
    if !path.is_file() {
      return Err(Error::ManifestInvalid(format!("unknown {} '{}'", kind.label(), name)));
    }

    let meta = self.load_meta(&path)?;
    Ok(ModuleInfo {
      kind,
      name: name.to_string(),
      path,
      meta,
    })
  }

  /// Whether a module of the given kind exists without resolving it fully.
  pub fn exists(&self, kind: ModuleKind, name: &str) -> bool {
    self.find(kind, name).is_ok()
  }

  /// Resolve a module for a pipeline that runs inside a built tree. Such
  /// modules load from the tree's own library at execution time, so the
  /// host library cannot be authoritative: when it carries the module we
  /// use its metadata, otherwise we fall back to defaults.
  pub fn resolve(&self, kind: ModuleKind, name: &str, in_tree: bool) -> Result<ModuleInfo> {
    if !in_tree {
      return self.find(kind, name);
    }
    if name.is_empty() || name.contains('/') || name.starts_with('.') {
      return Err(Error::ManifestInvalid(format!("invalid {} name '{}'", kind.label(), name)));
    }
    match self.find(kind, name) {
      Ok(info) => Ok(info),
      Err(_) => Ok(ModuleInfo {
        kind,
        name: name.to_string(),
        path: self.libdir.join(kind.directory()).join(name),
        meta: ModuleMeta::default(),
      }),
    }
  }

  fn load_meta(&self, program: &Path) -> Result<ModuleMeta> {
    let meta_path = program.with_file_name(format!(
      "{}.meta.json",
      program.file_name().unwrap_or_default().to_string_lossy()
    ));
    if !meta_path.is_file() {
      return Ok(ModuleMeta::default());
    }
    let contents = fs::read_to_string(&meta_path)?;
    serde_json::from_str(&contents)
      .map_err(|e| Error::ManifestInvalid(format!("bad module metadata {}: {}", meta_path.display(), e)))
  }
}

/// Detect the runner matching the host distribution, e.g.
/// `org.osbuild.fedora38`, by reading `/etc/os-release`. Falls back to the
/// generic linux runner when the host cannot be identified.
pub fn detect_host_runner() -> String {
  match fs::read_to_string("/etc/os-release") {
    Ok(contents) => runner_from_os_release(&contents),
    Err(_) => "org.osbuild.linux".to_string(),
  }
}

fn runner_from_os_release(contents: &str) -> String {
  let mut id = None;
  let mut version_id = None;
  for line in contents.lines() {
    let Some((key, value)) = line.split_once('=') else { continue };
    let value = value.trim().trim_matches('"');
    match key.trim() {
      "ID" => id = Some(value.to_string()),
      "VERSION_ID" => version_id = Some(value.to_string()),
      _ => {}
    }
  }
  match id {
    Some(id) => format!("org.osbuild.{}{}", id, version_id.unwrap_or_default()),
    None => "org.osbuild.linux".to_string(),
  }
}
