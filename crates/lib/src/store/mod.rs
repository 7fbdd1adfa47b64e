//! The content-addressed object store.
//!
//! Layout:
//! ```text
//! <root>/
//! ├── objects/<id>/          # Committed, immutable trees
//! ├── refs/<name>            # Human-readable pointers to object ids
//! ├── sources/<type>/<hash>  # Source blobs, named by content hash
//! ├── cache/<type>/          # Persistent per-fetcher working state
//! └── tmp/                   # Staged trees, snapshots, scratch space
//! ```
//!
//! Objects are born *staged* (writable, under `tmp/`, excluded from the
//! cache) and become *committed* (read-only, under `objects/`) when their
//! stage succeeds. Everything under `tmp/` is drop-guarded: a staged tree
//! that is not committed within its stage's lifetime is removed.

pub mod clone;
mod lock;

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tempfile::TempDir;
use tracing::{debug, info, warn};

use osforge_core::{ContentHash, ObjectId};

use crate::{Error, Result};
pub use clone::CloneStrategy;
pub use lock::LockGuard;

const OBJECTS_DIR: &str = "objects";
const REFS_DIR: &str = "refs";
const SOURCES_DIR: &str = "sources";
const CACHE_DIR: &str = "cache";
const TMP_DIR: &str = "tmp";
const LOCK_FILE: &str = ".lock";

/// Handle to a store rooted at a directory.
#[derive(Debug)]
pub struct Store {
  root: PathBuf,
  clone_strategy: OnceLock<CloneStrategy>,
}

/// A writable tree under `tmp/`, waiting to be committed. Removed on drop
/// unless [`Store::commit`] consumes it first.
#[derive(Debug)]
pub struct StagedTree {
  dir: TempDir,
}

impl StagedTree {
  pub fn path(&self) -> &Path {
    self.dir.path()
  }
}

/// A writable clone of a committed object, rooted under `tmp/`. Lifetime is
/// the caller's: the clone is removed when the handle drops.
#[derive(Debug)]
pub struct Snapshot {
  dir: TempDir,
}

impl Snapshot {
  pub fn path(&self) -> &Path {
    self.dir.path()
  }
}

impl Store {
  /// Open (and if needed initialize) a store at `root`.
  pub fn new(root: impl Into<PathBuf>) -> Result<Store> {
    let root = root.into();
    for dir in [OBJECTS_DIR, REFS_DIR, SOURCES_DIR, CACHE_DIR, TMP_DIR] {
      fs::create_dir_all(root.join(dir))?;
    }
    debug!(root = %root.display(), "store ready");
    Ok(Store {
      root,
      clone_strategy: OnceLock::new(),
    })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn objects_dir(&self) -> PathBuf {
    self.root.join(OBJECTS_DIR)
  }

  fn tmp_dir(&self) -> PathBuf {
    self.root.join(TMP_DIR)
  }

  /// Path a committed object lives at. The object need not exist.
  pub fn object_path(&self, id: &ObjectId) -> PathBuf {
    self.objects_dir().join(id.as_str())
  }

  /// Cache lookup: is the object for `id` committed?
  pub fn contains(&self, id: &ObjectId) -> bool {
    self.object_path(id).is_dir()
  }

  /// Allocate an empty staged tree.
  pub fn stage(&self) -> Result<StagedTree> {
    let tmp = self.tmp_dir();
    let _lock = lock::exclusive(&tmp.join(LOCK_FILE))?;
    let dir = tempfile::Builder::new().prefix("stage-").tempdir_in(&tmp)?;
    fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o755))?;
    Ok(StagedTree { dir })
  }

  /// Allocate a staged tree pre-populated with the contents of `base`.
  pub fn stage_from(&self, base: Option<&ObjectId>) -> Result<StagedTree> {
    let staged = self.stage()?;
    if let Some(base) = base {
      let strategy = self.clone_strategy()?;
      clone::clone_tree(&self.object_path(base), staged.path(), strategy)?;
    }
    Ok(staged)
  }

  /// Commit a staged tree under `id`, making it read-only. Idempotent on
  /// identifier collision: the existing object wins and the fresh copy is
  /// discarded, which is sound because equal identifiers imply equal trees.
  pub fn commit(&self, staged: StagedTree, id: &ObjectId) -> Result<PathBuf> {
    let _lock = lock::exclusive(&self.objects_dir().join(LOCK_FILE))?;

    let target = self.object_path(id);
    if target.exists() {
      debug!(id = %id, "object already committed, discarding staged copy");
      drop(staged);
      return Ok(target);
    }

    let path = staged.dir.keep();
    if let Err(e) = fs::rename(&path, &target) {
      let _ = fs::remove_dir_all(&path);
      return Err(commit_error(e));
    }

    let mut perms = fs::metadata(&target)?.permissions();
    perms.set_mode(0o555);
    fs::set_permissions(&target, perms).map_err(commit_error)?;

    info!(id = %id, "object committed");
    Ok(target)
  }

  /// Produce a writable clone of a committed object under `tmp/`.
  pub fn snapshot(&self, id: &ObjectId) -> Result<Snapshot> {
    if !self.contains(id) {
      return Err(Error::StoreCorrupt(format!("object '{}' is not in the store", id)));
    }
    let strategy = self.clone_strategy()?;
    let tmp = self.tmp_dir();
    let dir = {
      let _lock = lock::exclusive(&tmp.join(LOCK_FILE))?;
      tempfile::Builder::new().prefix("snapshot-").tempdir_in(&tmp)?
    };
    fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o755))?;
    clone::clone_tree(&self.object_path(id), dir.path(), strategy)?;
    Ok(Snapshot { dir })
  }

  /// A caller-owned scratch directory under `tmp/`. Removed when the handle
  /// drops, so failures never leave debris behind.
  pub fn scratch(&self, prefix: &str) -> Result<TempDir> {
    let tmp = self.tmp_dir();
    let _lock = lock::exclusive(&tmp.join(LOCK_FILE))?;
    Ok(tempfile::Builder::new().prefix(prefix).tempdir_in(&tmp)?)
  }

  /// Blob directory for a source type, created on first use.
  pub fn source_dir(&self, source_type: &str) -> Result<PathBuf> {
    let dir = self.root.join(SOURCES_DIR).join(source_type);
    fs::create_dir_all(&dir)?;
    Ok(dir)
  }

  /// Persistent per-type working directory for a fetcher.
  pub fn source_cache_dir(&self, source_type: &str) -> Result<PathBuf> {
    let dir = self.root.join(CACHE_DIR).join(source_type);
    fs::create_dir_all(&dir)?;
    Ok(dir)
  }

  /// Path of a blob in the source store. The blob need not exist.
  pub fn source_blob_path(&self, source_type: &str, hash: &ContentHash) -> PathBuf {
    self.root.join(SOURCES_DIR).join(source_type).join(hash.to_string())
  }

  /// Write a human-readable pointer `refs/<name>` to an object id.
  pub fn write_ref(&self, name: &str, id: &ObjectId) -> Result<()> {
    validate_ref_name(name)?;
    let refs = self.root.join(REFS_DIR);
    let tmp = refs.join(format!("{}.tmp", name));
    fs::write(&tmp, format!("{}\n", id))?;
    fs::rename(&tmp, refs.join(name))?;
    Ok(())
  }

  /// Resolve a pointer written by [`Store::write_ref`].
  pub fn read_ref(&self, name: &str) -> Result<ObjectId> {
    validate_ref_name(name)?;
    let contents = fs::read_to_string(self.root.join(REFS_DIR).join(name))?;
    Ok(ObjectId::parse(contents.trim())?)
  }

  /// Remove committed objects that are neither in `keep` nor pointed to by
  /// a ref. Returns the number of objects removed.
  pub fn prune(&self, keep: &BTreeSet<ObjectId>) -> Result<usize> {
    let _lock = lock::exclusive(&self.objects_dir().join(LOCK_FILE))?;

    let mut roots = keep.clone();
    let refs = self.root.join(REFS_DIR);
    if refs.is_dir() {
      for entry in fs::read_dir(&refs)? {
        let entry = entry?;
        if let Ok(contents) = fs::read_to_string(entry.path()) {
          if let Ok(id) = ObjectId::parse(contents.trim()) {
            roots.insert(id);
          }
        }
      }
    }

    let mut removed = 0;
    for entry in fs::read_dir(self.objects_dir())? {
      let entry = entry?;
      if !entry.file_type()?.is_dir() {
        continue;
      }
      let name = entry.file_name();
      let Ok(id) = ObjectId::parse(&name.to_string_lossy()) else {
        warn!(entry = %name.to_string_lossy(), "skipping foreign entry in objects/");
        continue;
      };
      if roots.contains(&id) {
        continue;
      }
      fs::set_permissions(entry.path(), fs::Permissions::from_mode(0o755))?;
      fs::remove_dir_all(entry.path())?;
      removed += 1;
      debug!(id = %id, "pruned object");
    }

    Ok(removed)
  }

  /// The clone strategy for this store's filesystem, probed once and cached.
  pub fn clone_strategy(&self) -> Result<CloneStrategy> {
    if let Some(strategy) = self.clone_strategy.get() {
      return Ok(*strategy);
    }
    let strategy = clone::detect(&self.tmp_dir())?;
    Ok(*self.clone_strategy.get_or_init(|| strategy))
  }
}

fn commit_error(e: io::Error) -> Error {
  match e.kind() {
    io::ErrorKind::PermissionDenied => Error::StoreCorrupt(e.to_string()),
    _ => Error::from(e),
  }
}

fn validate_ref_name(name: &str) -> Result<()> {
  let ok = !name.is_empty()
    && !name.starts_with('.')
    && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-' || b == b'_');
  if ok {
    Ok(())
  } else {
    Err(Error::StoreCorrupt(format!("invalid ref name '{}'", name)))
  }
}
