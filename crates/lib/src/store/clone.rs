//! Tree cloning for snapshots.
//!
//! Snapshots prefer `FICLONE`-style reflinks, fall back to recursive
//! hardlinks, and finally to a deep copy. The capability is probed once per
//! store and cached on the store handle. Hardlink clones are valid because
//! stages by contract replace files with unlink-then-rewrite rather than
//! modifying them in place.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;

use tracing::debug;

/// How files are cloned on this store's filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneStrategy {
  Reflink,
  Hardlink,
  Copy,
}

impl CloneStrategy {
  pub fn name(self) -> &'static str {
    match self {
      CloneStrategy::Reflink => "reflink",
      CloneStrategy::Hardlink => "hardlink",
      CloneStrategy::Copy => "copy",
    }
  }
}

/// Probe which clone strategy the filesystem under `dir` supports.
///
/// The probe creates two scratch files in `dir` and attempts a reflink and a
/// hardlink in turn; the scratch files are removed before returning.
pub fn detect(dir: &Path) -> io::Result<CloneStrategy> {
  let src = dir.join(".clone-probe-src");
  let dst = dir.join(".clone-probe-dst");
  let _ = fs::remove_file(&src);
  let _ = fs::remove_file(&dst);
  fs::write(&src, b"probe")?;

  let strategy = if reflink(&src, &dst).is_ok() {
    CloneStrategy::Reflink
  } else if fs::hard_link(&src, &dst).is_ok() {
    CloneStrategy::Hardlink
  } else {
    CloneStrategy::Copy
  };

  let _ = fs::remove_file(&src);
  let _ = fs::remove_file(&dst);

  debug!(strategy = strategy.name(), dir = %dir.display(), "detected clone strategy");
  Ok(strategy)
}

/// Clone the contents of the directory `src` into the existing directory
/// `dst` using the given strategy. Symlinks are recreated, directory and
/// file modes are preserved.
pub fn clone_tree(src: &Path, dst: &Path, strategy: CloneStrategy) -> io::Result<()> {
  for entry in fs::read_dir(src)? {
    let entry = entry?;
    let file_type = entry.file_type()?;
    let from = entry.path();
    let to = dst.join(entry.file_name());

    if file_type.is_dir() {
      fs::create_dir(&to)?;
      fs::set_permissions(&to, entry.metadata()?.permissions())?;
      clone_tree(&from, &to, strategy)?;
    } else if file_type.is_symlink() {
      let target = fs::read_link(&from)?;
      std::os::unix::fs::symlink(&target, &to)?;
    } else {
      clone_file(&from, &to, strategy)?;
    }
  }
  Ok(())
}

fn clone_file(from: &Path, to: &Path, strategy: CloneStrategy) -> io::Result<()> {
  match strategy {
    CloneStrategy::Reflink => {
      reflink(from, to)?;
      fs::set_permissions(to, fs::metadata(from)?.permissions())?;
      Ok(())
    }
    CloneStrategy::Hardlink => fs::hard_link(from, to),
    CloneStrategy::Copy => {
      fs::copy(from, to)?;
      Ok(())
    }
  }
}

#[cfg(target_os = "linux")]
fn reflink(from: &Path, to: &Path) -> io::Result<()> {
  let src = File::open(from)?;
  let dst = OpenOptions::new().write(true).create_new(true).open(to)?;
  if let Err(e) = rustix::fs::ioctl_ficlone(&dst, &src) {
    let _ = fs::remove_file(to);
    return Err(io::Error::from(e));
  }
  Ok(())
}

#[cfg(not(target_os = "linux"))]
fn reflink(_from: &Path, _to: &Path) -> io::Result<()> {
  Err(io::Error::from(io::ErrorKind::Unsupported))
}
