//! Advisory file locks coordinating store mutation.
//!
//! Concurrent engine invocations against one store are legal; staging-area
//! allocation and commits are the only mutating sections, and each is
//! serialized by a blocking `flock` on a dot-file. Readers of committed
//! objects take no locks.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

/// A held advisory lock. Released on drop.
#[derive(Debug)]
pub struct LockGuard {
  _file: File,
}

/// Block until the exclusive lock on `path` is acquired. The lock file is
/// created if absent and never removed.
pub fn exclusive(path: &Path) -> io::Result<LockGuard> {
  let file = OpenOptions::new().read(true).write(true).create(true).truncate(false).open(path)?;
  flock_exclusive(&file)?;
  Ok(LockGuard { _file: file })
}

#[cfg(unix)]
fn flock_exclusive(file: &File) -> io::Result<()> {
  use rustix::fs::{flock, FlockOperation};
  use std::os::unix::io::AsFd;

  flock(file.as_fd(), FlockOperation::LockExclusive).map_err(io::Error::from)
}
