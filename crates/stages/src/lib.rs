//! Building blocks for stage programs.
//!
//! A stage is a standalone executable. It receives the host API socket path
//! as its only argument, asks the engine for its parameters, mutates the
//! tree it was given, and exits 0 on success. Everything it wants the
//! engine to know goes over the API: log lines via `log`, structured
//! results via `metadata`, failures via `exception`.
//!
//! [`StageClient`] is the blocking side of the wire protocol defined in
//! `osforge-core`; [`run`] is the `main` scaffolding all the sample
//! binaries share.

use std::env;
use std::io;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::exit;

use serde_json::Value;

use osforge_core::wire::{self, Request, Response, StageArguments};

/// Outcome type for stage bodies.
pub type StageResult = Result<(), Box<dyn std::error::Error>>;

/// Blocking host API client.
pub struct StageClient {
  stream: UnixStream,
}

impl StageClient {
  pub fn connect(socket: &Path) -> io::Result<StageClient> {
    Ok(StageClient {
      stream: UnixStream::connect(socket)?,
    })
  }

  fn call(&mut self, request: &Request) -> io::Result<Response> {
    wire::write_message(&mut self.stream, request)?;
    let body = wire::read_message(&mut self.stream)?
      .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "engine closed the api socket"))?;
    let response: Response = wire::decode(&body).map_err(io::Error::other)?;
    match response {
      Response::Error { message } => Err(io::Error::other(message)),
      other => Ok(other),
    }
  }

  /// Fetch the stage's argument envelope.
  pub fn arguments(&mut self) -> io::Result<StageArguments> {
    match self.call(&Request::Arguments)? {
      Response::Arguments(arguments) => Ok(arguments),
      other => Err(unexpected(&other)),
    }
  }

  /// Allocate a scratch directory inside the sandbox temp root.
  pub fn mkdtemp(&mut self, prefix: &str) -> io::Result<PathBuf> {
    match self.call(&Request::Mkdtemp {
      prefix: prefix.to_string(),
    })? {
      Response::Path { path } => Ok(path),
      other => Err(unexpected(&other)),
    }
  }

  /// Resolve the blob directory of a source type.
  pub fn source(&mut self, source_type: &str) -> io::Result<PathBuf> {
    match self.call(&Request::Source {
      source_type: source_type.to_string(),
    })? {
      Response::Path { path } => Ok(path),
      other => Err(unexpected(&other)),
    }
  }

  /// Attach metadata to the object this stage produces.
  pub fn metadata(&mut self, metadata: Value) -> io::Result<()> {
    self.call(&Request::Metadata { metadata }).map(|_| ())
  }

  /// Send a log line to the engine.
  pub fn log(&mut self, text: &str) -> io::Result<()> {
    self.call(&Request::Log { text: text.to_string() }).map(|_| ())
  }

  /// Report a structured failure. The stage should exit non-zero afterward.
  pub fn exception(&mut self, kind: &str, message: &str) -> io::Result<()> {
    self
      .call(&Request::Exception {
        kind: kind.to_string(),
        message: message.to_string(),
      })
      .map(|_| ())
  }
}

fn unexpected(response: &Response) -> io::Error {
  io::Error::other(format!("unexpected response: {:?}", response))
}

/// Shared `main` for stage binaries: connect, fetch arguments, run the
/// body, and translate failure into an `exception` plus a non-zero exit.
pub fn run<F>(stage: F) -> !
where
  F: FnOnce(&mut StageClient, &StageArguments) -> StageResult,
{
  let Some(socket) = env::args().nth(1) else {
    eprintln!("usage: stage <api-socket>");
    exit(2);
  };

  let mut client = match StageClient::connect(Path::new(&socket)) {
    Ok(client) => client,
    Err(e) => {
      eprintln!("cannot reach the host api at {}: {}", socket, e);
      exit(2);
    }
  };

  let arguments = match client.arguments() {
    Ok(arguments) => arguments,
    Err(e) => {
      eprintln!("cannot fetch arguments: {}", e);
      exit(2);
    }
  };

  match stage(&mut client, &arguments) {
    Ok(()) => exit(0),
    Err(e) => {
      let _ = client.exception("StageError", &e.to_string());
      eprintln!("{}", e);
      exit(1)
    }
  }
}

/// Resolve a path from the manifest (absolute within the tree) against the
/// tree's real location.
pub fn tree_path(tree: &Path, path: &str) -> PathBuf {
  tree.join(path.trim_start_matches('/'))
}

/// Fetch a string option, failing with a readable message when absent.
pub fn require_str<'a>(options: &'a Value, key: &str) -> Result<&'a str, String> {
  options
    .get(key)
    .and_then(Value::as_str)
    .ok_or_else(|| format!("missing option '{}'", key))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn tree_paths_stay_inside_the_tree() {
    let tree = Path::new("/run/osbuild/tree");
    assert_eq!(tree_path(tree, "/etc/os-release"), tree.join("etc/os-release"));
    assert_eq!(tree_path(tree, "relative"), tree.join("relative"));
  }

  #[test]
  fn require_str_reports_the_key() {
    let options = serde_json::json!({"path": "/hello"});
    assert_eq!(require_str(&options, "path").unwrap(), "/hello");
    assert_eq!(require_str(&options, "text").unwrap_err(), "missing option 'text'");
  }
}
