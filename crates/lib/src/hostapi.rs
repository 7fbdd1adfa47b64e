//! The per-stage host API server.
//!
//! Every stage invocation gets its own unix socket and its own server. The
//! protocol is strictly request/response: requests on a connection are
//! served in order, one at a time. Connections themselves are served
//! concurrently, because the runner and the stage both hold one open for
//! their whole lifetime. Unknown message kinds get an error response
//! without terminating the connection.
//!
//! The server is an explicit handle owned by the executor, bound before the
//! stage starts and collected after it exits; what the stage reported
//! (metadata, log lines, a structured exception) comes back as a
//! [`StageReport`].

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use osforge_core::wire::{self, Request, Response, StageArguments};
use serde_json::Value;

use crate::{Result, StageException};

/// Path mapping between the host and the stage's mount namespace.
///
/// `store.mkdtemp` and `store.source` return paths the *stage* can use; the
/// server performs the filesystem work on the host side of each pair. With
/// the direct-spawn sandbox both sides coincide.
#[derive(Debug, Clone)]
pub struct ApiPaths {
  pub tmp_host: PathBuf,
  pub tmp_stage: PathBuf,
  pub sources_host: PathBuf,
  pub sources_stage: PathBuf,
}

/// What a stage reported over the API during its lifetime.
#[derive(Debug, Default)]
pub struct StageReport {
  pub metadata: Option<Value>,
  pub log: String,
  pub exception: Option<StageException>,
}

/// A running host API server bound to one stage's socket.
pub struct ApiServer {
  task: JoinHandle<()>,
  state: Arc<Mutex<StageReport>>,
}

impl ApiServer {
  /// Bind the socket and start serving. Must be called inside a tokio
  /// runtime; the accept loop runs until [`ApiServer::finish`].
  pub fn bind(socket: &Path, arguments: StageArguments, paths: ApiPaths) -> Result<ApiServer> {
    let listener = UnixListener::bind(socket)?;
    let state = Arc::new(Mutex::new(StageReport::default()));

    let task_state = state.clone();
    let task = tokio::spawn(async move {
      // Each connection is served on its own task: a runner holds its
      // connection open across the stage's whole lifetime, so serving
      // connections back-to-back would deadlock the stage's own. The set
      // lives in this task, so aborting the server tears them all down.
      let mut connections = tokio::task::JoinSet::new();
      loop {
        match listener.accept().await {
          Ok((stream, _)) => {
            let arguments = arguments.clone();
            let paths = paths.clone();
            let state = task_state.clone();
            connections.spawn(async move {
              if let Err(e) = serve_connection(stream, &arguments, &paths, &state).await {
                warn!(error = %e, "host api connection failed");
              }
            });
          }
          Err(e) => {
            warn!(error = %e, "host api accept failed");
            break;
          }
        }
      }
    });

    Ok(ApiServer { task, state })
  }

  /// Stop serving and collect everything the stage reported. Called after
  /// the stage process has exited, so no request can be in flight.
  pub async fn finish(self) -> StageReport {
    self.task.abort();
    let _ = self.task.await;
    let mut state = self.state.lock().expect("api state poisoned");
    std::mem::take(&mut *state)
  }
}

async fn serve_connection(
  mut stream: UnixStream,
  arguments: &StageArguments,
  paths: &ApiPaths,
  state: &Mutex<StageReport>,
) -> io::Result<()> {
  while let Some(body) = read_frame(&mut stream).await? {
    let response = match wire::decode::<Request>(&body) {
      Ok(request) => handle_request(request, arguments, paths, state),
      Err(_) => match wire::kind_of(&body) {
        Some(kind) => Response::Error {
          message: format!("unknown message kind '{}'", kind),
        },
        None => Response::Error {
          message: "malformed message".to_string(),
        },
      },
    };
    write_frame(&mut stream, &response).await?;
  }
  Ok(())
}

fn handle_request(
  request: Request,
  arguments: &StageArguments,
  paths: &ApiPaths,
  state: &Mutex<StageReport>,
) -> Response {
  match request {
    Request::Arguments => Response::Arguments(arguments.clone()),

    Request::Mkdtemp { prefix } => match mkdtemp(paths, &prefix) {
      Ok(path) => Response::Path { path },
      Err(e) => Response::Error { message: e.to_string() },
    },

    Request::Source { source_type } => match source_dir(paths, &source_type) {
      Ok(path) => Response::Path { path },
      Err(e) => Response::Error { message: e.to_string() },
    },

    Request::Metadata { metadata } => {
      let mut state = state.lock().expect("api state poisoned");
      merge_metadata(&mut state.metadata, metadata);
      Response::Ok
    }

    Request::Log { text } => {
      debug!(target: "stage", "{}", text.trim_end());
      let mut state = state.lock().expect("api state poisoned");
      state.log.push_str(&text);
      if !text.ends_with('\n') {
        state.log.push('\n');
      }
      Response::Ok
    }

    Request::Exception { kind, message } => {
      let mut state = state.lock().expect("api state poisoned");
      state.exception = Some(StageException { kind, message });
      Response::Ok
    }
  }
}

/// Allocate a scratch directory in the sandbox's temp root. The directory
/// lives until sandbox teardown; the stage owns it until then.
fn mkdtemp(paths: &ApiPaths, prefix: &str) -> io::Result<PathBuf> {
  let dir = tempfile::Builder::new().prefix(prefix).tempdir_in(&paths.tmp_host)?;
  let path = dir.keep();
  let name = path.file_name().ok_or_else(|| io::Error::other("unnamed temp dir"))?;
  Ok(paths.tmp_stage.join(name))
}

fn source_dir(paths: &ApiPaths, source_type: &str) -> io::Result<PathBuf> {
  if source_type.is_empty() || source_type.contains('/') || source_type.starts_with('.') {
    return Err(io::Error::new(
      io::ErrorKind::InvalidInput,
      format!("invalid source type '{}'", source_type),
    ));
  }
  fs::create_dir_all(paths.sources_host.join(source_type))?;
  Ok(paths.sources_stage.join(source_type))
}

/// Later metadata calls extend earlier ones key-by-key; a non-object payload
/// replaces what was there.
fn merge_metadata(slot: &mut Option<Value>, incoming: Value) {
  match (slot.as_mut(), incoming) {
    (Some(Value::Object(existing)), Value::Object(new)) => existing.extend(new),
    (_, incoming) => *slot = Some(incoming),
  }
}

async fn read_frame(stream: &mut UnixStream) -> io::Result<Option<Vec<u8>>> {
  let mut header = [0u8; 4];
  if let Err(e) = stream.read_exact(&mut header).await {
    if e.kind() == io::ErrorKind::UnexpectedEof {
      return Ok(None);
    }
    return Err(e);
  }
  let len = u32::from_be_bytes(header) as usize;
  if len > wire::MAX_MESSAGE_SIZE {
    return Err(io::Error::new(io::ErrorKind::InvalidData, "message exceeds limit"));
  }
  let mut body = vec![0u8; len];
  stream.read_exact(&mut body).await?;
  Ok(Some(body))
}

async fn write_frame(stream: &mut UnixStream, response: &Response) -> io::Result<()> {
  let body = serde_json::to_vec(response).map_err(io::Error::other)?;
  stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
  stream.write_all(&body).await?;
  stream.flush().await
}

#[cfg(test)]
mod tests {
  use std::collections::BTreeMap;
  use std::os::unix::net::UnixStream as StdUnixStream;

  use serde_json::json;

  use osforge_core::wire::{InputArgument, StageMeta};

  use super::*;

  struct Fixture {
    server: ApiServer,
    socket: PathBuf,
    tmp: PathBuf,
    _dir: tempfile::TempDir,
  }

  fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let tmp = dir.path().join("tmp");
    let sources = dir.path().join("sources");
    fs::create_dir_all(&tmp).unwrap();
    fs::create_dir_all(&sources).unwrap();

    let arguments = StageArguments {
      tree: PathBuf::from("/run/osbuild/tree"),
      inputs: BTreeMap::from([(
        "files".to_string(),
        InputArgument {
          path: PathBuf::from("/run/osbuild/inputs/files"),
          data: json!({"sha256:ab": null}),
        },
      )]),
      options: json!({"x": 1}),
      meta: StageMeta { id: "7".repeat(64) },
      output: None,
    };
    let paths = ApiPaths {
      tmp_host: tmp.clone(),
      tmp_stage: PathBuf::from("/run/osbuild/tmp"),
      sources_host: sources,
      sources_stage: PathBuf::from("/run/osbuild/sources"),
    };

    let socket = dir.path().join("api.sock");
    let server = ApiServer::bind(&socket, arguments, paths).unwrap();
    Fixture {
      server,
      socket,
      tmp,
      _dir: dir,
    }
  }

  /// Drive the server the way a stage does: blocking I/O over the sync codec.
  fn call(socket: &Path, requests: Vec<Request>) -> Vec<Response> {
    let socket = socket.to_path_buf();
    let mut stream = StdUnixStream::connect(socket).unwrap();
    requests
      .into_iter()
      .map(|request| {
        wire::write_message(&mut stream, &request).unwrap();
        let body = wire::read_message(&mut stream).unwrap().unwrap();
        wire::decode(&body).unwrap()
      })
      .collect()
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn arguments_are_delivered() {
    let fixture = fixture();
    let socket = fixture.socket.clone();
    let responses = tokio::task::spawn_blocking(move || call(&socket, vec![Request::Arguments, Request::Arguments]))
      .await
      .unwrap();

    for response in responses {
      match response {
        Response::Arguments(args) => {
          assert_eq!(args.tree, PathBuf::from("/run/osbuild/tree"));
          assert_eq!(args.options, json!({"x": 1}));
          assert_eq!(args.meta.id, "7".repeat(64));
          assert_eq!(args.inputs["files"].path, PathBuf::from("/run/osbuild/inputs/files"));
        }
        other => panic!("unexpected response: {:?}", other),
      }
    }
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn mkdtemp_maps_paths_into_the_sandbox() {
    let fixture = fixture();
    let socket = fixture.socket.clone();
    let responses = tokio::task::spawn_blocking(move || {
      call(
        &socket,
        vec![Request::Mkdtemp {
          prefix: "work-".to_string(),
        }],
      )
    })
    .await
    .unwrap();

    match &responses[0] {
      Response::Path { path } => {
        // The stage sees the mapped path; the host directory exists.
        assert!(path.starts_with("/run/osbuild/tmp"));
        let name = path.file_name().unwrap();
        assert!(fixture.tmp.join(name).is_dir());
        assert!(name.to_string_lossy().starts_with("work-"));
      }
      other => panic!("unexpected response: {:?}", other),
    }
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn source_returns_the_mapped_blob_directory() {
    let fixture = fixture();
    let socket = fixture.socket.clone();
    let responses = tokio::task::spawn_blocking(move || {
      call(
        &socket,
        vec![Request::Source {
          source_type: "org.osbuild.files".to_string(),
        }],
      )
    })
    .await
    .unwrap();

    match &responses[0] {
      Response::Path { path } => assert_eq!(path, &PathBuf::from("/run/osbuild/sources/org.osbuild.files")),
      other => panic!("unexpected response: {:?}", other),
    }
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn report_collects_log_metadata_and_exception() {
    let fixture = fixture();
    let socket = fixture.socket.clone();
    tokio::task::spawn_blocking(move || {
      call(
        &socket,
        vec![
          Request::Log {
            text: "starting".to_string(),
          },
          Request::Metadata {
            metadata: json!({"packages": 3}),
          },
          Request::Metadata {
            metadata: json!({"kernel": "6.1"}),
          },
          Request::Exception {
            kind: "OSError".to_string(),
            message: "boom".to_string(),
          },
        ],
      )
    })
    .await
    .unwrap();

    let report = fixture.server.finish().await;
    assert_eq!(report.log, "starting\n");
    assert_eq!(report.metadata, Some(json!({"packages": 3, "kernel": "6.1"})));
    assert_eq!(
      report.exception,
      Some(StageException {
        kind: "OSError".to_string(),
        message: "boom".to_string(),
      })
    );
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn unknown_kind_keeps_the_connection_alive() {
    let fixture = fixture();
    let socket = fixture.socket.clone();
    let ok = tokio::task::spawn_blocking(move || {
      let mut stream = StdUnixStream::connect(&socket).unwrap();
      wire::write_message(&mut stream, &json!({"kind": "store.frobnicate"})).unwrap();
      let body = wire::read_message(&mut stream).unwrap().unwrap();
      let response: Response = wire::decode(&body).unwrap();
      assert!(matches!(response, Response::Error { message } if message.contains("store.frobnicate")));

      // The same connection still answers real requests.
      wire::write_message(&mut stream, &Request::Arguments).unwrap();
      let body = wire::read_message(&mut stream).unwrap().unwrap();
      matches!(wire::decode::<Response>(&body).unwrap(), Response::Arguments(_))
    })
    .await
    .unwrap();
    assert!(ok);
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn sequential_connections_are_served() {
    let fixture = fixture();
    for _ in 0..3 {
      let socket = fixture.socket.clone();
      let responses = tokio::task::spawn_blocking(move || call(&socket, vec![Request::Arguments]))
        .await
        .unwrap();
      assert!(matches!(responses[0], Response::Arguments(_)));
    }
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn overlapping_connections_are_served() {
    let fixture = fixture();
    let socket = fixture.socket.clone();
    let ok = tokio::task::spawn_blocking(move || {
      // First connection stays open, as a runner's would.
      let mut first = StdUnixStream::connect(&socket).unwrap();
      wire::write_message(&mut first, &Request::Log { text: "runner up".to_string() }).unwrap();
      let body = wire::read_message(&mut first).unwrap().unwrap();
      assert!(matches!(wire::decode::<Response>(&body).unwrap(), Response::Ok));

      // The stage's connection must be answered while the first is open.
      let mut second = StdUnixStream::connect(&socket).unwrap();
      wire::write_message(&mut second, &Request::Arguments).unwrap();
      let body = wire::read_message(&mut second).unwrap().unwrap();
      assert!(matches!(wire::decode::<Response>(&body).unwrap(), Response::Arguments(_)));

      // And the first connection still works afterwards.
      wire::write_message(&mut first, &Request::Arguments).unwrap();
      let body = wire::read_message(&mut first).unwrap().unwrap();
      matches!(wire::decode::<Response>(&body).unwrap(), Response::Arguments(_))
    })
    .await
    .unwrap();
    assert!(ok);
  }
}
