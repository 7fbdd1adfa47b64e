//! The stage sandbox.
//!
//! A stage runs in a private mount namespace whose `/` is the runtime root
//! (the host filesystem for bootstrap pipelines, or the tree a build
//! pipeline produced). The engine-controlled pieces are mounted under
//! `/run/osbuild`:
//!
//! ```text
//! /run/osbuild/
//! ├── tree        # the build tree (rw; ro for assemblers)
//! ├── inputs/<n>  # materialized inputs, read-only
//! ├── tmp         # sandbox temp root (store.mkdtemp lands here)
//! ├── sources     # the store's source blobs, read-only
//! ├── api/osbuild # host API socket
//! ├── output      # assembler artifact directory (rw, assemblers only)
//! └── lib         # the module library (host runtime roots only)
//! ```
//!
//! Isolation is delegated to bubblewrap, probed once per process. Without
//! bwrap the sandbox degrades to a direct spawn with a scrubbed environment
//! and host-side paths; teardown stays trivial either way because every
//! transient directory is drop-guarded and all mounts live in the child's
//! namespace.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::modules::DEFAULT_LIBDIR;

pub const TREE_PATH: &str = "/run/osbuild/tree";
pub const INPUTS_PATH: &str = "/run/osbuild/inputs";
pub const TMP_PATH: &str = "/run/osbuild/tmp";
pub const SOURCES_PATH: &str = "/run/osbuild/sources";
pub const API_PATH: &str = "/run/osbuild/api";
pub const OUTPUT_PATH: &str = "/run/osbuild/output";
pub const LIB_PATH: &str = "/run/osbuild/lib";

/// Name of the socket file inside the API directory.
pub const API_SOCKET: &str = "osbuild";

/// What provides `/` inside the sandbox.
#[derive(Debug, Clone)]
pub enum RuntimeRoot {
  /// The host filesystem, read-only. Used by bootstrap pipelines.
  Host,
  /// A committed tree from the store (immutable, safe to share).
  Tree(PathBuf),
}

/// Host-side description of one stage's sandbox.
#[derive(Debug)]
pub struct Sandbox {
  pub runtime_root: RuntimeRoot,
  /// Host module library, mounted for host runtime roots.
  pub libdir: PathBuf,
  /// Module path relative to the library root, e.g. `stages/org.osbuild.noop`.
  pub module: PathBuf,
  /// Runner wrapping the module, as a library-relative path.
  pub runner: Option<PathBuf>,
  pub tree_host: PathBuf,
  pub tree_writable: bool,
  pub inputs_host: Vec<(String, PathBuf)>,
  /// Directory containing the API socket file.
  pub api_dir_host: PathBuf,
  pub tmp_host: PathBuf,
  pub sources_host: PathBuf,
  pub output_host: Option<PathBuf>,
}

/// The paths the stage itself sees, used to build its argument envelope.
#[derive(Debug, Clone)]
pub struct SandboxPaths {
  pub tree: PathBuf,
  pub tmp: PathBuf,
  pub sources: PathBuf,
  pub socket: PathBuf,
  pub output: Option<PathBuf>,
}

/// Result of running the sandboxed process.
#[derive(Debug)]
pub struct SandboxOutcome {
  pub status: std::process::ExitStatus,
  /// Captured stdout and stderr, in that order.
  pub output: String,
}

/// Whether namespace isolation via bubblewrap works here. A present bwrap
/// binary is not enough (user namespaces may be disabled), so the probe
/// runs a trivial command under the same namespace flags the sandbox uses.
/// Probed once per process.
pub fn isolation_available() -> bool {
  static AVAILABLE: OnceLock<bool> = OnceLock::new();
  *AVAILABLE.get_or_init(|| {
    std::process::Command::new("bwrap")
      .args([
        "--unshare-user",
        "--unshare-pid",
        "--unshare-ipc",
        "--unshare-uts",
        "--die-with-parent",
        "--ro-bind",
        "/",
        "/",
        "--dev",
        "/dev",
        "--proc",
        "/proc",
        "/bin/true",
      ])
      .output()
      .map(|o| o.status.success())
      .unwrap_or(false)
  })
}

impl Sandbox {
  /// The stage-visible paths for the given isolation mode.
  pub fn paths(&self, isolated: bool) -> SandboxPaths {
    if isolated {
      SandboxPaths {
        tree: PathBuf::from(TREE_PATH),
        tmp: PathBuf::from(TMP_PATH),
        sources: PathBuf::from(SOURCES_PATH),
        socket: Path::new(API_PATH).join(API_SOCKET),
        output: self.output_host.as_ref().map(|_| PathBuf::from(OUTPUT_PATH)),
      }
    } else {
      SandboxPaths {
        tree: self.tree_host.clone(),
        tmp: self.tmp_host.clone(),
        sources: self.sources_host.clone(),
        socket: self.api_dir_host.join(API_SOCKET),
        output: self.output_host.clone(),
      }
    }
  }

  /// Stage-visible path of each materialized input.
  pub fn input_paths(&self, isolated: bool) -> Vec<(String, PathBuf)> {
    self
      .inputs_host
      .iter()
      .map(|(name, host_path)| {
        let path = if isolated {
          Path::new(INPUTS_PATH).join(name)
        } else {
          host_path.clone()
        };
        (name.clone(), path)
      })
      .collect()
  }

  /// Library root as seen from inside the sandbox.
  fn sandbox_libdir(&self) -> PathBuf {
    match &self.runtime_root {
      RuntimeRoot::Host => PathBuf::from(LIB_PATH),
      // Trees carry their own library at the installed location.
      RuntimeRoot::Tree(_) => PathBuf::from(DEFAULT_LIBDIR),
    }
  }

  /// Build the command for the given isolation mode.
  pub fn command(&self, isolated: bool) -> Command {
    if isolated {
      self.bwrap_command()
    } else {
      self.direct_command()
    }
  }

  fn bwrap_command(&self) -> Command {
    let paths = self.paths(true);
    let mut bwrap = BwrapArgs::new();

    match &self.runtime_root {
      RuntimeRoot::Host => {
        for dir in ["/usr", "/lib", "/lib64", "/bin", "/sbin", "/etc"] {
          bwrap.ro_bind_if_exists(dir, dir);
        }
        bwrap.ro_bind(&self.libdir, LIB_PATH);
      }
      RuntimeRoot::Tree(root) => {
        bwrap.bind_root(root);
      }
    }

    bwrap.dev("/dev");
    bwrap.proc("/proc");
    bwrap.ro_bind_if_exists("/sys", "/sys");
    bwrap.tmpfs("/run");
    bwrap.tmpfs("/tmp");

    if self.tree_writable {
      bwrap.bind(&self.tree_host, TREE_PATH);
    } else {
      bwrap.ro_bind(&self.tree_host, TREE_PATH);
    }
    for (name, host_path) in &self.inputs_host {
      bwrap.ro_bind(host_path, Path::new(INPUTS_PATH).join(name));
    }
    bwrap.bind(&self.tmp_host, TMP_PATH);
    bwrap.ro_bind(&self.sources_host, SOURCES_PATH);
    // The socket needs write access for connect().
    bwrap.bind(&self.api_dir_host, API_PATH);
    if let Some(output) = &self.output_host {
      bwrap.bind(output, OUTPUT_PATH);
    }

    let libdir = self.sandbox_libdir();
    let module = libdir.join(&self.module);
    let mut argv: Vec<PathBuf> = Vec::new();
    if let Some(runner) = &self.runner {
      argv.push(libdir.join(runner));
    }
    argv.push(module);
    argv.push(paths.socket.clone());

    bwrap.into_command(&argv, &paths.tmp)
  }

  fn direct_command(&self) -> Command {
    let paths = self.paths(false);
    let root = match &self.runtime_root {
      RuntimeRoot::Host => PathBuf::from("/"),
      RuntimeRoot::Tree(root) => root.clone(),
    };
    let libdir = match &self.runtime_root {
      RuntimeRoot::Host => self.libdir.clone(),
      RuntimeRoot::Tree(_) => join_under(&root, &self.sandbox_libdir()),
    };

    let program = match &self.runner {
      Some(runner) => libdir.join(runner),
      None => libdir.join(&self.module),
    };
    let mut cmd = Command::new(program);
    if self.runner.is_some() {
      cmd.arg(libdir.join(&self.module));
    }
    cmd.arg(&paths.socket);
    scrub_env(&mut cmd, &paths.tmp);
    cmd
  }

  /// Run the stage to completion, forwarding termination: a signal to the
  /// engine becomes `SIGTERM` to the child, and after `grace` the child is
  /// killed. Teardown needs no work of its own: mounts die with the child's
  /// namespace and the temp directories are owned by the caller.
  pub async fn run(&self, isolated: bool, grace: Duration) -> io::Result<SandboxOutcome> {
    if !isolated {
      warn!("bwrap unavailable, running stage without namespace isolation");
    }

    let mut cmd = self.command(isolated);
    cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
    debug!(module = %self.module.display(), isolated, "spawning stage");
    let mut child = cmd.spawn()?;

    // Both pipes must be drained concurrently: a stage filling one while
    // the other stays open would otherwise block on write and never exit.
    let stdout_task = tokio::spawn(drain(child.stdout.take()));
    let stderr_task = tokio::spawn(drain(child.stderr.take()));

    let interrupted = tokio::select! {
      status = child.wait() => Some(status?),
      _ = tokio::signal::ctrl_c() => None,
    };
    let status = match interrupted {
      Some(status) => status,
      None => terminate(&mut child, grace).await?,
    };

    let mut output = stdout_task.await.unwrap_or_default();
    output.push_str(&stderr_task.await.unwrap_or_default());
    Ok(SandboxOutcome { status, output })
  }
}

async fn drain<R: tokio::io::AsyncRead + Unpin>(pipe: Option<R>) -> String {
  let mut buf = String::new();
  if let Some(mut pipe) = pipe {
    let _ = pipe.read_to_string(&mut buf).await;
  }
  buf
}

/// SIGTERM, a bounded grace period, then SIGKILL.
async fn terminate(child: &mut Child, grace: Duration) -> io::Result<std::process::ExitStatus> {
  if let Some(pid) = child.id() {
    if let Some(pid) = rustix::process::Pid::from_raw(pid as i32) {
      let _ = rustix::process::kill_process(pid, rustix::process::Signal::Term);
    }
  }
  match tokio::time::timeout(grace, child.wait()).await {
    Ok(status) => status,
    Err(_) => {
      warn!("stage ignored SIGTERM, killing");
      child.start_kill()?;
      child.wait().await
    }
  }
}

fn scrub_env(cmd: &mut Command, tmp: &Path) {
  cmd
    .env_clear()
    .env("PATH", "/usr/bin:/bin:/usr/sbin:/sbin")
    .env("HOME", "/root")
    .env("TMPDIR", tmp)
    .env("LANG", "C")
    .env("LC_ALL", "C");
}

fn join_under(root: &Path, absolute: &Path) -> PathBuf {
  match absolute.strip_prefix("/") {
    Ok(relative) => root.join(relative),
    Err(_) => root.join(absolute),
  }
}

/// Minimal argument builder for bubblewrap.
struct BwrapArgs {
  args: Vec<String>,
}

impl BwrapArgs {
  fn new() -> Self {
    let args = vec![
      "--unshare-user".to_string(),
      "--unshare-pid".to_string(),
      "--unshare-ipc".to_string(),
      "--unshare-uts".to_string(),
      "--die-with-parent".to_string(),
      "--new-session".to_string(),
    ];
    BwrapArgs { args }
  }

  fn push_pair(&mut self, flag: &str, src: impl AsRef<Path>, dest: impl AsRef<Path>) {
    self.args.push(flag.to_string());
    self.args.push(src.as_ref().to_string_lossy().into_owned());
    self.args.push(dest.as_ref().to_string_lossy().into_owned());
  }

  fn ro_bind(&mut self, src: impl AsRef<Path>, dest: impl AsRef<Path>) {
    self.push_pair("--ro-bind", src, dest);
  }

  fn ro_bind_if_exists(&mut self, src: impl AsRef<Path>, dest: impl AsRef<Path>) {
    if src.as_ref().exists() {
      self.ro_bind(src, dest);
    }
  }

  fn bind(&mut self, src: impl AsRef<Path>, dest: impl AsRef<Path>) {
    self.push_pair("--bind", src, dest);
  }

  fn bind_root(&mut self, src: impl AsRef<Path>) {
    self.push_pair("--ro-bind", src, "/");
  }

  fn dev(&mut self, dest: &str) {
    self.args.push("--dev".to_string());
    self.args.push(dest.to_string());
  }

  fn proc(&mut self, dest: &str) {
    self.args.push("--proc".to_string());
    self.args.push(dest.to_string());
  }

  fn tmpfs(&mut self, dest: &str) {
    self.args.push("--tmpfs".to_string());
    self.args.push(dest.to_string());
  }

  fn into_command(mut self, argv: &[PathBuf], tmp: &Path) -> Command {
    self.args.push("--chdir".to_string());
    self.args.push("/".to_string());
    self.args.push("--clearenv".to_string());

    let mut cmd = Command::new("bwrap");
    cmd.args(&self.args);
    cmd.arg("--");
    for arg in argv {
      cmd.arg(arg);
    }
    scrub_env(&mut cmd, tmp);
    cmd
  }
}
