//! osforge-cli: build OS artifacts from a declarative manifest.
//!
//! `osforge [OPTIONS] <MANIFEST>` compiles the manifest into a pipeline
//! plan and executes it against the object store. `--inspect` stops after
//! planning and prints the resolved identifiers. Logs go to stderr; the
//! machine-readable result document goes to stdout when `--json` is set.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use console::style;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use osforge::{Error, ExecutionConfig, Executor, ModuleRegistry, Plan, Store};
use osforge_core::Manifest;

#[derive(Parser)]
#[command(name = "osforge")]
#[command(version, about = "Build operating-system artifacts from declarative manifests")]
struct Cli {
  /// Path to the manifest (JSON)
  manifest: PathBuf,

  /// Object store directory
  #[arg(long, env = "OSFORGE_STORE", default_value = ".osforge")]
  store: PathBuf,

  /// Module library directory
  #[arg(long, env = "OSFORGE_LIBDIR", default_value = osforge::modules::DEFAULT_LIBDIR)]
  libdir: PathBuf,

  /// Directory assembler artifacts are written to
  #[arg(long)]
  output: Option<PathBuf>,

  /// Resolve the plan and print it without executing anything
  #[arg(long)]
  inspect: bool,

  /// Record the final tree under refs/<NAME> in the store
  #[arg(long, value_name = "NAME")]
  export: Option<String>,

  /// Print the result document as JSON on stdout
  #[arg(long)]
  json: bool,

  /// Enable verbose output
  #[arg(short, long)]
  verbose: bool,
}

fn main() -> ExitCode {
  let cli = Cli::parse();

  let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
  FmtSubscriber::builder()
    .with_max_level(level)
    .with_target(false)
    .without_time()
    .with_writer(std::io::stderr)
    .init();

  match run(cli) {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      // Stage failures carry the captured output; show it before the error.
      if let Some(Error::StageFailed { logs, .. }) = e.downcast_ref::<Error>() {
        if !logs.is_empty() {
          eprintln!("{}", logs.trim_end());
        }
      }
      eprintln!("{} {:#}", style("error:").red().bold(), e);
      ExitCode::FAILURE
    }
  }
}

fn run(cli: Cli) -> anyhow::Result<()> {
  let manifest = Manifest::load(&cli.manifest).with_context(|| format!("loading {}", cli.manifest.display()))?;

  let registry = ModuleRegistry::new(&cli.libdir);
  let plan = Plan::compile(&manifest, &registry)?;

  if cli.inspect {
    println!("{}", serde_json::to_string_pretty(&plan)?);
    return Ok(());
  }

  let store = Store::new(&cli.store)?;

  let runtime = tokio::runtime::Runtime::new()?;
  let config = ExecutionConfig {
    output_dir: cli.output.clone(),
    ..ExecutionConfig::default()
  };
  let result = runtime.block_on(Executor::new(&store, &registry, config).run(&manifest, &plan))?;

  if let (Some(name), Some(tree)) = (&cli.export, &result.tree) {
    store.write_ref(name, tree)?;
  }

  eprintln!(
    "{} {} stage(s) built, {} from cache",
    style("Done:").green().bold(),
    result.built.len(),
    result.cached.len()
  );
  if let Some(tree) = &result.tree {
    eprintln!("  tree     {}", tree);
  }
  if let Some(artifact) = &result.artifact {
    eprintln!("  artifact {}", artifact.display());
  }

  if cli.json {
    println!("{}", serde_json::to_string_pretty(&result)?);
  }

  Ok(())
}
