//! Pipeline execution.
//!
//! The executor drives a compiled plan sequentially: sources first, then
//! every pipeline in order, build pipelines before their dependents. Within
//! a pipeline each stage goes through the linear state machine
//! `Planned → Materializing → Running → (Committing | Discarding) → Done`;
//! there is no retry at this layer. A stage whose identifier is already in
//! the store is skipped entirely, which is sound because identifiers are
//! deterministic over their inputs.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use osforge_core::wire::{InputArgument, StageArguments, StageMeta};
use osforge_core::{ContentHash, InputOrigin, Manifest, ObjectId};

use crate::hostapi::{ApiPaths, ApiServer};
use crate::modules::{ModuleKind, ModuleRegistry};
use crate::plan::{InputPlan, Plan, PipelinePlan, StagePlan};
use crate::sandbox::{self, RuntimeRoot, Sandbox};
use crate::store::{clone, Store};
use crate::{sources, Error, Result};

/// Knobs for one execution run.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
  /// Where assembler artifacts land. Required when the manifest names one.
  pub output_dir: Option<PathBuf>,

  /// Grace period between SIGTERM and SIGKILL on cancellation.
  pub grace: Duration,

  /// Force isolation on or off; `None` probes for bubblewrap.
  pub isolate: Option<bool>,
}

impl Default for ExecutionConfig {
  fn default() -> Self {
    ExecutionConfig {
      output_dir: None,
      grace: Duration::from_secs(10),
      isolate: None,
    }
  }
}

/// What an execution run produced.
#[derive(Debug, Default, Serialize)]
pub struct ExecutionResult {
  /// Identifiers of stages that actually executed, in order.
  pub built: Vec<ObjectId>,

  /// Identifiers satisfied from the store without running anything.
  pub cached: Vec<ObjectId>,

  /// The root pipeline's final tree.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub tree: Option<ObjectId>,

  /// Metadata reported by stages, keyed by their identifier.
  #[serde(skip_serializing_if = "BTreeMap::is_empty")]
  pub metadata: BTreeMap<String, Value>,

  /// Directory holding the assembler's artifact, when one ran.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub artifact: Option<PathBuf>,
}

/// Per-stage progression, logged as the stage moves along.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StageState {
  Planned,
  Materializing,
  Running,
  Committing,
  Discarding,
  Done,
}

/// Drives plans against a store and a module library.
pub struct Executor<'a> {
  store: &'a Store,
  registry: &'a ModuleRegistry,
  config: ExecutionConfig,
}

impl<'a> Executor<'a> {
  pub fn new(store: &'a Store, registry: &'a ModuleRegistry, config: ExecutionConfig) -> Self {
    Executor {
      store,
      registry,
      config,
    }
  }

  /// Execute a compiled plan. Source failures abort before any stage runs;
  /// a stage failure aborts its pipeline and any dependents. Objects
  /// committed before a failure stay in the store.
  pub async fn run(&self, manifest: &Manifest, plan: &Plan) -> Result<ExecutionResult> {
    let isolated = self.config.isolate.unwrap_or_else(sandbox::isolation_available);

    sources::materialize(self.store, self.registry, &manifest.sources, &plan.source_requirements()).await?;

    let mut result = ExecutionResult::default();
    for pipeline in &plan.pipelines {
      let build_id = pipeline.build.map(|index| plan.pipelines[index].result_id().clone());
      self.run_pipeline(pipeline, build_id, isolated, &mut result).await?;
    }

    result.tree = Some(plan.root().result_id().clone());
    Ok(result)
  }

  async fn run_pipeline(
    &self,
    pipeline: &PipelinePlan,
    build_id: Option<ObjectId>,
    isolated: bool,
    result: &mut ExecutionResult,
  ) -> Result<()> {
    // The runtime root is a snapshot of the build pipeline's tree, held for
    // the whole pipeline and mounted read-only underneath every stage.
    let root_snapshot = match &build_id {
      Some(id) => Some(self.store.snapshot(id)?),
      None => None,
    };
    let runtime_root = match &root_snapshot {
      Some(snapshot) => RuntimeRoot::Tree(snapshot.path().to_path_buf()),
      None => RuntimeRoot::Host,
    };

    let runner = self.resolve_runner(pipeline, &runtime_root)?;

    let mut prev: Option<ObjectId> = None;
    for stage in &pipeline.stages {
      if self.store.contains(&stage.id) {
        info!(stage = %stage.name, id = %stage.id, "tree in store, skipping");
        result.cached.push(stage.id.clone());
        prev = Some(stage.id.clone());
        continue;
      }

      self
        .run_stage(stage, ModuleKind::Stage, prev.as_ref(), &runtime_root, runner.as_deref(), isolated, result)
        .await?;
      prev = Some(stage.id.clone());
    }

    if let Some(assembler) = &pipeline.assembler {
      self
        .run_stage(assembler, ModuleKind::Assembler, prev.as_ref(), &runtime_root, runner.as_deref(), isolated, result)
        .await?;
      result.artifact = self.config.output_dir.clone();
    }

    Ok(())
  }

  fn resolve_runner(&self, pipeline: &PipelinePlan, runtime_root: &RuntimeRoot) -> Result<Option<PathBuf>> {
    let Some(name) = &pipeline.runner else {
      // No runner configured. Host-rooted pipelines fall back to the
      // runner matching the host distribution, when the library has one.
      if matches!(runtime_root, RuntimeRoot::Host) {
        let detected = crate::modules::detect_host_runner();
        if let Ok(info) = self.registry.find(ModuleKind::Runner, &detected) {
          return Ok(Some(info.relative_path()));
        }
      }
      return Ok(None);
    };
    // With a host root the runner must exist in the host library. Inside a
    // tree root it resolves against the tree's own library at exec time.
    if matches!(runtime_root, RuntimeRoot::Host) {
      let info = self.registry.find(ModuleKind::Runner, name)?;
      return Ok(Some(info.relative_path()));
    }
    Ok(Some(PathBuf::from(ModuleKind::Runner.directory()).join(name)))
  }

  #[allow(clippy::too_many_arguments)]
  async fn run_stage(
    &self,
    stage: &StagePlan,
    kind: ModuleKind,
    prev: Option<&ObjectId>,
    runtime_root: &RuntimeRoot,
    runner: Option<&std::path::Path>,
    isolated: bool,
    result: &mut ExecutionResult,
  ) -> Result<()> {
    let id = &stage.id;
    let mut state = StageState::Planned;
    transition(&mut state, StageState::Materializing, id);

    let assembling = kind == ModuleKind::Assembler;
    if assembling && self.config.output_dir.is_none() {
      return Err(Error::ManifestInvalid(format!(
        "assembler '{}' requires an output directory",
        stage.name
      )));
    }

    let in_tree = matches!(runtime_root, RuntimeRoot::Tree(_));
    let info = self.registry.resolve(kind, &stage.name, in_tree)?;

    // Build tree: a fresh staged tree seeded from the upstream object, or,
    // for assemblers, the upstream object itself mounted read-only.
    let staged = if assembling {
      None
    } else {
      Some(self.store.stage_from(prev).map_err(|e| sandbox_error(id, e))?)
    };
    let tree_host = match &staged {
      Some(staged) => staged.path().to_path_buf(),
      None => {
        let prev = prev.ok_or_else(|| Error::ManifestInvalid("assembler without a preceding stage".to_string()))?;
        self.store.object_path(prev)
      }
    };

    let inputs_dir = self.store.scratch("inputs-").map_err(|e| sandbox_error(id, e))?;
    let inputs_host = self
      .materialize_inputs(&stage.inputs, inputs_dir.path())
      .map_err(|e| sandbox_error(id, e))?;

    let tmp_dir = self.store.scratch("stagetmp-").map_err(|e| sandbox_error(id, e))?;
    let api_dir = self.store.scratch("api-").map_err(|e| sandbox_error(id, e))?;

    let sandbox = Sandbox {
      runtime_root: runtime_root.clone(),
      libdir: self.registry.libdir().to_path_buf(),
      module: info.relative_path(),
      runner: runner.map(|r| r.to_path_buf()),
      tree_host,
      tree_writable: !assembling,
      inputs_host,
      api_dir_host: api_dir.path().to_path_buf(),
      tmp_host: tmp_dir.path().to_path_buf(),
      sources_host: self.store.root().join("sources"),
      output_host: if assembling { self.config.output_dir.clone() } else { None },
    };

    let paths = sandbox.paths(isolated);
    let arguments = StageArguments {
      tree: paths.tree.clone(),
      inputs: stage
        .inputs
        .iter()
        .zip(sandbox.input_paths(isolated))
        .map(|(input, (_, path))| {
          (
            input.name.clone(),
            InputArgument {
              path,
              data: input.references.to_keyed_value(),
            },
          )
        })
        .collect(),
      options: stage.options.clone(),
      meta: StageMeta { id: id.to_string() },
      output: paths.output.clone(),
    };

    let server = ApiServer::bind(&paths_socket_host(&sandbox), arguments, ApiPaths {
      tmp_host: sandbox.tmp_host.clone(),
      tmp_stage: paths.tmp.clone(),
      sources_host: sandbox.sources_host.clone(),
      sources_stage: paths.sources.clone(),
    })
    .map_err(|e| sandbox_error(id, e))?;

    transition(&mut state, StageState::Running, id);
    info!(stage = %stage.name, id = %id, "running");
    let outcome = sandbox
      .run(isolated, self.config.grace)
      .await
      .map_err(|e| sandbox_error(id, Error::from(e)))?;
    let report = server.finish().await;

    let mut logs = outcome.output;
    logs.push_str(&report.log);

    if !outcome.status.success() {
      transition(&mut state, StageState::Discarding, id);
      // `staged`, inputs and temp directories drop here; tmp/ is left clean.
      return Err(Error::StageFailed {
        name: stage.name.clone(),
        id: id.clone(),
        status: outcome.status.to_string(),
        logs,
        exception: report.exception,
      });
    }

    transition(&mut state, StageState::Committing, id);
    if let Some(metadata) = report.metadata {
      result.metadata.insert(id.to_string(), metadata);
    }
    if let Some(staged) = staged {
      self.store.commit(staged, id)?;
    }
    result.built.push(id.clone());
    transition(&mut state, StageState::Done, id);
    Ok(())
  }

  /// Materialize declared inputs under `dir`, one subdirectory per input.
  /// Source references are hardlinked from the blob store; pipeline
  /// references are cloned object trees.
  fn materialize_inputs(&self, inputs: &[InputPlan], dir: &std::path::Path) -> Result<Vec<(String, PathBuf)>> {
    let mut materialized = Vec::with_capacity(inputs.len());

    for input in inputs {
      let input_dir = dir.join(&input.name);
      std::fs::create_dir(&input_dir)?;

      match input.origin {
        InputOrigin::Source => {
          for reference in input.references.strings() {
            let hash = ContentHash::parse(reference)?;
            let blob = self.store.source_blob_path(&input.input_type, &hash);
            if !blob.is_file() {
              return Err(Error::SourceUnavailable {
                source_type: input.input_type.clone(),
                reason: format!("blob '{}' disappeared from the store", reference),
              });
            }
            std::fs::hard_link(&blob, input_dir.join(reference))?;
          }
        }
        InputOrigin::Pipeline => {
          let strategy = self.store.clone_strategy()?;
          for reference in input.references.strings() {
            let object = ObjectId::parse(reference)?;
            if !self.store.contains(&object) {
              return Err(Error::SourceUnavailable {
                source_type: input.input_type.clone(),
                reason: format!("object '{}' is not in the store", reference),
              });
            }
            let target = input_dir.join(reference);
            std::fs::create_dir(&target)?;
            clone::clone_tree(&self.store.object_path(&object), &target, strategy)?;
          }
        }
      }

      materialized.push((input.name.clone(), input_dir));
    }

    Ok(materialized)
  }
}

fn paths_socket_host(sandbox: &Sandbox) -> PathBuf {
  sandbox.api_dir_host.join(sandbox::API_SOCKET)
}

fn transition(state: &mut StageState, next: StageState, id: &ObjectId) {
  debug!(id = %id, from = ?state, to = ?next, "stage state");
  *state = next;
}

/// Infrastructure failures while assembling the stage environment are
/// sandbox errors; store-level conditions keep their own kind.
fn sandbox_error(id: &ObjectId, e: Error) -> Error {
  match e {
    Error::StorageFull
    | Error::StoreCorrupt(_)
    | Error::SourceUnavailable { .. }
    | Error::SourceInvalid { .. }
    | Error::ManifestInvalid(_) => e,
    other => Error::Sandbox {
      id: id.clone(),
      message: other.to_string(),
    },
  }
}

#[cfg(test)]
mod tests {
  use std::fs;
  use std::os::unix::fs::PermissionsExt;

  use serde_json::json;

  use super::*;

  struct Fixture {
    store: Store,
    registry: ModuleRegistry,
    _dir: tempfile::TempDir,
  }

  fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path().join("store")).unwrap();
    fs::create_dir_all(dir.path().join("lib/stages")).unwrap();
    fs::create_dir_all(dir.path().join("lib/assemblers")).unwrap();
    Fixture {
      store,
      registry: ModuleRegistry::new(dir.path().join("lib")),
      _dir: dir,
    }
  }

  fn install_stage(fixture: &Fixture, name: &str, script: &str) {
    let path = fixture.registry.libdir().join("stages").join(name);
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
  }

  fn executor(fixture: &Fixture) -> Executor<'_> {
    // Tests drive the direct-spawn sandbox; isolation has its own tests.
    Executor::new(&fixture.store, &fixture.registry, ExecutionConfig {
      isolate: Some(false),
      ..ExecutionConfig::default()
    })
  }

  fn noop_manifest() -> Manifest {
    Manifest::from_value(json!({
      "pipeline": {"stages": [{"name": "org.osbuild.noop"}]}
    }))
    .unwrap()
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn noop_pipeline_commits_one_empty_tree() {
    let fixture = fixture();
    install_stage(&fixture, "org.osbuild.noop", "#!/bin/sh\nexit 0\n");

    let manifest = noop_manifest();
    let plan = Plan::compile(&manifest, &fixture.registry).unwrap();
    let result = executor(&fixture).run(&manifest, &plan).await.unwrap();

    let expected = ObjectId::for_stage("org.osbuild.noop", None, None, &json!({}), &[]).unwrap();
    assert_eq!(result.built, vec![expected.clone()]);
    assert_eq!(result.tree, Some(expected.clone()));
    assert!(fixture.store.contains(&expected));
    // The tree is empty.
    assert_eq!(fs::read_dir(fixture.store.object_path(&expected)).unwrap().count(), 0);
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn second_run_executes_zero_stages() {
    let fixture = fixture();
    install_stage(&fixture, "org.osbuild.noop", "#!/bin/sh\nexit 0\n");

    let manifest = noop_manifest();
    let plan = Plan::compile(&manifest, &fixture.registry).unwrap();

    let first = executor(&fixture).run(&manifest, &plan).await.unwrap();
    assert_eq!(first.built.len(), 1);
    assert!(first.cached.is_empty());

    let second = executor(&fixture).run(&manifest, &plan).await.unwrap();
    assert!(second.built.is_empty());
    assert_eq!(second.cached, first.built);
    assert_eq!(second.tree, first.tree);
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn failing_stage_discards_its_tree_and_keeps_prior_objects() {
    let fixture = fixture();
    install_stage(&fixture, "org.osbuild.noop", "#!/bin/sh\nexit 0\n");
    install_stage(&fixture, "org.osbuild.fail", "#!/bin/sh\necho scribble >&2\nexit 1\n");

    let manifest = Manifest::from_value(json!({
      "pipeline": {
        "stages": [
          {"name": "org.osbuild.noop"},
          {"name": "org.osbuild.fail"}
        ]
      }
    }))
    .unwrap();
    let plan = Plan::compile(&manifest, &fixture.registry).unwrap();

    let err = executor(&fixture).run(&manifest, &plan).await.unwrap_err();
    let failed_id = plan.root().stages[1].id.clone();
    match &err {
      Error::StageFailed { id, logs, .. } => {
        assert_eq!(id, &failed_id);
        assert!(logs.contains("scribble"));
      }
      other => panic!("unexpected error: {}", other),
    }

    // No object under the failed id; the prior stage's object is retained.
    assert!(!fixture.store.contains(&failed_id));
    assert!(fixture.store.contains(&plan.root().stages[0].id));

    // tmp/ holds nothing but the lock file.
    let leftovers = fs::read_dir(fixture.store.root().join("tmp"))
      .unwrap()
      .filter(|e| e.as_ref().unwrap().file_name() != ".lock")
      .count();
    assert_eq!(leftovers, 0);
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn missing_source_blob_aborts_before_stages() {
    let fixture = fixture();
    install_stage(&fixture, "org.osbuild.copy", "#!/bin/sh\nexit 0\n");

    let reference = format!("sha256:{}", "a".repeat(64));
    let manifest = Manifest::from_value(json!({
      "pipeline": {
        "stages": [{
          "name": "org.osbuild.copy",
          "inputs": {
            "files": {
              "type": "org.osbuild.files",
              "origin": "org.osbuild.source",
              "references": [reference]
            }
          }
        }]
      }
    }))
    .unwrap();
    let plan = Plan::compile(&manifest, &fixture.registry).unwrap();

    let err = executor(&fixture).run(&manifest, &plan).await.unwrap_err();
    assert!(matches!(err, Error::SourceUnavailable { .. }));
    assert!(!fixture.store.contains(&plan.root().stages[0].id));
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn assembler_without_output_dir_is_rejected() {
    let fixture = fixture();
    install_stage(&fixture, "org.osbuild.noop", "#!/bin/sh\nexit 0\n");
    let assembler = fixture.registry.libdir().join("assemblers/org.osbuild.tar");
    fs::write(&assembler, "#!/bin/sh\nexit 0\n").unwrap();
    fs::set_permissions(&assembler, fs::Permissions::from_mode(0o755)).unwrap();

    let manifest = Manifest::from_value(json!({
      "pipeline": {
        "stages": [{"name": "org.osbuild.noop"}],
        "assembler": {"name": "org.osbuild.tar"}
      }
    }))
    .unwrap();
    let plan = Plan::compile(&manifest, &fixture.registry).unwrap();

    let err = executor(&fixture).run(&manifest, &plan).await.unwrap_err();
    assert!(matches!(err, Error::ManifestInvalid(_)));
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn missing_pipeline_reference_is_unavailable() {
    let fixture = fixture();
    install_stage(&fixture, "org.osbuild.copy", "#!/bin/sh\nexit 0\n");

    let manifest = Manifest::from_value(json!({
      "pipeline": {
        "stages": [{
          "name": "org.osbuild.copy",
          "inputs": {
            "tree": {
              "type": "org.osbuild.tree",
              "origin": "org.osbuild.pipeline",
              "references": [("b".repeat(64))]
            }
          }
        }]
      }
    }))
    .unwrap();
    let plan = Plan::compile(&manifest, &fixture.registry).unwrap();

    let err = executor(&fixture).run(&manifest, &plan).await.unwrap_err();
    assert!(matches!(err, Error::SourceUnavailable { .. }));
  }
}
