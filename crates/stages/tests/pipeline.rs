//! End-to-end pipeline scenarios, driven through the sample stage binaries.
//!
//! Each test assembles a module library out of the compiled sample
//! programs, runs manifests through the engine against a temporary store,
//! and checks the committed trees. The direct-spawn sandbox is used so the
//! suite runs unprivileged; one test exercises bubblewrap isolation when
//! the host supports it.

use std::fs;
use std::path::PathBuf;

use serde_json::json;
use tempfile::TempDir;

use osforge::{Error, ExecutionConfig, ExecutionResult, Executor, ModuleRegistry, Plan, Store};
use osforge_core::{HashAlgorithm, Manifest, ObjectId};

struct Harness {
  store: Store,
  registry: ModuleRegistry,
  output: PathBuf,
  dir: TempDir,
}

fn harness() -> Harness {
  let dir = TempDir::new().unwrap();
  let store = Store::new(dir.path().join("store")).unwrap();

  let libdir = dir.path().join("lib");
  for (kind, binary, name) in [
    ("stages", env!("CARGO_BIN_EXE_noop"), "org.osbuild.noop"),
    ("stages", env!("CARGO_BIN_EXE_mkfile"), "org.osbuild.mkfile"),
    ("stages", env!("CARGO_BIN_EXE_append"), "org.osbuild.append"),
    ("stages", env!("CARGO_BIN_EXE_copy"), "org.osbuild.copy"),
    ("assemblers", env!("CARGO_BIN_EXE_tar"), "org.osbuild.tar"),
    ("sources", env!("CARGO_BIN_EXE_download"), "org.osbuild.files"),
  ] {
    let target = libdir.join(kind);
    fs::create_dir_all(&target).unwrap();
    fs::copy(binary, target.join(name)).unwrap();
  }

  let output = dir.path().join("output");
  fs::create_dir_all(&output).unwrap();

  Harness {
    store,
    registry: ModuleRegistry::new(libdir),
    output,
    dir,
  }
}

impl Harness {
  fn plan(&self, manifest: &Manifest) -> Plan {
    Plan::compile(manifest, &self.registry).unwrap()
  }

  async fn execute(&self, manifest: &Manifest, plan: &Plan) -> osforge::Result<ExecutionResult> {
    self.execute_with(manifest, plan, Some(false)).await
  }

  async fn execute_with(
    &self,
    manifest: &Manifest,
    plan: &Plan,
    isolate: Option<bool>,
  ) -> osforge::Result<ExecutionResult> {
    let config = ExecutionConfig {
      output_dir: Some(self.output.clone()),
      isolate,
      ..ExecutionConfig::default()
    };
    Executor::new(&self.store, &self.registry, config).run(manifest, plan).await
  }

  /// Place a blob directly into the source store, returning its checksum.
  fn place_blob(&self, contents: &[u8]) -> String {
    let checksum = format!("sha256:{}", HashAlgorithm::Sha256.digest_bytes(contents));
    let dir = self.store.source_dir("org.osbuild.files").unwrap();
    fs::write(dir.join(&checksum), contents).unwrap();
    checksum
  }

  fn tmp_leftovers(&self) -> usize {
    fs::read_dir(self.store.root().join("tmp"))
      .unwrap()
      .filter(|e| e.as_ref().unwrap().file_name() != ".lock")
      .count()
  }
}

fn noop_manifest() -> Manifest {
  Manifest::from_value(json!({
    "pipeline": {"stages": [{"name": "org.osbuild.noop"}]}
  }))
  .unwrap()
}

// =============================================================================
// S1 — no-op pipeline
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn noop_pipeline_commits_an_empty_tree() {
  let h = harness();
  let manifest = noop_manifest();
  let plan = h.plan(&manifest);

  let result = h.execute(&manifest, &plan).await.unwrap();

  let expected = ObjectId::for_stage("org.osbuild.noop", None, None, &json!({}), &[]).unwrap();
  assert_eq!(result.built, vec![expected.clone()]);
  assert_eq!(result.tree, Some(expected.clone()));
  assert!(h.store.contains(&expected));
  assert_eq!(fs::read_dir(h.store.object_path(&expected)).unwrap().count(), 0);
  assert_eq!(h.tmp_leftovers(), 0);
}

// =============================================================================
// S2 — files input materialized from the source store
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn files_input_is_materialized_by_hash() {
  let h = harness();
  let checksum = h.place_blob(b"example payload");

  let manifest = Manifest::from_value(json!({
    "pipeline": {
      "stages": [{
        "name": "org.osbuild.copy",
        "inputs": {
          "files": {
            "type": "org.osbuild.files",
            "origin": "org.osbuild.source",
            "references": [checksum]
          }
        }
      }]
    }
  }))
  .unwrap();
  let plan = h.plan(&manifest);

  let result = h.execute(&manifest, &plan).await.unwrap();
  assert_eq!(result.built.len(), 1);

  // The stage saw exactly one file, named by its hash, and copied it over.
  let tree = h.store.object_path(plan.pipelines[0].result_id());
  let entries: Vec<_> = fs::read_dir(&tree).unwrap().map(|e| e.unwrap().file_name()).collect();
  assert_eq!(entries.len(), 1);
  assert_eq!(fs::read(tree.join(&entries[0])).unwrap(), b"example payload");
}

// =============================================================================
// S3 — two-stage chain, caching, identifier stability
// =============================================================================

fn chain_manifest(text: &str) -> Manifest {
  Manifest::from_value(json!({
    "pipeline": {
      "stages": [
        {"name": "org.osbuild.mkfile", "options": {"path": "/hello", "contents": "hello "}},
        {"name": "org.osbuild.append", "options": {"path": "/hello", "text": text}}
      ]
    }
  }))
  .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn two_stage_chain_builds_on_the_predecessor_tree() {
  let h = harness();
  let manifest = chain_manifest("world");
  let plan = h.plan(&manifest);

  let result = h.execute(&manifest, &plan).await.unwrap();
  assert_eq!(result.built.len(), 2);

  let tree = h.store.object_path(plan.pipelines[0].result_id());
  assert_eq!(fs::read_to_string(tree.join("hello")).unwrap(), "hello world");

  // A second identical run executes zero stages and lands on the same tree.
  let again = h.execute(&manifest, &plan).await.unwrap();
  assert!(again.built.is_empty());
  assert_eq!(again.cached, result.built);
  assert_eq!(again.tree, result.tree);

  // Changing the second stage's options leaves the first identifier alone.
  let modified = chain_manifest("moon");
  let modified_plan = h.plan(&modified);
  assert_eq!(modified_plan.pipelines[0].stages[0].id, plan.pipelines[0].stages[0].id);
  assert_ne!(modified_plan.pipelines[0].stages[1].id, plan.pipelines[0].stages[1].id);

  let rebuilt = h.execute(&modified, &modified_plan).await.unwrap();
  assert_eq!(rebuilt.built, vec![modified_plan.pipelines[0].stages[1].id.clone()]);
  assert_eq!(rebuilt.cached, vec![modified_plan.pipelines[0].stages[0].id.clone()]);

  let tree = h.store.object_path(modified_plan.pipelines[0].result_id());
  assert_eq!(fs::read_to_string(tree.join("hello")).unwrap(), "hello moon");
}

// =============================================================================
// S4 — stage failure
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn failing_stage_reports_its_exception_and_leaves_no_debris() {
  let h = harness();
  // mkfile without its required option raises over the API and exits 1.
  let manifest = Manifest::from_value(json!({
    "pipeline": {
      "stages": [
        {"name": "org.osbuild.noop"},
        {"name": "org.osbuild.mkfile", "options": {"contents": "orphan"}}
      ]
    }
  }))
  .unwrap();
  let plan = h.plan(&manifest);

  let err = h.execute(&manifest, &plan).await.unwrap_err();
  match err {
    Error::StageFailed { id, logs, exception, .. } => {
      assert_eq!(id, plan.pipelines[0].stages[1].id);
      assert!(logs.contains("missing option 'path'"));
      let exception = exception.expect("stage should have raised");
      assert_eq!(exception.kind, "StageError");
      assert!(exception.message.contains("path"));
    }
    other => panic!("unexpected error: {}", other),
  }

  assert!(!h.store.contains(&plan.pipelines[0].stages[1].id));
  assert!(h.store.contains(&plan.pipelines[0].stages[0].id));
  assert_eq!(h.tmp_leftovers(), 0);
}

// =============================================================================
// Assembler + metadata
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn assembler_archives_the_tree_into_the_output_directory() {
  let h = harness();
  let manifest = Manifest::from_value(json!({
    "pipeline": {
      "stages": [
        {"name": "org.osbuild.mkfile", "options": {"path": "/greeting", "contents": "hi"}}
      ],
      "assembler": {"name": "org.osbuild.tar", "options": {"filename": "image.tar"}}
    }
  }))
  .unwrap();
  let plan = h.plan(&manifest);

  let result = h.execute(&manifest, &plan).await.unwrap();
  let assembler = plan.pipelines[0].assembler.as_ref().unwrap();

  // The artifact exists and is not a tree object.
  assert_eq!(result.artifact, Some(h.output.clone()));
  assert!(result.built.contains(&assembler.id));
  assert!(!h.store.contains(&assembler.id));

  let archive_path = h.output.join("image.tar");
  let mut archive = tar::Archive::new(fs::File::open(&archive_path).unwrap());
  let mut found = None;
  for entry in archive.entries().unwrap() {
    let mut entry = entry.unwrap();
    if entry.path().unwrap().ends_with("greeting") {
      let mut contents = String::new();
      std::io::Read::read_to_string(&mut entry, &mut contents).unwrap();
      found = Some(contents);
    }
  }
  assert_eq!(found.as_deref(), Some("hi"));

  // Metadata reported by the assembler is attached to its identifier.
  let metadata = &result.metadata[assembler.id.as_str()];
  assert_eq!(metadata["filename"], json!("image.tar"));
  assert!(metadata["size"].as_u64().unwrap() > 0);
}

// =============================================================================
// Source fetcher
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn download_fetcher_provides_missing_blobs() {
  let h = harness();

  let payload = b"downloaded bytes";
  let checksum = format!("sha256:{}", HashAlgorithm::Sha256.digest_bytes(payload));
  let remote = h.dir.path().join("payload.bin");
  fs::write(&remote, payload).unwrap();

  let manifest = Manifest::from_value(json!({
    "pipeline": {
      "stages": [{
        "name": "org.osbuild.copy",
        "inputs": {
          "files": {
            "type": "org.osbuild.files",
            "origin": "org.osbuild.source",
            "references": [checksum.as_str()]
          }
        }
      }]
    },
    "sources": {
      "org.osbuild.files": {
        "urls": {
          (checksum.as_str()): format!("file://{}", remote.display())
        }
      }
    }
  }))
  .unwrap();
  let plan = h.plan(&manifest);

  let result = h.execute(&manifest, &plan).await.unwrap();
  assert_eq!(result.built.len(), 1);

  // The blob is now in the store and in the fetcher's cache.
  let hash = osforge_core::ContentHash::parse(&checksum).unwrap();
  assert_eq!(fs::read(h.store.source_blob_path("org.osbuild.files", &hash)).unwrap(), payload);
  assert!(h.store.root().join("cache/org.osbuild.files").join(&checksum).is_file());

  let tree = h.store.object_path(plan.pipelines[0].result_id());
  assert_eq!(fs::read(tree.join(&checksum)).unwrap(), payload);
}

// =============================================================================
// S6 — build pipeline provides the runtime root
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn build_pipeline_supplies_the_stage_binaries() {
  let h = harness();

  // The build pipeline installs the noop binary into the tree's library;
  // the outer pipeline then resolves it from there, not from the host.
  let noop_binary = fs::read(env!("CARGO_BIN_EXE_noop")).unwrap();
  let checksum = h.place_blob(&noop_binary);

  let manifest = Manifest::from_value(json!({
    "pipeline": {
      "build": {
        "stages": [{
          "name": "org.osbuild.copy",
          "options": {
            "paths": [{
              "from": checksum.as_str(),
              "to": "/usr/lib/osbuild/stages/org.osbuild.noop",
              "mode": 0o755
            }]
          },
          "inputs": {
            "files": {
              "type": "org.osbuild.files",
              "origin": "org.osbuild.source",
              "references": [checksum.as_str()]
            }
          }
        }]
      },
      "stages": [{"name": "org.osbuild.noop"}]
    }
  }))
  .unwrap();
  let plan = h.plan(&manifest);

  let result = h.execute(&manifest, &plan).await.unwrap();
  assert_eq!(result.built.len(), 2);

  // The outer stage ran against the built root and produced an empty tree.
  let outer = h.store.object_path(plan.root().result_id());
  assert_eq!(fs::read_dir(outer).unwrap().count(), 0);

  // The same stage under the host root has a different identifier (S6).
  let host_noop = ObjectId::for_stage("org.osbuild.noop", None, None, &json!({}), &[]).unwrap();
  assert_ne!(plan.root().stages[0].id, host_noop);
}

// =============================================================================
// Isolation (requires a working bubblewrap; skipped otherwise)
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn isolated_stage_builds_the_same_tree() {
  if !osforge::sandbox::isolation_available() {
    eprintln!("bwrap not usable here, skipping isolation test");
    return;
  }

  let h = harness();
  let manifest = Manifest::from_value(json!({
    "pipeline": {
      "stages": [
        {"name": "org.osbuild.mkfile", "options": {"path": "/etc/greeting", "contents": "isolated"}}
      ]
    }
  }))
  .unwrap();
  let plan = h.plan(&manifest);

  let result = h.execute_with(&manifest, &plan, Some(true)).await.unwrap();
  assert_eq!(result.built.len(), 1);

  let tree = h.store.object_path(plan.pipelines[0].result_id());
  assert_eq!(fs::read_to_string(tree.join("etc/greeting")).unwrap(), "isolated");
}

// =============================================================================
// Inspection-style invariants
// =============================================================================

#[test]
fn planning_twice_yields_identical_identifier_sequences() {
  let h = harness();
  let manifest = chain_manifest("world");

  let first = h.plan(&manifest);
  let second = h.plan(&manifest);
  assert_eq!(
    serde_json::to_value(&first).unwrap(),
    serde_json::to_value(&second).unwrap()
  );
}

#[test]
fn corrupt_source_blob_reference_is_rejected() {
  // Invariant 4 at the manifest boundary: a reference that is not a valid
  // content hash never reaches the store.
  let result = Manifest::from_value(json!({
    "pipeline": {
      "stages": [{
        "name": "org.osbuild.copy",
        "inputs": {
          "files": {
            "type": "org.osbuild.files",
            "origin": "org.osbuild.source",
            "references": ["sha256:not-hex"]
          }
        }
      }]
    }
  }));
  assert!(result.is_err());
}
