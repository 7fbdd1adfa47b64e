//! Manifest compilation.
//!
//! The planner walks the manifest's build-pipeline chain post-order and
//! computes, for every stage in execution order, the deterministic object
//! identifier of its invocation. Compiling the same manifest against the
//! same module library always yields the same identifier sequence; that is
//! the property the store's caching rests on.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde_json::Value;

use osforge_core::{InputOrigin, Manifest, ObjectId, Pipeline, References, Stage};

use crate::modules::{ModuleKind, ModuleRegistry};
use crate::Result;

/// A compiled manifest: pipelines in execution order, build pipelines first.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
  pub pipelines: Vec<PipelinePlan>,
}

/// One pipeline's resolved invocations.
#[derive(Debug, Clone, Serialize)]
pub struct PipelinePlan {
  /// Index of the pipeline providing this pipeline's runtime root, if any.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub build: Option<usize>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub runner: Option<String>,

  pub stages: Vec<StagePlan>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub assembler: Option<StagePlan>,
}

impl PipelinePlan {
  /// Identifier of this pipeline's final tree.
  pub fn result_id(&self) -> &ObjectId {
    // A validated pipeline has at least one stage.
    &self.stages.last().expect("pipeline without stages").id
  }
}

/// A single resolved stage or assembler invocation.
#[derive(Debug, Clone, Serialize)]
pub struct StagePlan {
  pub name: String,
  pub id: ObjectId,
  pub options: Value,
  pub inputs: Vec<InputPlan>,
}

/// A resolved input of a stage.
#[derive(Debug, Clone, Serialize)]
pub struct InputPlan {
  pub name: String,
  pub id: ObjectId,
  #[serde(rename = "type")]
  pub input_type: String,
  pub origin: InputOrigin,
  pub references: References,
}

/// Blobs one source type must provide, with per-reference metadata items.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceRequirement {
  pub checksums: BTreeSet<String>,
  pub items: BTreeMap<String, Value>,
}

impl Plan {
  /// Compile a validated manifest against a module library.
  pub fn compile(manifest: &Manifest, registry: &ModuleRegistry) -> Result<Plan> {
    let chain = manifest.pipeline.chain();
    let mut pipelines: Vec<PipelinePlan> = Vec::with_capacity(chain.len());

    for (index, pipeline) in chain.iter().enumerate() {
      // Each pipeline's runtime root is the previous pipeline in the chain.
      let build = index.checked_sub(1);
      let build_id = build.map(|b| pipelines[b].result_id().clone());
      pipelines.push(compile_pipeline(pipeline, build, build_id.as_ref(), registry)?);
    }

    Ok(Plan { pipelines })
  }

  /// The root pipeline (the one the manifest is about).
  pub fn root(&self) -> &PipelinePlan {
    // A plan always holds at least the root pipeline.
    self.pipelines.last().expect("empty plan")
  }

  /// Every stage identifier in execution order.
  pub fn stage_ids(&self) -> Vec<&ObjectId> {
    self
      .pipelines
      .iter()
      .flat_map(|p| p.stages.iter().chain(p.assembler.iter()))
      .map(|s| &s.id)
      .collect()
  }

  /// Group the source-origin references of all pipelines by source type.
  pub fn source_requirements(&self) -> BTreeMap<String, SourceRequirement> {
    let mut requirements: BTreeMap<String, SourceRequirement> = BTreeMap::new();
    for pipeline in &self.pipelines {
      for stage in pipeline.stages.iter().chain(pipeline.assembler.iter()) {
        for input in &stage.inputs {
          if input.origin != InputOrigin::Source {
            continue;
          }
          let requirement = requirements.entry(input.input_type.clone()).or_default();
          for reference in input.references.strings() {
            requirement.checksums.insert(reference.to_string());
          }
          if let Value::Object(keyed) = input.references.to_keyed_value() {
            for (reference, metadata) in keyed {
              if !metadata.is_null() {
                requirement.items.insert(reference, metadata);
              }
            }
          }
        }
      }
    }
    requirements
  }
}

fn compile_pipeline(
  pipeline: &Pipeline,
  build: Option<usize>,
  build_id: Option<&ObjectId>,
  registry: &ModuleRegistry,
) -> Result<PipelinePlan> {
  // Pipelines running inside a built tree resolve their modules from that
  // tree, so only host-rooted pipelines validate against the host library.
  let in_tree = build.is_some();

  let mut stages = Vec::with_capacity(pipeline.stages.len());
  let mut base: Option<ObjectId> = None;

  for stage in &pipeline.stages {
    let plan = compile_stage(stage, ModuleKind::Stage, build_id, base.as_ref(), in_tree, registry)?;
    base = Some(plan.id.clone());
    stages.push(plan);
  }

  let assembler = pipeline
    .assembler
    .as_ref()
    .map(|stage| compile_stage(stage, ModuleKind::Assembler, build_id, base.as_ref(), in_tree, registry))
    .transpose()?;

  Ok(PipelinePlan {
    build,
    runner: pipeline.runner.clone(),
    stages,
    assembler,
  })
}

fn compile_stage(
  stage: &Stage,
  kind: ModuleKind,
  build_id: Option<&ObjectId>,
  base: Option<&ObjectId>,
  in_tree: bool,
  registry: &ModuleRegistry,
) -> Result<StagePlan> {
  let info = registry.resolve(kind, &stage.name, in_tree)?;
  info.check_options(&stage.options)?;

  // Inputs resolve in name order; their identifiers feed the stage's.
  let mut inputs = Vec::with_capacity(stage.inputs.len());
  for (name, input) in &stage.inputs {
    let ordered = info.input_ordered(name);
    let id_value = input.references.to_id_value(ordered);
    let id = ObjectId::for_input(&input.input_type, input.origin.name(), &id_value)?;
    inputs.push(InputPlan {
      name: name.clone(),
      id,
      input_type: input.input_type.clone(),
      origin: input.origin,
      references: input.references.clone(),
    });
  }

  let input_ids: Vec<ObjectId> = inputs.iter().map(|i| i.id.clone()).collect();
  let id = ObjectId::for_stage(&stage.name, build_id, base, &stage.options, &input_ids)?;

  Ok(StagePlan {
    name: stage.name.clone(),
    id,
    options: stage.options.clone(),
    inputs,
  })
}
