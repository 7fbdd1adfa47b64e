//! osforge: the pipeline execution engine.
//!
//! The engine turns a manifest into operating-system artifacts by driving a
//! sequence of isolated build stages against a content-addressed object
//! store. The pieces, leaves first:
//!
//! - [`store`]: content-addressed storage for filesystem trees and source
//!   blobs, with copy-on-write snapshots and advisory locking.
//! - [`sources`]: sandboxed fetcher programs that materialize blobs by
//!   content hash.
//! - [`hostapi`]: the per-stage control channel stages use to request
//!   arguments, scratch space and source paths, and to report back.
//! - [`sandbox`]: the mount-isolated environment a stage runs in.
//! - [`plan`] and [`pipeline`]: the manifest compiler and the executor that
//!   drives stages in order, committing successful trees to the store.

mod error;
pub mod hostapi;
pub mod modules;
pub mod pipeline;
pub mod plan;
pub mod sandbox;
pub mod sources;
pub mod store;

pub use error::{Error, StageException};
pub use modules::{detect_host_runner, ModuleInfo, ModuleKind, ModuleRegistry};
pub use pipeline::{ExecutionConfig, ExecutionResult, Executor};
pub use plan::Plan;
pub use store::Store;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
