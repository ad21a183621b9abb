//! Incremental Engine - Incremental output generation over immutable snapshots
//!
//! This crate runs generator plugins over successive snapshots of a host
//! program. Each generator declares a pipeline of stages once; on every pass
//! the engine diffs the new inputs against the previous pass and only
//! recomputes what changed. It supports:
//!
//! - Per-entry change tracking (Added, Modified, Cached, Removed)
//! - Map, flat-map, collect and combine stages with custom comparers
//! - Fail-soft plugins: faults are contained per table, generator, edit and artifact
//! - Incremental edits that skip pipeline execution entirely
//! - Immutable drivers that can be shared across threads
//!
//! # Architecture
//!
//! - [`StateTable`]: one stage's output for one pass, grouped in slots
//! - [`Stage`]: a typed handle to a node in a generator's pipeline
//! - [`PassEvaluator`]: pull-based, memoizing evaluation of one pass
//! - [`GeneratorDriver`]: immutable driver owning generators and their state
//! - [`EventSink`]: generic event streaming for progress and recovered faults
//!
//! # Example
//!
//! ```ignore
//! use incremental_engine::{FnGenerator, GeneratedOutput, GeneratorDriver};
//!
//! let generator = FnGenerator::new("describer", |builder| {
//!     let types = builder.snapshot_input("types", |program: &Program| program.types.clone());
//!     let outputs = types.map("describe", |name| {
//!         GeneratedOutput::source(format!("{}.json", name), describe(name))
//!     });
//!     builder.register_output(&outputs);
//!     Ok(())
//! });
//!
//! let driver = GeneratorDriver::new(host).add_generators([Arc::new(generator) as _]);
//! let driver = driver.run_full_generation(Arc::new(program))?;
//! let assembled = driver.assembled_snapshot();
//! ```

pub mod assembly;
pub mod cancel;
pub mod combine;
pub mod config;
pub mod driver;
pub mod edit;
pub mod error;
pub mod evaluator;
pub mod events;
pub mod generator;
pub mod input;
pub mod node;
pub mod pipeline;
pub mod shared;
pub mod table;
pub mod transform;
pub mod types;

// Re-export key types
pub use assembly::{Artifact, SnapshotHost};
pub use cancel::CancellationFlag;
pub use combine::{CollectNode, CombineNode};
pub use config::DriverOptions;
pub use driver::{DriverRunResult, EditApplication, GeneratorDriver};
pub use edit::{AdditionalInputAdded, EditContext, PendingEdit, ADDITIONAL_INPUT_ADDED};
pub use error::{EngineError, Fault, Result};
pub use evaluator::{PassEvaluator, PassTables, StepRecord};
pub use events::{EngineEvent, EventError, EventSink, LogEventSink, NullEventSink, VecEventSink};
pub use generator::{ExecutionContext, FnGenerator, Generator, GeneratorRunResult, GeneratorState};
pub use input::{diff_inputs, InputNode};
pub use node::{Node, Stage, StageInfo};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineShape};
pub use shared::SharedDriver;
pub use table::{StateTable, StateTableBuilder};
pub use transform::MapNode;
pub use types::{AdditionalInput, EntryState, GeneratedOutput, OutputKind, StageId, TableValue};
