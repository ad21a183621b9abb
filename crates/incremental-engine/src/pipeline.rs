//! Pipeline declaration
//!
//! A generator declares its stage graph once, in [`crate::Generator::initialize`],
//! through a [`PipelineBuilder`]. The builder hands out leaf stages bound to
//! the host snapshot or to the driver's additional inputs, and records which
//! stages produce outputs and which edit kinds the generator handles.
//!
//! # Example
//!
//! ```ignore
//! fn initialize(&self, builder: &mut PipelineBuilder<Program>) -> Result<()> {
//!     let types = builder.snapshot_input("types", |program: &Program| program.types.clone());
//!     let outputs = types.map("emit", |name| GeneratedOutput::source(name, "..."));
//!     builder.register_output(&outputs);
//!     Ok(())
//! }
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::edit::{EditContext, EditHandler, PendingEdit};
use crate::error::{panic_message, Fault, Result};
use crate::evaluator::PassEvaluator;
use crate::node::{Stage, StageInfo};
use crate::table::StateTable;
use crate::types::{AdditionalInput, GeneratedOutput, OutputKind, TableValue};

/// A leaf stage fed from the snapshot at the start of every pass
trait SnapshotInput<S>: Send + Sync {
    fn seed(&self, pass: &mut PassEvaluator, snapshot: &S);
}

type Selector<S, T> = Box<dyn Fn(&S) -> std::result::Result<Vec<T>, String> + Send + Sync>;

struct SnapshotBinding<S, T> {
    stage: Stage<T>,
    select: Selector<S, T>,
}

impl<S, T: TableValue> SnapshotInput<S> for SnapshotBinding<S, T> {
    fn seed(&self, pass: &mut PassEvaluator, snapshot: &S) {
        let message = match catch_unwind(AssertUnwindSafe(|| (self.select)(snapshot))) {
            Ok(Ok(values)) => {
                pass.add_input(&self.stage, values);
                return;
            }
            Ok(Err(message)) => message,
            Err(payload) => panic_message(payload.as_ref()),
        };
        log::debug!("Input stage '{}' faulted: {}", self.stage.name(), message);
        pass.set_table(
            &self.stage,
            StateTable::faulted(Fault::in_stage(self.stage.name(), message)),
        );
    }
}

/// A stage whose live values become generator outputs
#[derive(Clone)]
pub(crate) struct OutputBinding {
    pub(crate) stage: Stage<GeneratedOutput>,
    pub(crate) kind: OutputKind,
}

/// Everything about a declared pipeline that does not depend on the
/// snapshot type
#[derive(Clone)]
pub struct PipelineShape {
    generator: String,
    outputs: Vec<(StageInfo, OutputKind)>,
    edit_handlers: HashMap<String, EditHandler>,
}

impl PipelineShape {
    /// Name of the generator that declared the pipeline
    pub fn generator(&self) -> &str {
        &self.generator
    }

    /// Registered output stages and their kinds
    pub fn outputs(&self) -> &[(StageInfo, OutputKind)] {
        &self.outputs
    }

    /// Whether a handler is registered for this edit kind
    pub fn accepts_edit(&self, kind: &str) -> bool {
        self.edit_handlers.contains_key(kind)
    }

    /// The handler registered for this edit kind
    pub fn edit_handler(&self, kind: &str) -> Option<&EditHandler> {
        self.edit_handlers.get(kind)
    }

    /// Edit kinds this generator handles
    pub fn edit_kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.edit_handlers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

impl fmt::Debug for PipelineShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineShape")
            .field("generator", &self.generator)
            .field("outputs", &self.outputs)
            .field("edit_kinds", &self.edit_kinds())
            .finish()
    }
}

/// Declared stage graph of one generator
pub struct Pipeline<S> {
    shape: PipelineShape,
    inputs: Vec<Box<dyn SnapshotInput<S>>>,
    additional_inputs: Option<Stage<AdditionalInput>>,
    outputs: Vec<OutputBinding>,
}

impl<S> Pipeline<S> {
    /// The snapshot-independent part of the pipeline
    pub fn shape(&self) -> &PipelineShape {
        &self.shape
    }

    /// Feed every leaf stage for a new pass
    pub fn seed(
        &self,
        pass: &mut PassEvaluator,
        snapshot: &S,
        additional_inputs: &[AdditionalInput],
    ) {
        for input in &self.inputs {
            input.seed(pass, snapshot);
        }
        if let Some(stage) = &self.additional_inputs {
            pass.add_input(stage, additional_inputs.to_vec());
        }
    }

    pub(crate) fn output_bindings(&self) -> &[OutputBinding] {
        &self.outputs
    }
}

/// Collects a generator's stage graph during initialization
pub struct PipelineBuilder<S> {
    generator: String,
    inputs: Vec<Box<dyn SnapshotInput<S>>>,
    additional_inputs: Option<Stage<AdditionalInput>>,
    outputs: Vec<OutputBinding>,
    edit_handlers: HashMap<String, EditHandler>,
}

impl<S: 'static> PipelineBuilder<S> {
    /// Create a builder for the named generator
    pub fn new(generator: impl Into<String>) -> Self {
        Self {
            generator: generator.into(),
            inputs: Vec::new(),
            additional_inputs: None,
            outputs: Vec::new(),
            edit_handlers: HashMap::new(),
        }
    }

    /// Name of the generator being initialized
    pub fn generator(&self) -> &str {
        &self.generator
    }

    /// Leaf stage holding the values `select` extracts from each snapshot
    pub fn snapshot_input<T, F>(&mut self, name: impl Into<String>, select: F) -> Stage<T>
    where
        T: TableValue + PartialEq,
        F: Fn(&S) -> Vec<T> + Send + Sync + 'static,
    {
        self.bind(name, Box::new(move |snapshot| Ok(select(snapshot))))
    }

    /// Leaf stage whose selector can fail; an `Err` faults the stage for the pass
    pub fn try_snapshot_input<T, E, F>(&mut self, name: impl Into<String>, select: F) -> Stage<T>
    where
        T: TableValue + PartialEq,
        E: fmt::Display,
        F: Fn(&S) -> std::result::Result<Vec<T>, E> + Send + Sync + 'static,
    {
        self.bind(
            name,
            Box::new(move |snapshot| select(snapshot).map_err(|err| err.to_string())),
        )
    }

    fn bind<T>(&mut self, name: impl Into<String>, select: Selector<S, T>) -> Stage<T>
    where
        T: TableValue + PartialEq,
    {
        let stage = Stage::input(name);
        self.inputs.push(Box::new(SnapshotBinding {
            stage: stage.clone(),
            select,
        }));
        stage
    }

    /// Leaf stage holding the driver's additional inputs
    ///
    /// Every call returns the same stage.
    pub fn additional_inputs(&mut self) -> Stage<AdditionalInput> {
        self.additional_inputs
            .get_or_insert_with(|| Stage::input("additional_inputs"))
            .clone()
    }

    /// Register a stage producing source outputs
    pub fn register_output(&mut self, stage: &Stage<GeneratedOutput>) {
        self.register(stage, OutputKind::Source);
    }

    /// Register a stage producing implementation outputs
    pub fn register_implementation_output(&mut self, stage: &Stage<GeneratedOutput>) {
        self.register(stage, OutputKind::Implementation);
    }

    fn register(&mut self, stage: &Stage<GeneratedOutput>, kind: OutputKind) {
        if self.outputs.iter().any(|o| o.stage.id() == stage.id()) {
            log::warn!(
                "Generator '{}' registered output stage '{}' twice; ignoring",
                self.generator,
                stage.name()
            );
            return;
        }
        self.outputs.push(OutputBinding {
            stage: stage.clone(),
            kind,
        });
    }

    /// Handle pending edits of `kind` whose concrete type is `E`
    pub fn on_edit<E, F>(&mut self, kind: impl Into<String>, handler: F)
    where
        E: PendingEdit + 'static,
        F: Fn(&E, &mut EditContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        let erased: EditHandler = Arc::new(move |edit: &dyn Any, context: &mut EditContext<'_>| {
            match edit.downcast_ref::<E>() {
                Some(edit) => handler(edit, context),
                None => Err(context.reject(format!(
                    "expected edit of type {}",
                    std::any::type_name::<E>()
                ))),
            }
        });
        self.edit_handlers.insert(kind.into(), erased);
    }

    /// Finish the declaration
    pub fn build(self) -> Pipeline<S> {
        let outputs = self
            .outputs
            .iter()
            .map(|o| (o.stage.info().clone(), o.kind))
            .collect();
        Pipeline {
            shape: PipelineShape {
                generator: self.generator,
                outputs,
                edit_handlers: self.edit_handlers,
            },
            inputs: self.inputs,
            additional_inputs: self.additional_inputs,
            outputs: self.outputs,
        }
    }
}
