//! Generator contract and per-generator derived state
//!
//! A generator is a plugin with two phases:
//!
//! 1. [`Generator::initialize`] runs once per driver (until it succeeds) and
//!    declares the pipeline through a [`PipelineBuilder`]
//! 2. [`Generator::execute`] runs on every full pass and, by default, seeds
//!    the pipeline's leaves and pulls its registered output stages
//!
//! Everything a generator produced in the last pass lives in its
//! [`GeneratorState`], which the driver carries from pass to pass.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;

use crate::config::DriverOptions;
use crate::error::{EngineError, Fault, Result};
use crate::evaluator::{PassEvaluator, PassTables, StepRecord};
use crate::pipeline::{Pipeline, PipelineBuilder};
use crate::types::{AdditionalInput, GeneratedOutput};

/// A plugin deriving outputs from snapshots of type `S`
pub trait Generator<S>: Send + Sync {
    /// Name used in events, errors and run results
    fn name(&self) -> &str;

    /// Declare the pipeline
    fn initialize(&self, builder: &mut PipelineBuilder<S>) -> Result<()>;

    /// Run the pipeline for the current pass
    fn execute(&self, context: &mut ExecutionContext<'_, S>) -> Result<()> {
        context.run_pipeline()
    }
}

type InitializeFn<S> = Arc<dyn Fn(&mut PipelineBuilder<S>) -> Result<()> + Send + Sync>;
type ExecuteFn<S> = Arc<dyn Fn(&mut ExecutionContext<'_, S>) -> Result<()> + Send + Sync>;

/// Closure-based [`Generator`]
///
/// Wraps an initialization closure, and optionally an execution closure,
/// for generators that don't need their own type.
pub struct FnGenerator<S> {
    name: String,
    initialize: InitializeFn<S>,
    execute: Option<ExecuteFn<S>>,
}

impl<S> FnGenerator<S> {
    pub fn new(
        name: impl Into<String>,
        initialize: impl Fn(&mut PipelineBuilder<S>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            initialize: Arc::new(initialize),
            execute: None,
        }
    }

    /// Replace the default execution step
    pub fn with_execute(
        mut self,
        execute: impl Fn(&mut ExecutionContext<'_, S>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.execute = Some(Arc::new(execute));
        self
    }
}

impl<S> Generator<S> for FnGenerator<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&self, builder: &mut PipelineBuilder<S>) -> Result<()> {
        (self.initialize)(builder)
    }

    fn execute(&self, context: &mut ExecutionContext<'_, S>) -> Result<()> {
        match &self.execute {
            Some(execute) => execute(context),
            None => context.run_pipeline(),
        }
    }
}

/// What a generator can see and do while it executes
pub struct ExecutionContext<'a, S> {
    generator: &'a str,
    pipeline: &'a Pipeline<S>,
    snapshot: &'a S,
    additional_inputs: &'a [AdditionalInput],
    options: &'a DriverOptions,
    pass: PassEvaluator,
    outputs: Vec<GeneratedOutput>,
    hint_names: HashSet<String>,
    stage_faults: Vec<Fault>,
}

impl<'a, S> ExecutionContext<'a, S> {
    pub(crate) fn new(
        generator: &'a str,
        pipeline: &'a Pipeline<S>,
        snapshot: &'a S,
        additional_inputs: &'a [AdditionalInput],
        options: &'a DriverOptions,
        pass: PassEvaluator,
    ) -> Self {
        Self {
            generator,
            pipeline,
            snapshot,
            additional_inputs,
            options,
            pass,
            outputs: Vec::new(),
            hint_names: HashSet::new(),
            stage_faults: Vec::new(),
        }
    }

    /// Name of the executing generator
    pub fn generator(&self) -> &str {
        self.generator
    }

    /// The snapshot being processed
    pub fn snapshot(&self) -> &S {
        self.snapshot
    }

    /// The driver's additional inputs
    pub fn additional_inputs(&self) -> &[AdditionalInput] {
        self.additional_inputs
    }

    /// The pass evaluator, for pulling stages directly
    pub fn pass(&mut self) -> &mut PassEvaluator {
        &mut self.pass
    }

    /// Feed every leaf stage of the pipeline
    pub fn seed_inputs(&mut self) {
        self.pipeline
            .seed(&mut self.pass, self.snapshot, self.additional_inputs);
    }

    /// Add an output for this pass; hint names must be unique per generator
    pub fn add_output(&mut self, output: GeneratedOutput) -> Result<()> {
        if !self.hint_names.insert(output.hint_name.clone()) {
            return Err(EngineError::DuplicateHintName {
                generator: self.generator.to_string(),
                hint_name: output.hint_name,
            });
        }
        self.outputs.push(output);
        Ok(())
    }

    /// Outputs added so far
    pub fn outputs(&self) -> &[GeneratedOutput] {
        &self.outputs
    }

    /// Pull every enabled registered output stage and add its live values
    ///
    /// A faulted output stage contributes nothing; its fault is recorded
    /// and the remaining stages are still collected.
    pub fn collect_registered_outputs(&mut self) -> Result<()> {
        for binding in self.pipeline.output_bindings() {
            if !self.options.is_enabled(binding.kind) {
                log::trace!(
                    "Skipping disabled {:?} output stage '{}'",
                    binding.kind,
                    binding.stage.name()
                );
                continue;
            }
            let table = self.pass.latest(&binding.stage)?;
            if let Some(fault) = table.fault() {
                self.stage_faults.push(fault.clone());
                continue;
            }
            for mut output in table.live_values() {
                output.kind = binding.kind;
                self.add_output(output)?;
            }
        }
        Ok(())
    }

    /// Seed the inputs and collect the registered outputs
    pub fn run_pipeline(&mut self) -> Result<()> {
        self.seed_inputs();
        self.collect_registered_outputs()
    }

    pub(crate) fn into_parts(self) -> (PassEvaluator, Vec<GeneratedOutput>, Vec<Fault>) {
        (self.pass, self.outputs, self.stage_faults)
    }
}

/// Result of the last pass for one generator
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratorRunResult {
    pub generator: String,
    pub outputs: Vec<GeneratedOutput>,
    /// Faults of registered output stages
    pub stage_faults: Vec<Fault>,
    /// Initialization or execution failure, if any
    pub error: Option<Fault>,
    pub steps: Vec<StepRecord>,
}

/// Derived state of one generator, carried between passes
pub struct GeneratorState<S> {
    pub(crate) pipeline: Option<Arc<Pipeline<S>>>,
    pub(crate) tables: PassTables,
    pub(crate) outputs: Arc<Vec<GeneratedOutput>>,
    pub(crate) stage_faults: Arc<Vec<Fault>>,
    pub(crate) error: Option<Fault>,
    pub(crate) steps: Arc<Vec<StepRecord>>,
}

impl<S> GeneratorState<S> {
    /// State of a generator that has not been initialized
    pub fn uninitialized() -> Self {
        Self {
            pipeline: None,
            tables: PassTables::new(),
            outputs: Arc::new(Vec::new()),
            stage_faults: Arc::new(Vec::new()),
            error: None,
            steps: Arc::new(Vec::new()),
        }
    }

    /// Whether the pipeline was declared successfully
    pub fn is_initialized(&self) -> bool {
        self.pipeline.is_some()
    }

    /// The declared pipeline
    pub fn pipeline(&self) -> Option<&Arc<Pipeline<S>>> {
        self.pipeline.as_ref()
    }

    /// Baseline tables for the next pass
    pub fn tables(&self) -> &PassTables {
        &self.tables
    }

    /// Outputs of the last pass
    pub fn outputs(&self) -> &[GeneratedOutput] {
        &self.outputs
    }

    /// Initialization or execution failure of the last pass
    pub fn error(&self) -> Option<&Fault> {
        self.error.as_ref()
    }

    pub(crate) fn run_result(&self, generator: &str) -> GeneratorRunResult {
        GeneratorRunResult {
            generator: generator.to_string(),
            outputs: self.outputs.as_ref().clone(),
            stage_faults: self.stage_faults.as_ref().clone(),
            error: self.error.clone(),
            steps: self.steps.as_ref().clone(),
        }
    }
}

impl<S> Clone for GeneratorState<S> {
    fn clone(&self) -> Self {
        Self {
            pipeline: self.pipeline.clone(),
            tables: self.tables.clone(),
            outputs: self.outputs.clone(),
            stage_faults: self.stage_faults.clone(),
            error: self.error.clone(),
            steps: self.steps.clone(),
        }
    }
}

impl<S> Default for GeneratorState<S> {
    fn default() -> Self {
        Self::uninitialized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OutputKind;

    struct Snapshot {
        names: Vec<String>,
    }

    fn greeter() -> FnGenerator<Snapshot> {
        FnGenerator::new("greeter", |builder: &mut PipelineBuilder<Snapshot>| {
            let names = builder.snapshot_input("names", |s: &Snapshot| s.names.clone());
            let sources = names.map("greet", |name| {
                GeneratedOutput::source(format!("{}.txt", name), format!("hello {}", name))
            });
            let implementations = names.map("impl", |name| {
                GeneratedOutput::source(format!("{}.impl", name), String::new())
            });
            builder.register_output(&sources);
            builder.register_implementation_output(&implementations);
            Ok(())
        })
    }

    fn execute(
        generator: &FnGenerator<Snapshot>,
        snapshot: &Snapshot,
        options: &DriverOptions,
    ) -> Result<(Vec<GeneratedOutput>, Vec<Fault>)> {
        let mut builder = PipelineBuilder::new(generator.name());
        generator.initialize(&mut builder)?;
        let pipeline = builder.build();

        let pass = PassEvaluator::new(PassTables::new());
        let mut context =
            ExecutionContext::new(generator.name(), &pipeline, snapshot, &[], options, pass);
        generator.execute(&mut context)?;
        let (_, outputs, faults) = context.into_parts();
        Ok((outputs, faults))
    }

    #[test]
    fn test_default_execution_collects_registered_outputs() {
        let snapshot = Snapshot {
            names: vec!["ada".to_string()],
        };
        let (outputs, faults) = execute(&greeter(), &snapshot, &DriverOptions::default()).unwrap();

        assert!(faults.is_empty());
        assert_eq!(
            outputs,
            vec![
                GeneratedOutput::source("ada.txt", "hello ada"),
                GeneratedOutput::implementation("ada.impl", ""),
            ]
        );
    }

    #[test]
    fn test_disabled_output_kinds_are_skipped() {
        let snapshot = Snapshot {
            names: vec!["ada".to_string()],
        };
        let options = DriverOptions::default().disable_output(OutputKind::Implementation);
        let (outputs, _) = execute(&greeter(), &snapshot, &options).unwrap();
        assert_eq!(outputs, vec![GeneratedOutput::source("ada.txt", "hello ada")]);
    }

    #[test]
    fn test_duplicate_hint_names_fail_execution() {
        let generator = FnGenerator::new("dup", |builder: &mut PipelineBuilder<Snapshot>| {
            let names = builder.snapshot_input("names", |s: &Snapshot| s.names.clone());
            let outputs = names.map("emit", |_| GeneratedOutput::source("same.txt", ""));
            builder.register_output(&outputs);
            Ok(())
        });
        let snapshot = Snapshot {
            names: vec!["a".to_string(), "b".to_string()],
        };

        let err = execute(&generator, &snapshot, &DriverOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::DuplicateHintName { ref hint_name, .. } if hint_name == "same.txt"
        ));
    }

    #[test]
    fn test_faulted_output_stage_is_recorded_and_skipped() {
        let generator = FnGenerator::new("partial", |builder: &mut PipelineBuilder<Snapshot>| {
            let names = builder.snapshot_input("names", |s: &Snapshot| s.names.clone());
            let good = names.map("good", |name| GeneratedOutput::source(name.clone(), ""));
            let bad =
                names.try_select_many("bad", |_| Err::<Vec<GeneratedOutput>, _>("unsupported"));
            builder.register_output(&bad);
            builder.register_output(&good);
            Ok(())
        });
        let snapshot = Snapshot {
            names: vec!["a".to_string()],
        };

        let (outputs, faults) = execute(&generator, &snapshot, &DriverOptions::default()).unwrap();
        assert_eq!(outputs, vec![GeneratedOutput::source("a", "")]);
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].stage(), Some("bad"));
    }

    #[test]
    fn test_custom_execute() {
        let generator = FnGenerator::new("manual", |_: &mut PipelineBuilder<Snapshot>| Ok(()))
            .with_execute(|context| {
                let count = context.snapshot().names.len();
                context.add_output(GeneratedOutput::source("count.txt", count.to_string()))
            });
        let snapshot = Snapshot {
            names: vec!["a".to_string(), "b".to_string()],
        };

        let (outputs, _) = execute(&generator, &snapshot, &DriverOptions::default()).unwrap();
        assert_eq!(outputs, vec![GeneratedOutput::source("count.txt", "2")]);
    }
}
