//! Generator driver
//!
//! [`GeneratorDriver`] is an immutable value. Every operation returns a new
//! driver built from the previous one's [`DriverState`]; fields that did not
//! change are shared through their `Arc`s, so keeping an old driver around
//! is cheap and always safe.
//!
//! # Operations
//!
//! - **Full pass** ([`GeneratorDriver::run_full_generation`]): initialize
//!   generators that are not yet initialized, execute every generator's
//!   pipeline on top of its previous tables, then assemble the outputs into
//!   the snapshot
//! - **Incremental** ([`GeneratorDriver::try_apply_edits`]): hand the queued
//!   edits to the generators that accept them and re-assemble, without
//!   executing any pipeline
//! - **Mutators**: change generators, additional inputs, queued edits or
//!   options
//!
//! Plugin failures never fail an operation. They are captured, reported to
//! the [`EventSink`] and visible in [`GeneratorDriver::run_result`]. The only
//! error a full pass returns is [`EngineError::Cancelled`].

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::assembly::{assemble, SnapshotHost};
use crate::cancel::CancellationFlag;
use crate::config::DriverOptions;
use crate::edit::{EditContext, PendingEdit};
use crate::error::{panic_message, EngineError, Fault, Result};
use crate::evaluator::PassEvaluator;
use crate::events::{emit, EngineEvent, EventSink, LogEventSink};
use crate::generator::{ExecutionContext, Generator, GeneratorRunResult, GeneratorState};
use crate::pipeline::{Pipeline, PipelineBuilder, PipelineShape};
use crate::types::{AdditionalInput, GeneratedOutput};

/// Everything a driver knows, replaced wholesale by every operation
pub struct DriverState<S> {
    generators: Arc<Vec<Arc<dyn Generator<S>>>>,
    /// Aligned with `generators`
    generator_states: Arc<Vec<GeneratorState<S>>>,
    additional_inputs: Arc<Vec<AdditionalInput>>,
    pending_edits: Arc<Vec<Arc<dyn PendingEdit>>>,
    edits_failed: bool,
    snapshot: Option<Arc<S>>,
    assembled: Option<Arc<S>>,
    options: Arc<DriverOptions>,
}

impl<S> DriverState<S> {
    fn new(options: DriverOptions) -> Self {
        Self {
            generators: Arc::new(Vec::new()),
            generator_states: Arc::new(Vec::new()),
            additional_inputs: Arc::new(Vec::new()),
            pending_edits: Arc::new(Vec::new()),
            edits_failed: false,
            snapshot: None,
            assembled: None,
            options: Arc::new(options),
        }
    }
}

impl<S> Clone for DriverState<S> {
    fn clone(&self) -> Self {
        Self {
            generators: self.generators.clone(),
            generator_states: self.generator_states.clone(),
            additional_inputs: self.additional_inputs.clone(),
            pending_edits: self.pending_edits.clone(),
            edits_failed: self.edits_failed,
            snapshot: self.snapshot.clone(),
            assembled: self.assembled.clone(),
            options: self.options.clone(),
        }
    }
}

/// Outputs and failures of the last operation, per generator
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverRunResult {
    pub generators: Vec<GeneratorRunResult>,
}

impl DriverRunResult {
    /// Every output, in generator order
    pub fn outputs(&self) -> impl Iterator<Item = &GeneratedOutput> + '_ {
        self.generators.iter().flat_map(|g| g.outputs.iter())
    }

    /// Results of generators that failed to initialize or execute
    pub fn failed(&self) -> impl Iterator<Item = &GeneratorRunResult> + '_ {
        self.generators.iter().filter(|g| g.error.is_some())
    }
}

/// Outcome of [`GeneratorDriver::try_apply_edits`]
///
/// The driver is returned on failure as well: a rejected edit leaves a
/// driver that refuses further incremental application until a full pass.
pub struct EditApplication<S> {
    pub driver: GeneratorDriver<S>,
    pub outcome: Result<Arc<S>>,
}

/// Immutable driver running generators over snapshots of type `S`
pub struct GeneratorDriver<S> {
    state: DriverState<S>,
    host: Arc<dyn SnapshotHost<S>>,
    sink: Arc<dyn EventSink>,
}

impl<S> Clone for GeneratorDriver<S> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            host: self.host.clone(),
            sink: self.sink.clone(),
        }
    }
}

impl<S> fmt::Debug for GeneratorDriver<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let generators: Vec<&str> = self.state.generators.iter().map(|g| g.name()).collect();
        f.debug_struct("GeneratorDriver")
            .field("generators", &generators)
            .field("additional_inputs", &self.state.additional_inputs.len())
            .field("pending_edits", &self.state.pending_edits.len())
            .field("edits_failed", &self.state.edits_failed)
            .field("has_assembled", &self.state.assembled.is_some())
            .finish()
    }
}

impl<S: Send + Sync + 'static> GeneratorDriver<S> {
    /// Create a driver with no generators, reporting events to `log`
    pub fn new(host: impl SnapshotHost<S> + 'static) -> Self {
        Self {
            state: DriverState::new(DriverOptions::default()),
            host: Arc::new(host),
            sink: Arc::new(LogEventSink),
        }
    }

    /// Report events to `sink` instead
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// The registered generators
    pub fn generators(&self) -> &[Arc<dyn Generator<S>>] {
        &self.state.generators
    }

    /// Derived state of each generator, aligned with [`Self::generators`]
    pub fn generator_states(&self) -> &[GeneratorState<S>] {
        &self.state.generator_states
    }

    /// The driver's additional inputs
    pub fn additional_inputs(&self) -> &[AdditionalInput] {
        &self.state.additional_inputs
    }

    /// Edits queued for the next operation
    pub fn pending_edits(&self) -> &[Arc<dyn PendingEdit>] {
        &self.state.pending_edits
    }

    /// Whether queued edits may be applied incrementally
    pub fn edits_valid(&self) -> bool {
        !self.state.edits_failed
    }

    /// Current options
    pub fn options(&self) -> &DriverOptions {
        &self.state.options
    }

    /// The snapshot of the last successful operation
    pub fn snapshot(&self) -> Option<&Arc<S>> {
        self.state.snapshot.as_ref()
    }

    /// The assembled snapshot of the last successful operation
    ///
    /// `None` until a pass or edit application succeeds, and again after any
    /// mutator.
    pub fn assembled_snapshot(&self) -> Option<&Arc<S>> {
        self.state.assembled.as_ref()
    }

    /// Outputs and failures of the last operation
    pub fn run_result(&self) -> DriverRunResult {
        DriverRunResult {
            generators: self
                .state
                .generators
                .iter()
                .zip(self.state.generator_states.iter())
                .map(|(generator, state)| state.run_result(generator.name()))
                .collect(),
        }
    }

    fn with_state(&self, state: DriverState<S>) -> Self {
        Self {
            state,
            host: self.host.clone(),
            sink: self.sink.clone(),
        }
    }

    // ========================================================================
    // Full pass
    // ========================================================================

    /// Run every generator over `snapshot` and assemble the result
    pub fn run_full_generation(&self, snapshot: Arc<S>) -> Result<Self> {
        self.run_full_generation_with_cancellation(snapshot, &CancellationFlag::new())
    }

    /// Like [`Self::run_full_generation`], checking `cancellation` at every
    /// stage boundary
    ///
    /// On cancellation this driver is left as it was and `Err(Cancelled)` is
    /// returned.
    pub fn run_full_generation_with_cancellation(
        &self,
        snapshot: Arc<S>,
        cancellation: &CancellationFlag,
    ) -> Result<Self> {
        let run_id = Uuid::new_v4().to_string();

        if let (Some(previous), Some(_)) = (&self.state.snapshot, &self.state.assembled) {
            if Arc::ptr_eq(previous, &snapshot) {
                log::debug!("[{}] Snapshot already processed, reusing result", run_id);
                emit(self.sink.as_ref(), EngineEvent::PassReused { run_id });
                return Ok(self.clone());
            }
        }

        log::debug!(
            "[{}] Full pass over {} generators",
            run_id,
            self.state.generators.len()
        );
        emit(
            self.sink.as_ref(),
            EngineEvent::PassStarted {
                run_id: run_id.clone(),
                generators: self.state.generators.len(),
            },
        );

        let additional_inputs =
            commit_edits(&self.state.pending_edits, &self.state.additional_inputs);

        let mut states = Vec::with_capacity(self.state.generators.len());
        for (generator, state) in self
            .state
            .generators
            .iter()
            .zip(self.state.generator_states.iter())
        {
            states.push(self.run_generator(
                generator.as_ref(),
                state,
                &snapshot,
                &additional_inputs,
                cancellation,
                &run_id,
            )?);
        }

        let assembled = self.assemble(&snapshot, &states, &run_id);
        let output_count = states.iter().map(|s| s.outputs.len()).sum();
        let failed_generators = states.iter().filter(|s| s.error.is_some()).count();
        log::debug!(
            "[{}] Full pass complete: {} outputs, {} failed generators",
            run_id,
            output_count,
            failed_generators
        );
        emit(
            self.sink.as_ref(),
            EngineEvent::PassCompleted {
                run_id,
                outputs: output_count,
                failed_generators,
            },
        );

        Ok(self.with_state(DriverState {
            generator_states: Arc::new(states),
            additional_inputs: Arc::new(additional_inputs),
            pending_edits: Arc::new(Vec::new()),
            edits_failed: false,
            snapshot: Some(snapshot),
            assembled: Some(assembled),
            ..self.state.clone()
        }))
    }

    /// Initialize (if needed) and execute one generator
    ///
    /// Returns `Err` only on cancellation.
    fn run_generator(
        &self,
        generator: &dyn Generator<S>,
        state: &GeneratorState<S>,
        snapshot: &S,
        additional_inputs: &[AdditionalInput],
        cancellation: &CancellationFlag,
        run_id: &str,
    ) -> Result<GeneratorState<S>> {
        let name = generator.name();
        let pipeline = match &state.pipeline {
            Some(pipeline) => pipeline.clone(),
            None => match initialize(generator) {
                Ok(pipeline) => {
                    log::debug!("[{}] Generator '{}' initialized", run_id, name);
                    Arc::new(pipeline)
                }
                Err(fault) => {
                    emit(
                        self.sink.as_ref(),
                        EngineEvent::GeneratorInitializationFailed {
                            run_id: run_id.to_string(),
                            generator: name.to_string(),
                            error: fault.to_string(),
                        },
                    );
                    return Ok(GeneratorState {
                        error: Some(fault),
                        ..GeneratorState::uninitialized()
                    });
                }
            },
        };

        let pass = PassEvaluator::new(state.tables.clone())
            .with_cancellation(cancellation.clone())
            .with_step_tracking(self.state.options.track_incremental_steps);

        let executed = {
            let mut context = ExecutionContext::new(
                name,
                &pipeline,
                snapshot,
                additional_inputs,
                &self.state.options,
                pass,
            );
            match catch_unwind(AssertUnwindSafe(|| generator.execute(&mut context))) {
                Ok(Ok(())) => Ok(context.into_parts()),
                Ok(Err(e)) if e.is_cancelled() => {
                    log::debug!("[{}] Pass cancelled in generator '{}'", run_id, name);
                    return Err(e);
                }
                Ok(Err(e)) => Err(execution_fault(name, e.to_string())),
                Err(payload) => Err(execution_fault(name, panic_message(payload.as_ref()))),
            }
        };

        match executed {
            Ok((pass, outputs, stage_faults)) => {
                for fault in &stage_faults {
                    emit(
                        self.sink.as_ref(),
                        EngineEvent::StageFaulted {
                            run_id: run_id.to_string(),
                            generator: name.to_string(),
                            stage: fault.stage().map(str::to_string),
                            error: fault.message().to_string(),
                        },
                    );
                }
                let (tables, steps) = pass.finish();
                Ok(GeneratorState {
                    pipeline: Some(pipeline),
                    tables,
                    outputs: Arc::new(outputs),
                    stage_faults: Arc::new(stage_faults),
                    error: None,
                    steps: Arc::new(steps),
                })
            }
            Err(fault) => {
                emit(
                    self.sink.as_ref(),
                    EngineEvent::GeneratorExecutionFailed {
                        run_id: run_id.to_string(),
                        generator: name.to_string(),
                        error: fault.to_string(),
                    },
                );
                // The previous tables stay the baseline for the next pass.
                Ok(GeneratorState {
                    pipeline: Some(pipeline),
                    tables: state.tables.clone(),
                    error: Some(fault),
                    ..GeneratorState::uninitialized()
                })
            }
        }
    }

    fn assemble(&self, snapshot: &Arc<S>, states: &[GeneratorState<S>], run_id: &str) -> Arc<S> {
        let outputs = self
            .state
            .generators
            .iter()
            .zip(states.iter())
            .flat_map(|(generator, state)| {
                state
                    .outputs
                    .iter()
                    .map(move |output| (generator.name(), output))
            });
        assemble(self.host.as_ref(), snapshot, outputs, self.sink.as_ref(), run_id)
    }

    // ========================================================================
    // Incremental edits
    // ========================================================================

    /// Apply the queued edits without running any pipeline
    ///
    /// Fails immediately with [`EngineError::NoPendingEdits`] or
    /// [`EngineError::EditsInvalidated`]. If any generator rejects an edit,
    /// nothing is applied, the returned driver refuses further incremental
    /// application and the caller must run a full pass.
    pub fn try_apply_edits(&self, snapshot: Arc<S>) -> EditApplication<S> {
        let run_id = Uuid::new_v4().to_string();
        if self.state.pending_edits.is_empty() {
            return self.edit_failure(EngineError::NoPendingEdits);
        }
        if self.state.edits_failed {
            return self.edit_failure(EngineError::EditsInvalidated);
        }

        let mut states: Vec<GeneratorState<S>> = self.state.generator_states.as_ref().clone();
        for edit in self.state.pending_edits.iter() {
            for (generator, state) in self.state.generators.iter().zip(states.iter_mut()) {
                let Some(pipeline) = state.pipeline.clone() else {
                    continue;
                };
                if !edit.accepted_by(pipeline.shape()) {
                    continue;
                }
                match apply_edit(
                    edit.as_ref(),
                    pipeline.shape(),
                    generator.name(),
                    &self.state.additional_inputs,
                    &state.outputs,
                ) {
                    Ok(outputs) => state.outputs = Arc::new(outputs),
                    Err(e) => {
                        log::warn!("[{}] {}", run_id, e);
                        emit(
                            self.sink.as_ref(),
                            EngineEvent::EditRejected {
                                run_id,
                                kind: edit.kind().to_string(),
                                generator: generator.name().to_string(),
                                error: e.to_string(),
                            },
                        );
                        let driver = self.with_state(DriverState {
                            edits_failed: true,
                            ..self.state.clone()
                        });
                        return EditApplication {
                            driver,
                            outcome: Err(e),
                        };
                    }
                }
            }
        }

        let additional_inputs =
            commit_edits(&self.state.pending_edits, &self.state.additional_inputs);
        let assembled = self.assemble(&snapshot, &states, &run_id);
        let count = self.state.pending_edits.len();
        log::debug!("[{}] Applied {} edits incrementally", run_id, count);
        emit(self.sink.as_ref(), EngineEvent::EditsApplied { run_id, count });

        let driver = self.with_state(DriverState {
            generator_states: Arc::new(states),
            additional_inputs: Arc::new(additional_inputs),
            pending_edits: Arc::new(Vec::new()),
            snapshot: Some(snapshot),
            assembled: Some(assembled.clone()),
            ..self.state.clone()
        });
        EditApplication {
            driver,
            outcome: Ok(assembled),
        }
    }

    fn edit_failure(&self, error: EngineError) -> EditApplication<S> {
        log::debug!("Incremental application refused: {}", error);
        EditApplication {
            driver: self.clone(),
            outcome: Err(error),
        }
    }

    // ========================================================================
    // Mutators
    // ========================================================================
    //
    // Every mutator clears the assembled snapshot, so the next full pass runs
    // even when it is handed the snapshot that was last processed.

    /// Add generators; queued edits can no longer be applied incrementally
    pub fn add_generators(
        &self,
        generators: impl IntoIterator<Item = Arc<dyn Generator<S>>>,
    ) -> Self {
        let mut all = self.state.generators.as_ref().clone();
        let mut states = self.state.generator_states.as_ref().clone();
        for generator in generators {
            all.push(generator);
            states.push(GeneratorState::uninitialized());
        }
        self.with_state(DriverState {
            generators: Arc::new(all),
            generator_states: Arc::new(states),
            edits_failed: true,
            assembled: None,
            ..self.state.clone()
        })
    }

    /// Remove generators by identity; queued edits can no longer be applied
    /// incrementally
    pub fn remove_generators(&self, generators: &[Arc<dyn Generator<S>>]) -> Self {
        let (kept, states): (Vec<_>, Vec<_>) = self
            .state
            .generators
            .iter()
            .zip(self.state.generator_states.iter())
            .filter(|(generator, _)| !generators.iter().any(|g| same_generator(g, generator)))
            .map(|(generator, state)| (generator.clone(), state.clone()))
            .unzip();
        self.with_state(DriverState {
            generators: Arc::new(kept),
            generator_states: Arc::new(states),
            edits_failed: true,
            assembled: None,
            ..self.state.clone()
        })
    }

    /// Replace the generator list
    ///
    /// Generators present before and after keep their state; queued edits
    /// can no longer be applied incrementally.
    pub fn replace_generators(&self, generators: Vec<Arc<dyn Generator<S>>>) -> Self {
        let states = generators
            .iter()
            .map(|generator| {
                self.state
                    .generators
                    .iter()
                    .position(|g| same_generator(g, generator))
                    .map(|i| self.state.generator_states[i].clone())
                    .unwrap_or_default()
            })
            .collect();
        self.with_state(DriverState {
            generators: Arc::new(generators),
            generator_states: Arc::new(states),
            edits_failed: true,
            assembled: None,
            ..self.state.clone()
        })
    }

    /// Append additional inputs
    pub fn add_additional_inputs(&self, inputs: impl IntoIterator<Item = AdditionalInput>) -> Self {
        let mut all = self.state.additional_inputs.as_ref().clone();
        all.extend(inputs);
        self.with_state(DriverState {
            additional_inputs: Arc::new(all),
            assembled: None,
            ..self.state.clone()
        })
    }

    /// Remove additional inputs equal to any of `inputs`
    pub fn remove_additional_inputs(&self, inputs: &[AdditionalInput]) -> Self {
        let kept = self
            .state
            .additional_inputs
            .iter()
            .filter(|input| !inputs.contains(input))
            .cloned()
            .collect();
        self.with_state(DriverState {
            additional_inputs: Arc::new(kept),
            assembled: None,
            ..self.state.clone()
        })
    }

    /// Replace one additional input in place
    ///
    /// Returns an unchanged driver if `old` is not present.
    pub fn replace_additional_input(&self, old: &AdditionalInput, new: AdditionalInput) -> Self {
        let Some(index) = self.state.additional_inputs.iter().position(|i| i == old) else {
            log::debug!("Additional input '{}' not found; nothing replaced", old.path);
            return self.clone();
        };
        let mut all = self.state.additional_inputs.as_ref().clone();
        all[index] = new;
        self.with_state(DriverState {
            additional_inputs: Arc::new(all),
            assembled: None,
            ..self.state.clone()
        })
    }

    /// Queue edits after the ones already pending
    pub fn with_pending_edits(
        &self,
        edits: impl IntoIterator<Item = Arc<dyn PendingEdit>>,
    ) -> Self {
        let mut all = self.state.pending_edits.as_ref().clone();
        all.extend(edits);
        self.with_state(DriverState {
            pending_edits: Arc::new(all),
            assembled: None,
            ..self.state.clone()
        })
    }

    /// Replace the options used by subsequent passes
    pub fn with_options(&self, options: DriverOptions) -> Self {
        self.with_state(DriverState {
            options: Arc::new(options),
            assembled: None,
            ..self.state.clone()
        })
    }
}

/// Generators are identified by allocation, not by name
fn same_generator<S>(a: &Arc<dyn Generator<S>>, b: &Arc<dyn Generator<S>>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Run a generator's declaration callback
fn initialize<S: 'static>(generator: &dyn Generator<S>) -> std::result::Result<Pipeline<S>, Fault> {
    let mut builder = PipelineBuilder::new(generator.name());
    let message = match catch_unwind(AssertUnwindSafe(|| generator.initialize(&mut builder))) {
        Ok(Ok(())) => return Ok(builder.build()),
        Ok(Err(e)) => e.to_string(),
        Err(payload) => panic_message(payload.as_ref()),
    };
    Err(Fault::from_error(&EngineError::Initialization {
        generator: generator.name().to_string(),
        message,
    }))
}

fn execution_fault(generator: &str, message: String) -> Fault {
    Fault::from_error(&EngineError::Execution {
        generator: generator.to_string(),
        message,
    })
}

/// Apply one edit to one generator's outputs
fn apply_edit(
    edit: &dyn PendingEdit,
    shape: &PipelineShape,
    generator: &str,
    additional_inputs: &[AdditionalInput],
    outputs: &[GeneratedOutput],
) -> Result<Vec<GeneratedOutput>> {
    let kind = edit.kind();
    let mut context = EditContext::new(generator, kind, additional_inputs, outputs.to_vec());
    match catch_unwind(AssertUnwindSafe(|| edit.try_apply(shape, &mut context))) {
        Ok(Ok(())) => Ok(context.into_outputs()),
        Ok(Err(e @ EngineError::EditRejected { .. })) => Err(e),
        Ok(Err(e)) => Err(EngineError::edit_rejected(kind, generator, e.to_string())),
        Err(payload) => Err(EngineError::edit_rejected(
            kind,
            generator,
            panic_message(payload.as_ref()),
        )),
    }
}

/// Fold every pending edit into the additional inputs, in order
fn commit_edits(
    edits: &[Arc<dyn PendingEdit>],
    inputs: &[AdditionalInput],
) -> Vec<AdditionalInput> {
    edits
        .iter()
        .fold(inputs.to_vec(), |inputs, edit| edit.commit(&inputs))
}
