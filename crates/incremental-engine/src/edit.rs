//! Pending edits and their incremental application
//!
//! A [`PendingEdit`] describes a change the host wants reflected in the
//! generated outputs without a full pass. The driver never interprets an
//! edit: it asks every initialized generator whose [`PipelineShape`] accepts
//! the edit to apply it to that generator's current outputs through an
//! [`EditContext`]. A single rejection aborts the whole batch.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::pipeline::PipelineShape;
use crate::types::{AdditionalInput, GeneratedOutput};

/// Kind string of [`AdditionalInputAdded`]
pub const ADDITIONAL_INPUT_ADDED: &str = "additional-input-added";

/// Type-erased handler registered with [`crate::PipelineBuilder::on_edit`]
pub type EditHandler = Arc<dyn Fn(&dyn Any, &mut EditContext<'_>) -> Result<()> + Send + Sync>;

/// An incremental change queued on the driver
pub trait PendingEdit: Send + Sync + fmt::Debug {
    /// Stable kind string generators register handlers for
    fn kind(&self) -> &str;

    /// Access to the concrete edit for downcasting
    fn as_any(&self) -> &dyn Any;

    /// Whether a generator with this shape wants the edit
    fn accepted_by(&self, shape: &PipelineShape) -> bool {
        shape.accepts_edit(self.kind())
    }

    /// Apply the edit to one generator's outputs
    ///
    /// The default dispatches to the handler the generator registered for
    /// this edit's kind.
    fn try_apply(&self, shape: &PipelineShape, context: &mut EditContext<'_>) -> Result<()> {
        match shape.edit_handler(self.kind()) {
            Some(handler) => handler(self.as_any(), context),
            None => Err(context.reject("no handler registered")),
        }
    }

    /// Fold the edit into the driver's additional inputs once it succeeded
    fn commit(&self, inputs: &[AdditionalInput]) -> Vec<AdditionalInput> {
        inputs.to_vec()
    }
}

/// Mutable view of one generator's outputs while an edit is applied
pub struct EditContext<'a> {
    generator: &'a str,
    kind: &'a str,
    additional_inputs: &'a [AdditionalInput],
    outputs: Vec<GeneratedOutput>,
}

impl<'a> EditContext<'a> {
    pub(crate) fn new(
        generator: &'a str,
        kind: &'a str,
        additional_inputs: &'a [AdditionalInput],
        outputs: Vec<GeneratedOutput>,
    ) -> Self {
        Self {
            generator,
            kind,
            additional_inputs,
            outputs,
        }
    }

    /// Name of the generator the edit is applied to
    pub fn generator(&self) -> &str {
        self.generator
    }

    /// The driver's additional inputs before this batch is committed
    pub fn additional_inputs(&self) -> &[AdditionalInput] {
        self.additional_inputs
    }

    /// The generator's current outputs
    pub fn outputs(&self) -> &[GeneratedOutput] {
        &self.outputs
    }

    /// Add an output; hint names must stay unique
    pub fn add_output(&mut self, output: GeneratedOutput) -> Result<()> {
        if self.outputs.iter().any(|o| o.hint_name == output.hint_name) {
            return Err(EngineError::DuplicateHintName {
                generator: self.generator.to_string(),
                hint_name: output.hint_name,
            });
        }
        self.outputs.push(output);
        Ok(())
    }

    /// Replace the output with the same hint name, adding it if absent
    ///
    /// Returns `true` if an existing output was replaced.
    pub fn replace_output(&mut self, output: GeneratedOutput) -> bool {
        match self
            .outputs
            .iter_mut()
            .find(|o| o.hint_name == output.hint_name)
        {
            Some(existing) => {
                *existing = output;
                true
            }
            None => {
                self.outputs.push(output);
                false
            }
        }
    }

    /// Remove an output by hint name; returns `true` if it existed
    pub fn remove_output(&mut self, hint_name: &str) -> bool {
        let before = self.outputs.len();
        self.outputs.retain(|o| o.hint_name != hint_name);
        self.outputs.len() != before
    }

    /// Build the rejection error for the edit being applied
    pub fn reject(&self, message: impl Into<String>) -> EngineError {
        EngineError::edit_rejected(self.kind, self.generator, message)
    }

    pub(crate) fn into_outputs(self) -> Vec<GeneratedOutput> {
        self.outputs
    }
}

/// Built-in edit: a new additional input was added
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdditionalInputAdded {
    pub input: AdditionalInput,
}

impl AdditionalInputAdded {
    pub fn new(input: AdditionalInput) -> Self {
        Self { input }
    }
}

impl PendingEdit for AdditionalInputAdded {
    fn kind(&self) -> &str {
        ADDITIONAL_INPUT_ADDED
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn commit(&self, inputs: &[AdditionalInput]) -> Vec<AdditionalInput> {
        let mut inputs = inputs.to_vec();
        match inputs.iter_mut().find(|i| i.path == self.input.path) {
            Some(existing) => *existing = self.input.clone(),
            None => inputs.push(self.input.clone()),
        }
        inputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_appends_or_replaces_by_path() {
        let inputs = vec![AdditionalInput::new("a.txt", "old")];

        let added = AdditionalInputAdded::new(AdditionalInput::new("b.txt", "new")).commit(&inputs);
        assert_eq!(added.len(), 2);

        let replaced =
            AdditionalInputAdded::new(AdditionalInput::new("a.txt", "new")).commit(&inputs);
        assert_eq!(replaced, vec![AdditionalInput::new("a.txt", "new")]);
    }

    #[test]
    fn test_edit_context_outputs() {
        let inputs: [AdditionalInput; 0] = [];
        let mut context = EditContext::new(
            "greeter",
            ADDITIONAL_INPUT_ADDED,
            &inputs,
            vec![GeneratedOutput::source("a", "1")],
        );

        assert!(matches!(
            context.add_output(GeneratedOutput::source("a", "2")),
            Err(EngineError::DuplicateHintName { ref hint_name, .. }) if hint_name == "a"
        ));
        assert!(context.replace_output(GeneratedOutput::source("a", "2")));
        assert!(!context.replace_output(GeneratedOutput::source("b", "3")));
        assert!(context.remove_output("b"));
        assert!(!context.remove_output("b"));

        let outputs = context.into_outputs();
        assert_eq!(outputs, vec![GeneratedOutput::source("a", "2")]);
    }

    #[test]
    fn test_reject_names_kind_and_generator() {
        let context = EditContext::new("greeter", "rename", &[], Vec::new());
        let err = context.reject("unsupported");
        assert_eq!(
            err.to_string(),
            "Edit 'rename' was rejected by generator 'greeter': unsupported"
        );
    }
}
