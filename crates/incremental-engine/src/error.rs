//! Error types for the incremental engine

use std::fmt;
use std::sync::Arc;

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use thiserror::Error;

/// Result type alias using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur in the incremental engine
///
/// Only [`EngineError::Cancelled`] ever escapes a pass. Every other variant
/// is recovered at the smallest unit that can be dropped (a table, a
/// generator, an edit, an artifact) and reported through an event sink.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A stage transform failed
    #[error("Transform failed in stage '{stage}': {message}")]
    TransformFailed { stage: String, message: String },

    /// A generator's pipeline declaration failed
    #[error("Generator '{generator}' failed to initialize: {message}")]
    Initialization { generator: String, message: String },

    /// A generator failed while executing its pipeline
    #[error("Generator '{generator}' failed during execution: {message}")]
    Execution { generator: String, message: String },

    /// A generator produced two outputs with the same hint name in one pass
    #[error("Generator '{generator}' produced duplicate hint name '{hint_name}'")]
    DuplicateHintName { generator: String, hint_name: String },

    /// A pending edit could not be applied by a generator
    #[error("Edit '{kind}' was rejected by generator '{generator}': {message}")]
    EditRejected {
        kind: String,
        generator: String,
        message: String,
    },

    /// Incremental application was requested with nothing queued
    #[error("No pending edits to apply")]
    NoPendingEdits,

    /// A previous edit failed; a full pass is required before edits apply again
    #[error("Pending edits were invalidated; run a full generation pass")]
    EditsInvalidated,

    /// An output could not be turned into an artifact or merged
    #[error("Artifact '{hint_name}' from generator '{generator}' failed: {message}")]
    Artifact {
        generator: String,
        hint_name: String,
        message: String,
    },

    /// A stage's stored table holds a different element type than requested
    #[error("Stage '{0}' holds a table of a different element type")]
    TableTypeMismatch(String),

    /// The pass was cancelled
    #[error("Pass cancelled")]
    Cancelled,

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Create a transform failure for the named stage
    pub fn transform(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransformFailed {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Create an edit rejection
    pub fn edit_rejected(
        kind: impl Into<String>,
        generator: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::EditRejected {
            kind: kind.into(),
            generator: generator.into(),
            message: message.into(),
        }
    }

    /// Whether this error aborts the whole pass
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// A captured failure, cheap to clone into tables and run results
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    stage: Option<Arc<str>>,
    message: Arc<str>,
}

impl Fault {
    /// Create a fault with a message and no stage attribution
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            stage: None,
            message: Arc::from(message.into()),
        }
    }

    /// Create a fault attributed to a stage
    pub fn in_stage(stage: &str, message: impl Into<String>) -> Self {
        Self {
            stage: Some(Arc::from(stage)),
            message: Arc::from(message.into()),
        }
    }

    /// Capture an engine error
    pub fn from_error(err: &EngineError) -> Self {
        match err {
            EngineError::TransformFailed { stage, message } => {
                Self::in_stage(stage, message.clone())
            }
            other => Self::new(other.to_string()),
        }
    }

    /// The stage the fault was raised in, if known
    pub fn stage(&self) -> Option<&str> {
        self.stage.as_deref()
    }

    /// The failure message
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.stage {
            Some(stage) => write!(f, "{} (stage '{}')", self.message, stage),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for Fault {}

impl Serialize for Fault {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Fault", 2)?;
        state.serialize_field("stage", &self.stage())?;
        state.serialize_field("message", self.message())?;
        state.end()
    }
}

impl From<EngineError> for Fault {
    fn from(err: EngineError) -> Self {
        Self::from_error(&err)
    }
}

/// Extract a readable message from a caught panic
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {}", msg)
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transform_fault_keeps_stage() {
        let err = EngineError::transform("double", "overflow");
        let fault = Fault::from_error(&err);
        assert_eq!(fault.stage(), Some("double"));
        assert_eq!(fault.message(), "overflow");
        assert_eq!(fault.to_string(), "overflow (stage 'double')");
    }

    #[test]
    fn test_other_errors_use_display() {
        let fault: Fault = EngineError::NoPendingEdits.into();
        assert_eq!(fault.stage(), None);
        assert_eq!(fault.message(), "No pending edits to apply");
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "panicked: boom");

        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "panicked: bang");

        let payload: Box<dyn std::any::Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "panicked");
    }

    #[test]
    fn test_fault_serializes_stage_and_message() {
        let json = serde_json::to_value(Fault::in_stage("emit", "bad")).unwrap();
        assert_eq!(json, serde_json::json!({"stage": "emit", "message": "bad"}));
    }

    #[test]
    fn test_cancelled_is_distinguished() {
        assert!(EngineError::Cancelled.is_cancelled());
        assert!(!EngineError::EditsInvalidated.is_cancelled());
    }
}
