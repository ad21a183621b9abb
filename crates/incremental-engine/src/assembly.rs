//! Assembling generated outputs into a new snapshot
//!
//! The host owns the snapshot type, so it also owns the two steps that turn
//! a [`GeneratedOutput`] into part of a snapshot: materializing the output
//! into an [`Artifact`] and merging that artifact. Both steps are fail-soft:
//! an output that cannot be materialized or merged is left out and reported
//! as [`EngineEvent::ArtifactFailed`].

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{panic_message, EngineError, Result};
use crate::events::{emit, EngineEvent, EventSink};
use crate::types::GeneratedOutput;

/// Structured, mergeable form of a generated output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub generator: String,
    pub hint_name: String,
    pub content: serde_json::Value,
}

/// Host-side collaborator that knows how to fold artifacts into snapshots
pub trait SnapshotHost<S>: Send + Sync {
    /// Turn an output into an artifact
    ///
    /// The default parses the output text as JSON.
    fn materialize(&self, generator: &str, output: &GeneratedOutput) -> Result<Artifact> {
        let content = serde_json::from_str(&output.text)?;
        Ok(Artifact {
            generator: generator.to_string(),
            hint_name: output.hint_name.clone(),
            content,
        })
    }

    /// Produce a new snapshot containing the artifact
    fn merge(&self, snapshot: &S, artifact: Artifact) -> Result<S>;
}

/// Merge every output into `snapshot`, in order
///
/// Returns the input `Arc` itself when nothing was merged.
pub fn assemble<'o, S, I>(
    host: &dyn SnapshotHost<S>,
    snapshot: &Arc<S>,
    outputs: I,
    sink: &dyn EventSink,
    run_id: &str,
) -> Arc<S>
where
    I: IntoIterator<Item = (&'o str, &'o GeneratedOutput)>,
{
    let mut current = snapshot.clone();
    let mut merged = 0usize;
    for (generator, output) in outputs {
        match assemble_one(host, &current, generator, output) {
            Ok(next) => {
                current = Arc::new(next);
                merged += 1;
            }
            Err(e) => {
                log::warn!("Omitting artifact: {}", e);
                emit(
                    sink,
                    EngineEvent::ArtifactFailed {
                        run_id: run_id.to_string(),
                        generator: generator.to_string(),
                        hint_name: output.hint_name.clone(),
                        error: e.to_string(),
                    },
                );
            }
        }
    }
    log::debug!("Assembled {} artifacts", merged);
    current
}

fn assemble_one<S>(
    host: &dyn SnapshotHost<S>,
    snapshot: &S,
    generator: &str,
    output: &GeneratedOutput,
) -> Result<S> {
    let artifact_error = |message: String| EngineError::Artifact {
        generator: generator.to_string(),
        hint_name: output.hint_name.clone(),
        message,
    };
    let attempt = catch_unwind(AssertUnwindSafe(|| {
        let artifact = host.materialize(generator, output)?;
        host.merge(snapshot, artifact)
    }));
    match attempt {
        Ok(Ok(next)) => Ok(next),
        Ok(Err(e)) => Err(artifact_error(e.to_string())),
        Err(payload) => Err(artifact_error(panic_message(payload.as_ref()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::VecEventSink;
    use crate::test_support::{Program, ProgramHost};

    #[test]
    fn test_outputs_are_merged_in_order() {
        let program = Arc::new(Program::default());
        let first = GeneratedOutput::source("a", r#"{"n": 1}"#);
        let second = GeneratedOutput::source("b", r#"{"n": 2}"#);
        let sink = VecEventSink::new();

        let assembled = assemble(
            &ProgramHost,
            &program,
            [("gen", &first), ("gen", &second)],
            &sink,
            "run1",
        );

        assert_eq!(assembled.generated_names(), vec!["a", "b"]);
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_nothing_merged_returns_same_snapshot() {
        let program = Arc::new(Program::default());
        let sink = VecEventSink::new();
        let assembled = assemble(&ProgramHost, &program, std::iter::empty(), &sink, "run1");
        assert!(Arc::ptr_eq(&assembled, &program));
    }

    #[test]
    fn test_failed_artifacts_are_omitted_and_reported() {
        let program = Arc::new(Program::default());
        let invalid = GeneratedOutput::source("broken", "not json");
        let rejected = GeneratedOutput::source("rejected", r#"{"reject": true}"#);
        let valid = GeneratedOutput::source("ok", "{}");
        let sink = VecEventSink::new();

        let assembled = assemble(
            &ProgramHost,
            &program,
            [("gen", &invalid), ("gen", &rejected), ("gen", &valid)],
            &sink,
            "run1",
        );

        assert_eq!(assembled.generated_names(), vec!["ok"]);
        let failures = sink.failures();
        assert_eq!(failures.len(), 2);
        assert!(matches!(
            &failures[0],
            EngineEvent::ArtifactFailed { hint_name, .. } if hint_name == "broken"
        ));
    }

    #[test]
    fn test_panicking_merge_is_contained() {
        struct PanickingHost;
        impl SnapshotHost<Program> for PanickingHost {
            fn merge(&self, _snapshot: &Program, _artifact: Artifact) -> Result<Program> {
                panic!("merge exploded");
            }
        }

        let program = Arc::new(Program::default());
        let output = GeneratedOutput::source("a", "{}");
        let sink = VecEventSink::new();
        let assembled = assemble(&PanickingHost, &program, [("gen", &output)], &sink, "run1");

        assert!(Arc::ptr_eq(&assembled, &program));
        match &sink.failures()[0] {
            EngineEvent::ArtifactFailed { error, .. } => assert!(error.contains("merge exploded")),
            other => panic!("Expected ArtifactFailed, got {:?}", other),
        }
    }
}
