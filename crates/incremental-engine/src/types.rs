//! Core value types shared across the engine
//!
//! These types describe entry states, stage identity, and the values that
//! flow across the driver boundary: generated outputs and additional inputs.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Bound for values stored in state tables
pub trait TableValue: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> TableValue for T {}

/// Change state of an entry relative to the previous pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    /// New this pass
    Added,
    /// Present last pass, gone now; emitted once so consumers can observe it
    Removed,
    /// Recomputed and different from last pass
    Modified,
    /// Unchanged since last pass
    Cached,
}

impl EntryState {
    /// Whether consumers should still see this entry's value
    pub fn is_live(&self) -> bool {
        !matches!(self, EntryState::Removed)
    }
}

/// Stable identity of a stage across passes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StageId(u64);

static NEXT_STAGE_ID: AtomicU64 = AtomicU64::new(1);

impl StageId {
    /// Allocate a fresh, process-unique stage id
    pub fn next() -> Self {
        Self(NEXT_STAGE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage#{}", self.0)
    }
}

/// Kind of a registered output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// Output that affects the host's view of the program
    Source,
    /// Output only needed for a final build, safe to skip in interactive hosts
    Implementation,
}

/// A single output produced by a generator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedOutput {
    /// Name unique within one generator's outputs for a pass
    pub hint_name: String,
    /// Generated text
    pub text: String,
    /// Output kind
    pub kind: OutputKind,
}

impl GeneratedOutput {
    /// Create a source output
    pub fn source(hint_name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            hint_name: hint_name.into(),
            text: text.into(),
            kind: OutputKind::Source,
        }
    }

    /// Create an implementation output
    pub fn implementation(hint_name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            hint_name: hint_name.into(),
            text: text.into(),
            kind: OutputKind::Implementation,
        }
    }
}

/// A driver-held leaf input that does not come from the snapshot
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AdditionalInput {
    /// Path or other stable name
    pub path: String,
    /// Contents
    pub text: String,
}

impl AdditionalInput {
    /// Create an additional input
    pub fn new(path: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            text: text.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_ids_are_unique() {
        let a = StageId::next();
        let b = StageId::next();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn test_entry_state_liveness() {
        assert!(EntryState::Added.is_live());
        assert!(EntryState::Cached.is_live());
        assert!(EntryState::Modified.is_live());
        assert!(!EntryState::Removed.is_live());
    }

    #[test]
    fn test_generated_output_serializes_camel_case() {
        let output = GeneratedOutput::implementation("a.g", "text");
        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"hintName": "a.g", "text": "text", "kind": "implementation"})
        );
    }
}
