//! Event types for observing driver runs
//!
//! Events are sent from the driver to any consumer to report pass progress
//! and every fault the driver recovered from. Recovering is the default
//! policy, so the sink is where plugin defects become visible.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Trait for receiving engine events
///
/// This abstracts over the transport mechanism (log, channel, collector)
/// allowing the driver to be used in different contexts.
pub trait EventSink: Send + Sync {
    /// Send an event
    ///
    /// Returns an error if the event could not be delivered. The driver logs
    /// delivery errors and carries on.
    fn send(&self, event: EngineEvent) -> Result<(), EventError>;
}

/// Error when sending events fails
#[derive(Debug, Clone)]
pub struct EventError {
    pub message: String,
}

impl std::fmt::Display for EventError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Event error: {}", self.message)
    }
}

impl std::error::Error for EventError {}

/// Events emitted by the driver
///
/// Every event carries the `run_id` of the driver operation that emitted it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineEvent {
    /// A full pass started
    #[serde(rename_all = "camelCase")]
    PassStarted { run_id: String, generators: usize },

    /// A full pass finished
    #[serde(rename_all = "camelCase")]
    PassCompleted {
        run_id: String,
        outputs: usize,
        failed_generators: usize,
    },

    /// A full pass was skipped because the snapshot was already processed
    #[serde(rename_all = "camelCase")]
    PassReused { run_id: String },

    /// A generator's declaration callback failed; it stays uninitialized
    #[serde(rename_all = "camelCase")]
    GeneratorInitializationFailed {
        run_id: String,
        generator: String,
        error: String,
    },

    /// A generator's pipeline failed; it contributes no outputs this pass
    #[serde(rename_all = "camelCase")]
    GeneratorExecutionFailed {
        run_id: String,
        generator: String,
        error: String,
    },

    /// A registered output stage produced a faulted table
    #[serde(rename_all = "camelCase")]
    StageFaulted {
        run_id: String,
        generator: String,
        stage: Option<String>,
        error: String,
    },

    /// A generator rejected a pending edit
    #[serde(rename_all = "camelCase")]
    EditRejected {
        run_id: String,
        kind: String,
        generator: String,
        error: String,
    },

    /// Pending edits were applied incrementally
    #[serde(rename_all = "camelCase")]
    EditsApplied { run_id: String, count: usize },

    /// An output could not be materialized or merged; it was omitted
    #[serde(rename_all = "camelCase")]
    ArtifactFailed {
        run_id: String,
        generator: String,
        hint_name: String,
        error: String,
    },
}

impl EngineEvent {
    /// The operation this event belongs to
    pub fn run_id(&self) -> &str {
        match self {
            Self::PassStarted { run_id, .. }
            | Self::PassCompleted { run_id, .. }
            | Self::PassReused { run_id }
            | Self::GeneratorInitializationFailed { run_id, .. }
            | Self::GeneratorExecutionFailed { run_id, .. }
            | Self::StageFaulted { run_id, .. }
            | Self::EditRejected { run_id, .. }
            | Self::EditsApplied { run_id, .. }
            | Self::ArtifactFailed { run_id, .. } => run_id,
        }
    }

    /// Whether the event reports a recovered fault
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::GeneratorInitializationFailed { .. }
                | Self::GeneratorExecutionFailed { .. }
                | Self::StageFaulted { .. }
                | Self::EditRejected { .. }
                | Self::ArtifactFailed { .. }
        )
    }
}

/// Send an event, logging delivery failures instead of propagating them
pub(crate) fn emit(sink: &dyn EventSink, event: EngineEvent) {
    if let Err(e) = sink.send(event) {
        log::warn!("Failed to deliver engine event: {}", e);
    }
}

/// A no-op event sink that discards all events
///
/// Useful for testing or when events aren't needed.
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn send(&self, _event: EngineEvent) -> Result<(), EventError> {
        Ok(())
    }
}

/// Event sink forwarding to the `log` facade
///
/// Failures are logged at warn level, progress at debug level. This is the
/// driver's default sink.
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn send(&self, event: EngineEvent) -> Result<(), EventError> {
        if event.is_failure() {
            log::warn!("{:?}", event);
        } else {
            log::debug!("{:?}", event);
        }
        Ok(())
    }
}

/// A vector-based event sink that collects events
///
/// Useful for testing to verify events were emitted correctly.
pub struct VecEventSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl VecEventSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    /// Get all collected events
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }

    /// Collected events that report failures
    pub fn failures(&self) -> Vec<EngineEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.is_failure())
            .cloned()
            .collect()
    }

    /// Clear all collected events
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl Default for VecEventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for VecEventSink {
    fn send(&self, event: EngineEvent) -> Result<(), EventError> {
        self.events.lock().push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn execution_failed() -> EngineEvent {
        EngineEvent::GeneratorExecutionFailed {
            run_id: "run1".to_string(),
            generator: "greeter".to_string(),
            error: "boom".to_string(),
        }
    }

    #[test]
    fn test_vec_event_sink() {
        let sink = VecEventSink::new();

        sink.send(EngineEvent::PassStarted {
            run_id: "run1".to_string(),
            generators: 2,
        })
        .unwrap();
        sink.send(execution_failed()).unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(sink.failures(), vec![execution_failed()]);

        match &events[0] {
            EngineEvent::PassStarted { run_id, generators } => {
                assert_eq!(run_id, "run1");
                assert_eq!(*generators, 2);
            }
            _ => panic!("Expected PassStarted event"),
        }

        sink.clear();
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_null_and_log_sinks_accept_events() {
        NullEventSink.send(execution_failed()).unwrap();
        LogEventSink.send(execution_failed()).unwrap();
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let json = serde_json::to_value(execution_failed()).unwrap();
        assert_eq!(json["type"], "generatorExecutionFailed");
        assert_eq!(json["runId"], "run1");
        assert_eq!(execution_failed().run_id(), "run1");
    }
}
