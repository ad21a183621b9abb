//! Configuration types for the driver

use serde::{Deserialize, Serialize};

use crate::types::OutputKind;

/// Options applied to every pass a driver runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DriverOptions {
    /// Record a [`crate::StepRecord`] for every stage computed in a pass
    pub track_incremental_steps: bool,
    /// Output kinds whose registered stages are not evaluated
    /// (e.g. `implementation` when only source outputs are needed)
    pub disabled_outputs: Vec<OutputKind>,
}

impl DriverOptions {
    /// Whether outputs of this kind are produced
    pub fn is_enabled(&self, kind: OutputKind) -> bool {
        !self.disabled_outputs.contains(&kind)
    }

    /// Enable step tracking
    pub fn with_step_tracking(mut self) -> Self {
        self.track_incremental_steps = true;
        self
    }

    /// Stop producing outputs of this kind
    pub fn disable_output(mut self, kind: OutputKind) -> Self {
        if self.is_enabled(kind) {
            self.disabled_outputs.push(kind);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = DriverOptions::default();
        assert!(!options.track_incremental_steps);
        assert!(options.is_enabled(OutputKind::Source));
        assert!(options.is_enabled(OutputKind::Implementation));
    }

    #[test]
    fn test_missing_fields_deserialize_to_defaults() {
        let options: DriverOptions =
            serde_json::from_str(r#"{"disabledOutputs": ["implementation"]}"#).unwrap();
        assert!(!options.track_incremental_steps);
        assert!(!options.is_enabled(OutputKind::Implementation));
        assert!(options.is_enabled(OutputKind::Source));
    }

    #[test]
    fn test_disable_output_is_idempotent() {
        let options = DriverOptions::default()
            .disable_output(OutputKind::Source)
            .disable_output(OutputKind::Source);
        assert_eq!(options.disabled_outputs, vec![OutputKind::Source]);
    }
}
