//! Map stages
//!
//! A map stage applies a one-to-many function to every upstream entry. Each
//! upstream entry owns exactly one output slot, so the downstream table stays
//! aligned with its upstream from pass to pass and unchanged entries are
//! reused without calling the function again.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::error::{EngineError, Fault, Result};
use crate::evaluator::PassEvaluator;
use crate::node::{usable_previous, Node, Stage, StageInfo};
use crate::table::{StateTable, StateTableBuilder};
use crate::types::{EntryState, TableValue};

type Transform<I, O> = Arc<dyn Fn(&I) -> Result<Vec<O>> + Send + Sync>;
type Comparer<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// Node applying a transform to each entry of an upstream stage
pub struct MapNode<I, O> {
    source: Stage<I>,
    transform: Transform<I, O>,
    comparer: Comparer<O>,
}

impl<I: TableValue, O: TableValue + PartialEq> MapNode<I, O> {
    /// Map node comparing outputs with `PartialEq`
    pub fn new(
        source: Stage<I>,
        transform: impl Fn(&I) -> Result<Vec<O>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            source,
            transform: Arc::new(transform),
            comparer: Arc::new(|a: &O, b: &O| a == b),
        }
    }
}

impl<I: TableValue, O: TableValue> MapNode<I, O> {
    /// Replace the equality used to classify recomputed outputs
    pub fn with_comparer(
        mut self,
        comparer: impl Fn(&O, &O) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.comparer = Arc::new(comparer);
        self
    }

    /// Run the transform for one upstream value, capturing errors and panics
    fn apply(&self, value: &I, stage: &StageInfo) -> std::result::Result<Vec<O>, Fault> {
        match catch_unwind(AssertUnwindSafe(|| (self.transform)(value))) {
            Ok(Ok(outputs)) => Ok(outputs),
            Ok(Err(err @ EngineError::TransformFailed { .. })) => Err(Fault::from_error(&err)),
            Ok(Err(err)) => Err(Fault::in_stage(stage.name(), err.to_string())),
            Err(payload) => Err(Fault::in_stage(
                stage.name(),
                crate::error::panic_message(payload.as_ref()),
            )),
        }
    }

    /// Add one slot for an upstream entry
    fn add_slot(
        &self,
        pass: &PassEvaluator,
        builder: &mut StateTableBuilder<O>,
        previous: Option<&StateTable<O>>,
        value: &I,
        state: EntryState,
        stage: &StageInfo,
    ) -> Result<std::result::Result<(), Fault>> {
        match (state, previous) {
            (EntryState::Removed, Some(previous)) => {
                builder.add_entries_from_previous(previous, EntryState::Removed);
            }
            (EntryState::Removed, None) => builder.add_entries(Vec::new(), EntryState::Removed),
            (EntryState::Cached, Some(previous)) => {
                builder.add_entries_from_previous(previous, EntryState::Cached);
            }
            (EntryState::Modified, Some(previous)) => {
                pass.check_cancelled()?;
                match self.apply(value, stage) {
                    Ok(outputs) => {
                        builder.add_modified_entries(previous, outputs, self.comparer.as_ref())
                    }
                    Err(fault) => return Ok(Err(fault)),
                }
            }
            // Added entries, and anything without a baseline, are computed fresh.
            _ => {
                pass.check_cancelled()?;
                match self.apply(value, stage) {
                    Ok(outputs) => builder.add_entries(outputs, EntryState::Added),
                    Err(fault) => return Ok(Err(fault)),
                }
            }
        }
        Ok(Ok(()))
    }
}

impl<I: TableValue, O: TableValue> Node<O> for MapNode<I, O> {
    fn update_state_table(
        &self,
        pass: &mut PassEvaluator,
        previous: Option<&StateTable<O>>,
        stage: &StageInfo,
    ) -> Result<StateTable<O>> {
        let upstream = pass.latest(&self.source)?;
        if let Some(fault) = upstream.fault() {
            return Ok(StateTable::faulted(fault.clone()));
        }

        let previous = usable_previous(previous);
        let mut builder = StateTable::builder();
        for (value, state) in upstream.iter() {
            if let Err(fault) = self.add_slot(pass, &mut builder, previous, value, state, stage)? {
                log::debug!("Stage '{}' faulted: {}", stage.name(), fault);
                builder.set_faulted(fault);
                break;
            }
        }
        Ok(builder.build())
    }
}

impl<I: TableValue> Stage<I> {
    /// One output per upstream entry
    pub fn map<O>(
        &self,
        name: impl Into<String>,
        f: impl Fn(&I) -> O + Send + Sync + 'static,
    ) -> Stage<O>
    where
        O: TableValue + PartialEq,
    {
        Stage::new(name, MapNode::new(self.clone(), move |value| Ok(vec![f(value)])))
    }

    /// Zero or more outputs per upstream entry
    pub fn select_many<O>(
        &self,
        name: impl Into<String>,
        f: impl Fn(&I) -> Vec<O> + Send + Sync + 'static,
    ) -> Stage<O>
    where
        O: TableValue + PartialEq,
    {
        Stage::new(name, MapNode::new(self.clone(), move |value| Ok(f(value))))
    }

    /// Zero or more outputs per upstream entry; an `Err` faults the stage
    pub fn try_select_many<O, E>(
        &self,
        name: impl Into<String>,
        f: impl Fn(&I) -> std::result::Result<Vec<O>, E> + Send + Sync + 'static,
    ) -> Stage<O>
    where
        O: TableValue + PartialEq,
        E: fmt::Display,
    {
        let name = name.into();
        let stage_name = name.clone();
        Stage::new(
            name,
            MapNode::new(self.clone(), move |value| {
                f(value).map_err(|err| EngineError::transform(stage_name.as_str(), err.to_string()))
            }),
        )
    }
}
