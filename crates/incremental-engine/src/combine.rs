//! Collect and Combine stages
//!
//! [`CollectNode`] folds every live upstream entry into a single value.
//! [`CombineNode`] pairs each entry of one stage with the single value of
//! another, which is how a pipeline joins two branches back together.

use crate::error::{Fault, Result};
use crate::evaluator::PassEvaluator;
use crate::node::{usable_previous, Node, Stage, StageInfo};
use crate::table::StateTable;
use crate::types::{EntryState, TableValue};

/// Node gathering every live upstream value into one `Vec`
pub struct CollectNode<T> {
    source: Stage<T>,
}

impl<T: TableValue> CollectNode<T> {
    pub fn new(source: Stage<T>) -> Self {
        Self { source }
    }
}

impl<T: TableValue + PartialEq> Node<Vec<T>> for CollectNode<T> {
    fn update_state_table(
        &self,
        pass: &mut PassEvaluator,
        previous: Option<&StateTable<Vec<T>>>,
        _stage: &StageInfo,
    ) -> Result<StateTable<Vec<T>>> {
        let upstream = pass.latest(&self.source)?;
        if let Some(fault) = upstream.fault() {
            return Ok(StateTable::faulted(fault.clone()));
        }

        let previous = usable_previous(previous);
        let unchanged = upstream.iter().all(|(_, state)| state == EntryState::Cached);
        let mut builder = StateTable::builder();
        match previous {
            Some(previous) if unchanged => {
                builder.add_entries_from_previous(previous, EntryState::Cached);
            }
            Some(previous) => {
                builder.add_modified_entries(previous, vec![upstream.live_values()], |a, b| a == b);
            }
            None => builder.add_entries(vec![upstream.live_values()], EntryState::Added),
        }
        Ok(builder.build())
    }
}

/// Node pairing each left entry with the single right value
pub struct CombineNode<L, R> {
    left: Stage<L>,
    right: Stage<R>,
}

impl<L: TableValue, R: TableValue> CombineNode<L, R> {
    pub fn new(left: Stage<L>, right: Stage<R>) -> Self {
        Self { left, right }
    }
}

impl<L, R> Node<(L, R)> for CombineNode<L, R>
where
    L: TableValue + PartialEq,
    R: TableValue + PartialEq,
{
    fn update_state_table(
        &self,
        pass: &mut PassEvaluator,
        previous: Option<&StateTable<(L, R)>>,
        stage: &StageInfo,
    ) -> Result<StateTable<(L, R)>> {
        let left = pass.latest(&self.left)?;
        let right = pass.latest(&self.right)?;
        if let Some(fault) = left.fault().or(right.fault()) {
            return Ok(StateTable::faulted(fault.clone()));
        }

        let live: Vec<(&R, EntryState)> = right
            .iter()
            .filter(|(_, state)| state.is_live())
            .collect();
        let (right_value, right_state) = match live.as_slice() {
            [single] => *single,
            other => {
                return Ok(StateTable::faulted(Fault::in_stage(
                    stage.name(),
                    format!(
                        "right input '{}' must hold exactly one value, found {}",
                        self.right.name(),
                        other.len()
                    ),
                )));
            }
        };
        let right_changed = right_state != EntryState::Cached;

        let previous = usable_previous(previous);
        let mut builder = StateTable::builder();
        for (value, state) in left.iter() {
            let pair = || (value.clone(), right_value.clone());
            match (state, previous) {
                (EntryState::Removed, Some(previous)) => {
                    builder.add_entries_from_previous(previous, EntryState::Removed);
                }
                (EntryState::Removed, None) => builder.add_entries(Vec::new(), EntryState::Removed),
                (EntryState::Cached, Some(previous)) if !right_changed => {
                    builder.add_entries_from_previous(previous, EntryState::Cached);
                }
                (EntryState::Cached | EntryState::Modified, Some(previous)) => {
                    builder.add_modified_entries(previous, vec![pair()], |a, b| a == b);
                }
                _ => builder.add_entries(vec![pair()], EntryState::Added),
            }
        }
        Ok(builder.build())
    }
}

impl<T: TableValue + PartialEq> Stage<T> {
    /// Gather every live value into a single `Vec`
    pub fn collect(&self, name: impl Into<String>) -> Stage<Vec<T>> {
        Stage::new(name, CollectNode::new(self.clone()))
    }

    /// Pair every entry with the single value of `right`
    pub fn combine<R>(&self, name: impl Into<String>, right: &Stage<R>) -> Stage<(T, R)>
    where
        R: TableValue + PartialEq,
    {
        Stage::new(name, CombineNode::new(self.clone(), right.clone()))
    }
}
