//! Leaf input stages
//!
//! A leaf stage turns a freshly supplied, ordered collection of values into
//! a state table by diffing it position-by-position against the previous
//! pass:
//!
//! - same position, equal value: `Cached`
//! - same position, different value: `Modified`
//! - position that did not exist before: `Added`
//! - position that no longer exists: previous slot kept once as `Removed`

use std::sync::Arc;

use crate::error::Result;
use crate::evaluator::PassEvaluator;
use crate::node::{usable_previous, Node, Stage, StageInfo};
use crate::table::StateTable;
use crate::types::{EntryState, TableValue};

type Comparer<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// Node for a leaf stage fed through [`PassEvaluator::add_input`]
pub struct InputNode<T> {
    comparer: Comparer<T>,
}

impl<T: TableValue + PartialEq> InputNode<T> {
    /// Leaf node comparing values with `PartialEq`
    pub fn new() -> Self {
        Self {
            comparer: Arc::new(|a: &T, b: &T| a == b),
        }
    }
}

impl<T: TableValue + PartialEq> Default for InputNode<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TableValue> InputNode<T> {
    /// Leaf node with a custom equality
    pub fn with_comparer(comparer: impl Fn(&T, &T) -> bool + Send + Sync + 'static) -> Self {
        Self {
            comparer: Arc::new(comparer),
        }
    }
}

impl<T: TableValue> Node<T> for InputNode<T> {
    fn update_state_table(
        &self,
        pass: &mut PassEvaluator,
        previous: Option<&StateTable<T>>,
        stage: &StageInfo,
    ) -> Result<StateTable<T>> {
        let previous = usable_previous(previous);
        match pass.take_input::<T>(stage.id()) {
            Some(values) => Ok(diff_inputs(previous, values, self.comparer.as_ref())),
            // No fresh values this pass: the input is unchanged.
            None => Ok(previous.map(StateTable::compact).unwrap_or_default()),
        }
    }
}

/// Diff `values` against the previous leaf table
pub fn diff_inputs<T, F>(
    previous: Option<&StateTable<T>>,
    values: Vec<T>,
    comparer: F,
) -> StateTable<T>
where
    T: TableValue,
    F: Fn(&T, &T) -> bool,
{
    let mut builder = StateTable::builder();
    let previous_len = previous.map_or(0, StateTable::slot_count);
    let new_len = values.len();

    for (i, value) in values.into_iter().enumerate() {
        let old = previous.and_then(|table| table.slot_items(i));
        match (previous, old) {
            (Some(table), Some([old_value])) if comparer(&value, old_value) => {
                builder.add_entries_from_previous(table, EntryState::Cached);
            }
            (_, Some(_)) => builder.add_entries(vec![value], EntryState::Modified),
            (_, None) => builder.add_entries(vec![value], EntryState::Added),
        }
    }

    if let Some(table) = previous {
        for _ in new_len..previous_len {
            builder.add_entries_from_previous(table, EntryState::Removed);
        }
    }
    builder.build()
}

impl<T: TableValue + PartialEq> Stage<T> {
    /// Create a leaf stage
    pub fn input(name: impl Into<String>) -> Self {
        Stage::new(name, InputNode::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::PassTables;
    use crate::types::EntryState::{Added, Cached, Modified, Removed};

    fn eq(a: &i32, b: &i32) -> bool {
        a == b
    }

    #[test]
    fn test_first_pass_is_all_added() {
        let table = diff_inputs(None, vec![1, 2], eq);
        assert_eq!(table.entries(), vec![(1, Added), (2, Added)]);
    }

    #[test]
    fn test_diff_by_position() {
        let previous = diff_inputs(None, vec![1, 2, 3], eq).compact();
        let table = diff_inputs(Some(&previous), vec![1, 5, 3, 4], eq);
        assert_eq!(
            table.entries(),
            vec![(1, Cached), (5, Modified), (3, Cached), (4, Added)]
        );
    }

    #[test]
    fn test_shrinking_input_emits_removed_once() {
        let previous = diff_inputs(None, vec![1, 2, 3], eq).compact();
        let live = diff_inputs(Some(&previous), vec![1], eq);
        assert_eq!(live.entries(), vec![(1, Cached), (2, Removed), (3, Removed)]);

        let compacted = live.compact();
        assert_eq!(compacted.entries(), vec![(1, Cached)]);
    }

    #[test]
    fn test_custom_comparer() {
        let ignore_case = |a: &String, b: &String| a.eq_ignore_ascii_case(b);
        let previous = diff_inputs(None, vec!["A".to_string()], ignore_case).compact();
        let table = diff_inputs(Some(&previous), vec!["a".to_string()], ignore_case);
        // The previous value is kept when the comparer says nothing changed.
        assert_eq!(table.entries(), vec![("A".to_string(), Cached)]);
    }

    #[test]
    fn test_leaf_without_fresh_values_is_cached() {
        let leaf = Stage::<i32>::input("numbers");

        let mut pass = PassEvaluator::new(PassTables::new());
        pass.add_input(&leaf, vec![1, 2]);
        pass.latest(&leaf).unwrap();
        let tables = pass.to_immutable();

        let mut pass = PassEvaluator::new(tables);
        let table = pass.latest(&leaf).unwrap();
        assert_eq!(table.entries(), vec![(1, Cached), (2, Cached)]);
    }

    #[test]
    fn test_leaf_never_fed_is_empty() {
        let leaf = Stage::<i32>::input("numbers");
        let mut pass = PassEvaluator::new(PassTables::new());
        let table = pass.latest(&leaf).unwrap();
        assert!(table.is_empty());
        assert!(!table.is_faulted());
    }
}
