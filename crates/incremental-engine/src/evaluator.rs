//! Per-pass memoizing evaluator
//!
//! The [`PassEvaluator`] produces one table per stage for the current pass.
//! It is pull-based: a stage's table is computed only when requested, and
//! the result is memoized so a stage with several consumers is evaluated at
//! most once per pass. Every stage sees the previous pass's tables as its
//! baseline.
//!
//! # Key Concepts
//!
//! - **Type-erased storage**: tables of different element types share one
//!   map keyed by [`StageId`]; the typed accessor checks the element type
//! - **Seeding**: leaves are fed with [`PassEvaluator::add_input`] or
//!   force-set with [`PassEvaluator::set_table`] before anything is pulled
//! - **Freezing**: [`PassEvaluator::to_immutable`] compacts every table
//!   touched this pass into the baseline for the next one; tables nobody
//!   pulled are dropped, so a stage that comes back starts from scratch

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cancel::CancellationFlag;
use crate::error::{EngineError, Result};
use crate::node::Stage;
use crate::table::StateTable;
use crate::types::{StageId, TableValue};

type AnyTable = Arc<dyn Any + Send + Sync>;

/// A stored table with enough type information to compact it later
#[derive(Clone)]
struct ErasedTable {
    stage: Arc<str>,
    table: AnyTable,
    compact: fn(&AnyTable) -> AnyTable,
}

fn compact_erased<T: TableValue>(table: &AnyTable) -> AnyTable {
    match table.downcast_ref::<StateTable<T>>() {
        Some(typed) => Arc::new(typed.compact()),
        None => table.clone(),
    }
}

impl ErasedTable {
    fn new<T: TableValue>(stage: &str, table: Arc<StateTable<T>>) -> Self {
        Self {
            stage: Arc::from(stage),
            table,
            compact: compact_erased::<T>,
        }
    }

    fn typed<T: TableValue>(&self) -> Result<Arc<StateTable<T>>> {
        self.table
            .clone()
            .downcast::<StateTable<T>>()
            .map_err(|_| EngineError::TableTypeMismatch(self.stage.to_string()))
    }

    fn compacted(&self) -> Self {
        Self {
            stage: self.stage.clone(),
            table: (self.compact)(&self.table),
            compact: self.compact,
        }
    }
}

/// Immutable set of per-stage tables produced by a completed pass
#[derive(Clone, Default)]
pub struct PassTables {
    tables: Arc<HashMap<StageId, ErasedTable>>,
}

impl PassTables {
    /// An empty table set (no previous pass)
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stages with a table
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Whether no stage has a table
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Whether the given stage has a table
    pub fn contains(&self, id: StageId) -> bool {
        self.tables.contains_key(&id)
    }

    /// Typed table for a stage
    pub fn get<T: TableValue>(&self, stage: &Stage<T>) -> Result<Option<Arc<StateTable<T>>>> {
        self.get_by_id(stage.id())
    }

    fn get_by_id<T: TableValue>(&self, id: StageId) -> Result<Option<Arc<StateTable<T>>>> {
        self.tables.get(&id).map(|entry| entry.typed::<T>()).transpose()
    }
}

impl fmt::Debug for PassTables {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut stages: Vec<&str> = self.tables.values().map(|t| t.stage.as_ref()).collect();
        stages.sort_unstable();
        f.debug_struct("PassTables").field("stages", &stages).finish()
    }
}

/// What one stage did during a pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    /// Stage name
    pub stage: String,
    /// Entries tagged Added
    pub added: usize,
    /// Entries tagged Modified
    pub modified: usize,
    /// Entries tagged Cached
    pub cached: usize,
    /// Entries tagged Removed
    pub removed: usize,
    /// Whether the stage's table faulted
    pub faulted: bool,
}

impl StepRecord {
    fn from_table<T: TableValue>(stage: &str, table: &StateTable<T>) -> Self {
        let [added, modified, cached, removed] = table.state_counts();
        Self {
            stage: stage.to_string(),
            added,
            modified,
            cached,
            removed,
            faulted: table.is_faulted(),
        }
    }
}

/// Working set for one pass over a stage graph
pub struct PassEvaluator {
    /// Baseline from the previous pass
    previous: PassTables,
    /// Tables computed or seeded this pass
    current: HashMap<StageId, ErasedTable>,
    /// Fresh leaf values waiting to be diffed, keyed by leaf stage
    inputs: HashMap<StageId, Box<dyn Any + Send>>,
    cancellation: CancellationFlag,
    steps: Option<Vec<StepRecord>>,
}

impl PassEvaluator {
    /// Start a pass on top of the previous pass's tables
    pub fn new(previous: PassTables) -> Self {
        Self {
            previous,
            current: HashMap::new(),
            inputs: HashMap::new(),
            cancellation: CancellationFlag::new(),
            steps: None,
        }
    }

    /// Check the given flag at every stage boundary
    pub fn with_cancellation(mut self, cancellation: CancellationFlag) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Record a [`StepRecord`] for every table computed this pass
    pub fn with_step_tracking(mut self, enabled: bool) -> Self {
        self.steps = enabled.then(Vec::new);
        self
    }

    /// The previous pass's tables
    pub fn previous(&self) -> &PassTables {
        &self.previous
    }

    /// Return `Err(Cancelled)` if the pass was cancelled
    pub fn check_cancelled(&self) -> Result<()> {
        self.cancellation.check()
    }

    /// Whether the stage already has a table this pass
    pub fn is_computed(&self, id: StageId) -> bool {
        self.current.contains_key(&id)
    }

    /// Get the stage's table for this pass, computing it at most once
    pub fn latest<T: TableValue>(&mut self, stage: &Stage<T>) -> Result<Arc<StateTable<T>>> {
        if let Some(entry) = self.current.get(&stage.id()) {
            return entry.typed();
        }
        self.check_cancelled()?;

        let previous = self.previous.get_by_id::<T>(stage.id())?;
        let table = stage
            .node()
            .update_state_table(self, previous.as_deref(), stage.info())?;

        let table = Arc::new(table);
        self.store(stage, table.clone());
        Ok(table)
    }

    /// Force a stage's table for this pass, bypassing its node
    pub fn set_table<T: TableValue>(&mut self, stage: &Stage<T>, table: StateTable<T>) {
        if self.is_computed(stage.id()) {
            log::debug!("Replacing already computed table for stage '{}'", stage.name());
        }
        self.store(stage, Arc::new(table));
    }

    /// Supply fresh values for a leaf stage; diffed when the leaf is pulled
    pub fn add_input<T: TableValue>(&mut self, stage: &Stage<T>, values: Vec<T>) {
        self.inputs.insert(stage.id(), Box::new(values));
    }

    pub(crate) fn take_input<T: TableValue>(&mut self, id: StageId) -> Option<Vec<T>> {
        self.inputs
            .remove(&id)
            .and_then(|values| values.downcast::<Vec<T>>().ok())
            .map(|values| *values)
    }

    /// Steps recorded so far (empty when tracking is off)
    pub fn steps(&self) -> &[StepRecord] {
        self.steps.as_deref().unwrap_or_default()
    }

    /// Freeze the pass into the baseline for the next one
    ///
    /// Every table touched this pass is compacted. Tables of stages that were
    /// not touched are dropped: their upstream moved on without them, so the
    /// next pass that pulls such a stage recomputes it with every entry Added.
    pub fn to_immutable(self) -> PassTables {
        self.finish().0
    }

    /// Freeze the pass and hand back the recorded steps
    pub fn finish(self) -> (PassTables, Vec<StepRecord>) {
        let dropped = self
            .previous
            .tables
            .keys()
            .filter(|id| !self.current.contains_key(id))
            .count();
        let tables: HashMap<StageId, ErasedTable> = self
            .current
            .into_iter()
            .map(|(id, entry)| (id, entry.compacted()))
            .collect();
        log::trace!("Pass frozen: {} tables kept, {} untouched dropped", tables.len(), dropped);
        (
            PassTables {
                tables: Arc::new(tables),
            },
            self.steps.unwrap_or_default(),
        )
    }

    fn store<T: TableValue>(&mut self, stage: &Stage<T>, table: Arc<StateTable<T>>) {
        if let Some(steps) = self.steps.as_mut() {
            steps.push(StepRecord::from_table(stage.name(), &table));
        }
        self.current
            .insert(stage.id(), ErasedTable::new(stage.name(), table));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::types::EntryState::{Added, Cached, Modified, Removed};

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    #[test]
    fn test_shared_upstream_is_evaluated_once() {
        let calls = counter();
        let seen = calls.clone();

        let leaf = Stage::<i32>::input("numbers");
        let first_hop = leaf.map("plus_one", move |x| {
            seen.fetch_add(1, Ordering::SeqCst);
            x + 1
        });
        let left = first_hop.map("double", |x| x * 2);
        let right = first_hop.map("negate", |x| -x);
        let joined = left.combine("joined", &right.collect("all_negated"));

        let mut pass = PassEvaluator::new(PassTables::new());
        pass.add_input(&leaf, vec![1, 2, 3]);
        let table = pass.latest(&joined).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            table.live_values(),
            vec![(4, vec![-2, -3, -4]), (6, vec![-2, -3, -4]), (8, vec![-2, -3, -4])]
        );
    }

    #[test]
    fn test_latest_is_memoized() {
        let leaf = Stage::<i32>::input("numbers");
        let mut pass = PassEvaluator::new(PassTables::new());
        pass.add_input(&leaf, vec![1]);

        let first = pass.latest(&leaf).unwrap();
        let second = pass.latest(&leaf).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(pass.is_computed(leaf.id()));
    }

    #[test]
    fn test_to_immutable_compacts_touched_tables() {
        let leaf = Stage::<i32>::input("numbers");
        let doubled = leaf.map("double", |x| x * 2);

        let mut pass = PassEvaluator::new(PassTables::new());
        pass.add_input(&leaf, vec![1, 2]);
        pass.latest(&doubled).unwrap();
        let tables = pass.to_immutable();

        let mut pass = PassEvaluator::new(tables);
        pass.add_input(&leaf, vec![1]);
        let live = pass.latest(&doubled).unwrap();
        assert_eq!(live.entries(), vec![(2, Cached), (4, Removed)]);

        let tables = pass.to_immutable();
        let compacted = tables.get(&doubled).unwrap().unwrap();
        assert!(compacted.is_compacted());
        assert_eq!(compacted.entries(), vec![(2, Cached)]);
    }

    #[test]
    fn test_untouched_tables_are_dropped() {
        let a = Stage::<i32>::input("a");
        let b = Stage::<i32>::input("b");

        let mut pass = PassEvaluator::new(PassTables::new());
        pass.add_input(&a, vec![1]);
        pass.add_input(&b, vec![2]);
        pass.latest(&a).unwrap();
        pass.latest(&b).unwrap();
        let tables = pass.to_immutable();

        let mut pass = PassEvaluator::new(tables);
        pass.add_input(&a, vec![3]);
        pass.latest(&a).unwrap();
        let tables = pass.to_immutable();

        assert_eq!(tables.len(), 1);
        assert!(tables.get(&b).unwrap().is_none());
        assert_eq!(tables.get(&a).unwrap().unwrap().live_values(), vec![3]);
    }

    #[test]
    fn test_stage_skipped_for_a_pass_is_recomputed() {
        let leaf = Stage::<i32>::input("numbers");
        let doubled = leaf.map("double", |x| x * 2);

        let mut pass = PassEvaluator::new(PassTables::new());
        pass.add_input(&leaf, vec![1]);
        pass.latest(&doubled).unwrap();
        let tables = pass.to_immutable();

        // Only the leaf is pulled while it grows.
        let mut pass = PassEvaluator::new(tables);
        pass.add_input(&leaf, vec![1, 2]);
        pass.latest(&leaf).unwrap();
        let tables = pass.to_immutable();

        let mut pass = PassEvaluator::new(tables);
        pass.add_input(&leaf, vec![1, 2]);
        let table = pass.latest(&doubled).unwrap();
        assert_eq!(table.entries(), vec![(2, Added), (4, Added)]);
    }

    #[test]
    fn test_set_table_seeds_a_leaf() {
        let leaf = Stage::<i32>::input("numbers");
        let doubled = leaf.map("double", |x| x * 2);

        let mut builder = StateTable::builder();
        builder.add_entries(vec![5], Modified);
        let mut pass = PassEvaluator::new(PassTables::new());
        pass.set_table(&leaf, builder.build());

        let table = pass.latest(&doubled).unwrap();
        assert_eq!(table.entries(), vec![(10, Added)]);
    }

    #[test]
    fn test_type_mismatch_is_reported() {
        let numbers = Stage::<i32>::input("numbers");
        let mut pass = PassEvaluator::new(PassTables::new());
        pass.add_input(&numbers, vec![1]);
        pass.latest(&numbers).unwrap();
        let tables = pass.to_immutable();

        let entry = tables.tables.get(&numbers.id()).unwrap();
        let err = entry.typed::<String>().unwrap_err();
        assert!(matches!(err, EngineError::TableTypeMismatch(ref stage) if stage == "numbers"));
    }

    #[test]
    fn test_cancellation_aborts_latest() {
        let flag = CancellationFlag::new();
        let leaf = Stage::<i32>::input("numbers");
        let mut pass = PassEvaluator::new(PassTables::new()).with_cancellation(flag.clone());
        pass.add_input(&leaf, vec![1]);

        flag.cancel();
        assert!(matches!(pass.latest(&leaf), Err(EngineError::Cancelled)));
    }

    #[test]
    fn test_step_tracking() {
        let leaf = Stage::<i32>::input("numbers");
        let doubled = leaf.map("double", |x| x * 2);

        let mut pass = PassEvaluator::new(PassTables::new()).with_step_tracking(true);
        pass.add_input(&leaf, vec![1, 2]);
        pass.latest(&doubled).unwrap();

        let (_, steps) = pass.finish();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].stage, "numbers");
        assert_eq!(steps[1].stage, "double");
        assert_eq!(steps[1].added, 2);
        assert!(!steps[1].faulted);
    }

    #[test]
    fn test_step_tracking_off_by_default() {
        let leaf = Stage::<i32>::input("numbers");
        let mut pass = PassEvaluator::new(PassTables::new());
        pass.add_input(&leaf, vec![1]);
        pass.latest(&leaf).unwrap();
        assert!(pass.steps().is_empty());
    }
}
