//! Stage handles and the node trait
//!
//! Every stage in a pipeline is a [`Stage<T>`]: a cheap, cloneable handle
//! pairing a stable [`StageId`] with the [`Node`] that computes the stage's
//! table. The id is allocated once when the handle is created, so the same
//! logical stage finds its previous table on every pass.

use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::evaluator::PassEvaluator;
use crate::table::StateTable;
use crate::types::{StageId, TableValue};

/// Identity and name of a stage, handed to its node on every update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageInfo {
    id: StageId,
    name: Arc<str>,
}

impl StageInfo {
    /// Stable identity
    pub fn id(&self) -> StageId {
        self.id
    }

    /// Human-readable name
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Computes one stage's table for a pass
///
/// Implementations request their upstream tables through `pass`, which
/// memoizes them, so shared upstream stages are computed once per pass.
/// Failures of user code are recorded in the returned table as a fault;
/// an `Err` is reserved for errors that abort the pass (cancellation).
pub trait Node<T>: Send + Sync {
    /// Compute this pass's table
    fn update_state_table(
        &self,
        pass: &mut PassEvaluator,
        previous: Option<&StateTable<T>>,
        stage: &StageInfo,
    ) -> Result<StateTable<T>>;
}

/// Typed handle to a stage in a pipeline
pub struct Stage<T> {
    info: StageInfo,
    node: Arc<dyn Node<T>>,
}

impl<T: TableValue> Stage<T> {
    /// Create a stage from a node
    pub fn new(name: impl Into<String>, node: impl Node<T> + 'static) -> Self {
        Self {
            info: StageInfo {
                id: StageId::next(),
                name: Arc::from(name.into()),
            },
            node: Arc::new(node),
        }
    }

    /// Stable identity of this stage
    pub fn id(&self) -> StageId {
        self.info.id
    }

    /// Human-readable name
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Identity and name together
    pub fn info(&self) -> &StageInfo {
        &self.info
    }

    pub(crate) fn node(&self) -> &Arc<dyn Node<T>> {
        &self.node
    }
}

impl<T> Clone for Stage<T> {
    fn clone(&self) -> Self {
        Self {
            info: self.info.clone(),
            node: self.node.clone(),
        }
    }
}

impl<T> fmt::Debug for Stage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("id", &self.info.id)
            .field("name", &self.info.name)
            .finish()
    }
}

/// A previous table is only a usable baseline if it did not fault
pub(crate) fn usable_previous<T: TableValue>(
    previous: Option<&StateTable<T>>,
) -> Option<&StateTable<T>> {
    previous.filter(|table| !table.is_faulted())
}
