//! Versioned per-stage output tables
//!
//! A [`StateTable`] is the output of one stage for one pass. It is an ordered
//! list of slots; each slot holds the zero or more values produced from a
//! single upstream item, tagged with an [`EntryState`] relative to the
//! previous pass.
//!
//! # Lifecycle
//!
//! - Built during a pass with a [`StateTableBuilder`]
//! - Read by every downstream stage while still "live" (Added/Removed/Modified
//!   tags are meaningful inputs to consumers)
//! - Compacted at the end of the pass: removed slots disappear and every
//!   surviving entry becomes `Cached`
//! - Kept read-only as the previous table for the next pass

use std::sync::Arc;

use crate::error::Fault;
use crate::types::{EntryState, TableValue};

/// States of the entries in one slot
#[derive(Debug, Clone, PartialEq, Eq)]
enum SlotStates {
    /// Every entry (and the slot itself, when empty) shares one state
    Uniform(EntryState),
    /// One state per entry, not all equal
    PerEntry(Arc<[EntryState]>),
}

/// Values produced from one upstream item
#[derive(Debug, Clone, PartialEq, Eq)]
struct Slot<T> {
    items: Arc<[T]>,
    states: SlotStates,
}

impl<T> Slot<T> {
    fn uniform(items: Arc<[T]>, state: EntryState) -> Self {
        Self {
            items,
            states: SlotStates::Uniform(state),
        }
    }

    fn with_states(items: Vec<T>, states: Vec<EntryState>) -> Self {
        debug_assert_eq!(items.len(), states.len());
        let first = states.first().copied();
        let states = match first {
            None => SlotStates::Uniform(EntryState::Cached),
            Some(first) if states.iter().all(|s| *s == first) => SlotStates::Uniform(first),
            Some(_) => SlotStates::PerEntry(states.into()),
        };
        Self {
            items: items.into(),
            states,
        }
    }

    fn state_at(&self, index: usize) -> EntryState {
        match &self.states {
            SlotStates::Uniform(state) => *state,
            SlotStates::PerEntry(states) => states[index],
        }
    }

    fn is_removed(&self) -> bool {
        match &self.states {
            SlotStates::Uniform(state) => *state == EntryState::Removed,
            SlotStates::PerEntry(states) => states.iter().all(|s| *s == EntryState::Removed),
        }
    }

    fn retagged(&self, state: EntryState) -> Self {
        Self::uniform(self.items.clone(), state)
    }
}

impl<T: Clone> Slot<T> {
    fn compacted(&self) -> Self {
        match &self.states {
            SlotStates::Uniform(_) => self.retagged(EntryState::Cached),
            SlotStates::PerEntry(states) => {
                let items: Vec<T> = self
                    .items
                    .iter()
                    .zip(states.iter())
                    .filter(|(_, state)| state.is_live())
                    .map(|(item, _)| item.clone())
                    .collect();
                Self::uniform(items.into(), EntryState::Cached)
            }
        }
    }
}

/// Output table of one stage for one pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTable<T> {
    slots: Arc<[Slot<T>]>,
    compacted: bool,
    fault: Option<Fault>,
}

impl<T: TableValue> StateTable<T> {
    /// A table with no slots, already compacted
    pub fn empty() -> Self {
        Self {
            slots: Arc::from(Vec::new()),
            compacted: true,
            fault: None,
        }
    }

    /// A faulted table with no usable entries
    pub fn faulted(fault: Fault) -> Self {
        Self {
            slots: Arc::from(Vec::new()),
            compacted: false,
            fault: Some(fault),
        }
    }

    /// Start building a table
    pub fn builder() -> StateTableBuilder<T> {
        StateTableBuilder::new()
    }

    /// Number of slots
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Whether the table has no slots (a faulted table is also empty)
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Whether the table has been compacted
    pub fn is_compacted(&self) -> bool {
        self.compacted
    }

    /// Whether a fault was captured while building this table
    pub fn is_faulted(&self) -> bool {
        self.fault.is_some()
    }

    /// The captured fault, if any
    pub fn fault(&self) -> Option<&Fault> {
        self.fault.as_ref()
    }

    /// Flattened `(value, state)` pairs in slot order
    pub fn iter(&self) -> impl Iterator<Item = (&T, EntryState)> + '_ {
        self.slots.iter().flat_map(|slot| {
            slot.items
                .iter()
                .enumerate()
                .map(move |(i, item)| (item, slot.state_at(i)))
        })
    }

    /// Flattened pairs with owned values
    pub fn entries(&self) -> Vec<(T, EntryState)> {
        self.iter().map(|(item, state)| (item.clone(), state)).collect()
    }

    /// Values of every entry that is not `Removed`
    pub fn live_values(&self) -> Vec<T> {
        self.iter()
            .filter(|(_, state)| state.is_live())
            .map(|(item, _)| item.clone())
            .collect()
    }

    /// Entries of one slot
    pub fn slot(&self, index: usize) -> Option<Vec<(T, EntryState)>> {
        self.slots.get(index).map(|slot| {
            slot.items
                .iter()
                .enumerate()
                .map(|(i, item)| (item.clone(), slot.state_at(i)))
                .collect()
        })
    }

    pub(crate) fn slot_items(&self, index: usize) -> Option<&[T]> {
        self.slots.get(index).map(|slot| slot.items.as_ref())
    }

    /// Count entries in each state, as `[added, modified, cached, removed]`
    pub fn state_counts(&self) -> [usize; 4] {
        let mut counts = [0usize; 4];
        for (_, state) in self.iter() {
            let index = match state {
                EntryState::Added => 0,
                EntryState::Modified => 1,
                EntryState::Cached => 2,
                EntryState::Removed => 3,
            };
            counts[index] += 1;
        }
        counts
    }

    /// Normalize this table into the baseline for the next pass
    ///
    /// Wholly removed slots are dropped, removed entries inside surviving
    /// slots are dropped, and every remaining entry becomes `Cached`. A
    /// faulted table stays faulted.
    pub fn compact(&self) -> Self {
        if self.compacted {
            return self.clone();
        }
        let slots: Vec<Slot<T>> = self
            .slots
            .iter()
            .filter(|slot| !slot.is_removed())
            .map(Slot::compacted)
            .collect();
        Self {
            slots: slots.into(),
            compacted: true,
            fault: self.fault.clone(),
        }
    }

    fn previous_slot(&self, index: usize) -> &Slot<T> {
        assert!(
            index < self.slots.len(),
            "previous table has {} slots but slot {} was requested; \
             upstream and downstream tables are out of step",
            self.slots.len(),
            index
        );
        &self.slots[index]
    }
}

impl<T: TableValue> Default for StateTable<T> {
    fn default() -> Self {
        Self::empty()
    }
}

/// Mutable builder for a [`StateTable`]
///
/// Slots appended with [`StateTableBuilder::add_entries`] in the `Added`
/// state have no counterpart in the previous table; the builder tracks them
/// so later slots stay aligned with the previous table's positions.
pub struct StateTableBuilder<T> {
    slots: Vec<Slot<T>>,
    inserted: usize,
    fault: Option<Fault>,
}

impl<T: TableValue> StateTableBuilder<T> {
    /// Create an empty builder
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            inserted: 0,
            fault: None,
        }
    }

    /// Number of slots built so far
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no slots have been built
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Position in the previous table aligned with the next slot
    pub fn previous_index(&self) -> usize {
        self.slots.len() - self.inserted
    }

    /// Append one slot holding all `values` tagged `state`
    pub fn add_entries(&mut self, values: Vec<T>, state: EntryState) {
        if state == EntryState::Added {
            self.inserted += 1;
        }
        self.slots.push(Slot::uniform(values.into(), state));
    }

    /// Append the aligned slot of `previous`, re-tagged `state`
    ///
    /// # Panics
    ///
    /// Panics if `previous` has no slot at the aligned position. That means
    /// the upstream and downstream tables diverged outside the protocol.
    pub fn add_entries_from_previous(&mut self, previous: &StateTable<T>, state: EntryState) {
        let slot = previous.previous_slot(self.previous_index()).retagged(state);
        self.slots.push(slot);
    }

    /// Append a recomputed slot, comparing against the aligned previous slot
    ///
    /// Equal values are `Cached` and keep the previous value. Different
    /// values are `Modified`, values beyond the previous slot's length are
    /// `Added`, and previous values beyond the new length are kept once as
    /// `Removed`.
    ///
    /// # Panics
    ///
    /// Panics under the same condition as [`Self::add_entries_from_previous`].
    pub fn add_modified_entries<F>(&mut self, previous: &StateTable<T>, values: Vec<T>, comparer: F)
    where
        F: Fn(&T, &T) -> bool,
    {
        let old = previous.previous_slot(self.previous_index());
        let mut items = Vec::with_capacity(values.len().max(old.items.len()));
        let mut states = Vec::with_capacity(items.capacity());

        for (i, value) in values.into_iter().enumerate() {
            match old.items.get(i) {
                Some(old_value) if comparer(&value, old_value) => {
                    items.push(old_value.clone());
                    states.push(EntryState::Cached);
                }
                Some(_) => {
                    items.push(value);
                    states.push(EntryState::Modified);
                }
                None => {
                    items.push(value);
                    states.push(EntryState::Added);
                }
            }
        }
        for old_value in old.items.iter().skip(items.len()) {
            items.push(old_value.clone());
            states.push(EntryState::Removed);
        }

        self.slots.push(Slot::with_states(items, states));
    }

    /// Record a fault; the built table will carry it and no entries
    pub fn set_faulted(&mut self, fault: Fault) {
        self.fault = Some(fault);
    }

    /// Whether a fault has been recorded
    pub fn is_faulted(&self) -> bool {
        self.fault.is_some()
    }

    /// Freeze the builder into a live (uncompacted) table
    pub fn build(self) -> StateTable<T> {
        match self.fault {
            Some(fault) => StateTable::faulted(fault),
            None => StateTable {
                slots: self.slots.into(),
                compacted: false,
                fault: None,
            },
        }
    }
}

impl<T: TableValue> Default for StateTableBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}
