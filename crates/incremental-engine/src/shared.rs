//! Shared handle to the current driver
//!
//! Hosts that run passes from several threads keep the current
//! [`GeneratorDriver`] behind a [`SharedDriver`]. Operations that replace the
//! driver run one at a time under an operation lock held from the clone to
//! the publish, so a change made through [`SharedDriver::update`] is never
//! overwritten by a pass that started before it. Readers only take the
//! short read lock and are never blocked by a running pass.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::cancel::CancellationFlag;
use crate::driver::GeneratorDriver;
use crate::error::Result;

/// Thread-safe slot holding the current driver
pub struct SharedDriver<S> {
    current: Arc<RwLock<GeneratorDriver<S>>>,
    /// Held for the whole of every replacing operation
    operation: Arc<Mutex<()>>,
}

impl<S> Clone for SharedDriver<S> {
    fn clone(&self) -> Self {
        Self {
            current: self.current.clone(),
            operation: self.operation.clone(),
        }
    }
}

impl<S: Send + Sync + 'static> SharedDriver<S> {
    pub fn new(driver: GeneratorDriver<S>) -> Self {
        Self {
            current: Arc::new(RwLock::new(driver)),
            operation: Arc::new(Mutex::new(())),
        }
    }

    /// The currently published driver
    pub fn current(&self) -> GeneratorDriver<S> {
        self.current.read().clone()
    }

    /// Run a full pass on the current driver and publish the result
    ///
    /// On cancellation nothing is published.
    pub fn run_full_generation(
        &self,
        snapshot: Arc<S>,
        cancellation: &CancellationFlag,
    ) -> Result<Arc<S>> {
        let _operation = self.operation.lock();
        let driver = self
            .current()
            .run_full_generation_with_cancellation(snapshot.clone(), cancellation)?;
        let assembled = driver.assembled_snapshot().cloned().unwrap_or(snapshot);
        self.publish(driver);
        Ok(assembled)
    }

    /// Apply the current driver's pending edits and publish the result
    ///
    /// The resulting driver is published even when the edits are rejected,
    /// so later calls see that a full pass is required.
    pub fn try_apply_edits(&self, snapshot: Arc<S>) -> Result<Arc<S>> {
        let _operation = self.operation.lock();
        let application = self.current().try_apply_edits(snapshot);
        self.publish(application.driver);
        application.outcome
    }

    /// Replace the current driver with `f(current)`
    ///
    /// Waits for a running pass to publish first. `f` must not call back into
    /// this handle's replacing operations.
    pub fn update(&self, f: impl FnOnce(&GeneratorDriver<S>) -> GeneratorDriver<S>) {
        let _operation = self.operation.lock();
        let next = f(&self.current());
        self.publish(next);
    }

    fn publish(&self, driver: GeneratorDriver<S>) {
        *self.current.write() = driver;
    }
}
