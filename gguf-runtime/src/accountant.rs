//! Tracking of memory held by native model weights.
//!
//! The accountant mirrors how much externally allocated memory is alive so
//! the embedding application can factor it into its own memory pressure
//! decisions. Every successful load adds the model's native size once and the
//! matching unload subtracts the identical value.

use crate::error::{ModelError, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Receives the new total after every change
pub type PressureObserver = Box<dyn Fn(u64) + Send + Sync>;

#[derive(Default)]
pub struct ResourceAccountant {
    total: AtomicU64,
    allocations: AtomicUsize,
    observer: Mutex<Option<PressureObserver>>,
}

impl std::fmt::Debug for ResourceAccountant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceAccountant")
            .field("total", &self.total())
            .field("allocations", &self.allocations())
            .finish()
    }
}

impl ResourceAccountant {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Install a callback notified with the tracked total after each change
    pub fn set_observer(&self, observer: impl Fn(u64) + Send + Sync + 'static) {
        *self.observer.lock() = Some(Box::new(observer));
    }

    pub fn add(&self, bytes: u64) {
        let total = self.total.fetch_add(bytes, Ordering::SeqCst) + bytes;
        self.allocations.fetch_add(1, Ordering::SeqCst);
        log::debug!("Tracking {} external bytes (total {})", bytes, total);
        self.notify(total);
    }

    /// Release a previously added amount; never takes the total below zero
    pub fn subtract(&self, bytes: u64) -> Result<()> {
        let update = self
            .total
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |tracked| tracked.checked_sub(bytes));
        match update {
            Ok(previous) => {
                let total = previous - bytes;
                self.allocations.fetch_sub(1, Ordering::SeqCst);
                log::debug!("Released {} external bytes (total {})", bytes, total);
                self.notify(total);
                Ok(())
            }
            Err(tracked) => Err(ModelError::AccountingUnderflow {
                requested: bytes,
                tracked,
            }),
        }
    }

    /// Bytes currently tracked
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    /// Outstanding `add` calls without a matching `subtract`
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }

    fn notify(&self, total: u64) {
        if let Some(observer) = self.observer.lock().as_ref() {
            observer(total);
        }
    }
}
