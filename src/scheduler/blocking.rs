//! Scoped blocking annotations.
//!
//! Task code wraps blocking regions in a [`ScopedBlockingCall`]. Pool workers
//! install a per-thread observer at main entry; the guard forwards blocking
//! transitions to it so the pool can grow capacity while threads are parked
//! on I/O or synchronization.

use std::cell::{Cell, RefCell};
use std::sync::Arc;

/// How certain the caller is that the region will block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BlockingType {
    /// The region may block, e.g. a file read that could hit the page cache
    MayBlock,
    /// The region will block, e.g. waiting on an event another task signals
    WillBlock,
}

/// Receives blocking transitions from the current thread.
pub trait BlockingObserver: Send + Sync {
    /// A blocking region of type `blocking_type` was entered.
    fn blocking_started(&self, blocking_type: BlockingType);
    /// A nested `WillBlock` region upgraded an active `MayBlock` region.
    fn blocking_type_upgraded(&self);
    /// The outermost blocking region was left.
    fn blocking_ended(&self);
}

thread_local! {
    static OBSERVER: RefCell<Option<Arc<dyn BlockingObserver>>> =
        const { RefCell::new(None) };
    static ACTIVE_TYPE: Cell<Option<BlockingType>> = const { Cell::new(None) };
}

/// Installs (or clears) the blocking observer for the current thread.
/// Workers call this at main entry and exit.
pub fn set_blocking_observer(observer: Option<Arc<dyn BlockingObserver>>) {
    OBSERVER.with(|slot| *slot.borrow_mut() = observer);
}

fn with_observer(f: impl FnOnce(&Arc<dyn BlockingObserver>)) {
    OBSERVER.with(|slot| {
        if let Some(observer) = slot.borrow().as_ref() {
            f(observer);
        }
    });
}

/// RAII guard marking a blocking region.
///
/// Construction and destruction map to `blocking_started` / `blocking_ended`
/// on the current thread's observer. Nested guards of the same or weaker
/// type are no-ops; a `WillBlock` guard nested in a `MayBlock` region
/// reports an upgrade that lasts until the outermost guard ends.
pub struct ScopedBlockingCall {
    previous: Option<BlockingType>,
}

impl ScopedBlockingCall {
    /// Enters a blocking region of `blocking_type`.
    pub fn new(blocking_type: BlockingType) -> Self {
        let previous = ACTIVE_TYPE.with(|cell| cell.get());
        match (previous, blocking_type) {
            (None, _) => with_observer(|o| o.blocking_started(blocking_type)),
            (Some(BlockingType::MayBlock), BlockingType::WillBlock) => {
                with_observer(|o| o.blocking_type_upgraded());
            }
            _ => {}
        }
        let effective = previous.map_or(blocking_type, |p| p.max(blocking_type));
        ACTIVE_TYPE.with(|cell| cell.set(Some(effective)));
        Self { previous }
    }
}

impl Drop for ScopedBlockingCall {
    fn drop(&mut self) {
        ACTIVE_TYPE.with(|cell| cell.set(self.previous));
        if self.previous.is_none() {
            with_observer(|o| o.blocking_ended());
        }
    }
}
