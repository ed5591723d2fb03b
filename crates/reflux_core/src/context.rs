//! Per-thread execution context.
//!
//! The current transaction, the cache computation recording reads, and the
//! inspection/nonreactive flags form one [`Frame`]. Frames are entered with
//! [`enter`] and restored when the returned guard drops, so nested calls and
//! every poll of a bound future see exactly the frame they were started in.

use crate::cache::observer::Observer;
use crate::transaction::Transaction;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Arc;

thread_local! {
    static FRAME: RefCell<Frame> = RefCell::new(Frame::default());
}

/// The execution context of the running code.
#[derive(Clone, Default)]
pub(crate) struct Frame {
    /// Transaction whose snapshot reads and writes go to.
    pub transaction: Option<Transaction>,
    /// Cache computation that records reads.
    pub observer: Option<Arc<Observer>>,
    /// Writes fail and failures do not cancel the transaction.
    pub inspection: bool,
    /// Reads are not recorded by the observer.
    pub nonreactive: bool,
}

impl Frame {
    /// Returns the observer that should record reads, if any.
    pub fn recording(&self) -> Option<&Arc<Observer>> {
        if self.nonreactive {
            None
        } else {
            self.observer.as_ref()
        }
    }
}

/// Restores the previous frame on drop.
pub(crate) struct FrameGuard {
    prev: Option<Frame>,
    // Frames are thread-local; the guard must drop on the thread that made it.
    _local: PhantomData<*const ()>,
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        if let Some(prev) = self.prev.take() {
            FRAME.with(|frame| *frame.borrow_mut() = prev);
        }
    }
}

/// Makes `frame` current until the guard drops.
pub(crate) fn enter(frame: Frame) -> FrameGuard {
    let prev = FRAME.with(|current| current.replace(frame));
    FrameGuard {
        prev: Some(prev),
        _local: PhantomData,
    }
}

/// Returns a copy of the current frame.
pub(crate) fn current() -> Frame {
    FRAME.with(|frame| frame.borrow().clone())
}

/// Runs `f` with the current frame modified by `change`.
pub(crate) fn with<T>(change: impl FnOnce(&mut Frame), f: impl FnOnce() -> T) -> T {
    let mut frame = current();
    change(&mut frame);
    let _guard = enter(frame);
    f()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_restores_previous_frame() {
        assert!(!current().inspection);
        {
            let _outer = enter(Frame {
                inspection: true,
                ..Frame::default()
            });
            assert!(current().inspection);
            {
                let _inner = enter(Frame::default());
                assert!(!current().inspection);
            }
            assert!(current().inspection);
        }
        assert!(!current().inspection);
    }

    #[test]
    fn with_modifies_a_copy() {
        let nonreactive = with(|frame| frame.nonreactive = true, || current().nonreactive);
        assert!(nonreactive);
        assert!(!current().nonreactive);
    }
}
