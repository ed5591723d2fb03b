//! Mutable lifecycle state of a transaction.

use super::Transaction;
use crate::error::CoreError;
use std::task::Waker;

/// Lifecycle bookkeeping guarded by the transaction mutex.
#[derive(Default)]
pub(crate) struct TransactionState {
    /// Synchronous runs and bound futures currently inside the transaction.
    pub workers: usize,
    /// No new work is accepted from outside; commits when workers reach zero.
    pub sealed: bool,
    /// Commit or cancel has been performed (or claimed).
    pub finalized: bool,
    /// Terminal error; set at most once.
    pub error: Option<CoreError>,
    /// Transaction to wait for before re-executing the body.
    pub retry_after: Option<Transaction>,
    /// Transaction spawned to re-run triggers invalidated by this one.
    pub reaction: Option<Transaction>,
    /// Bound futures to wake on cancellation.
    pub wakers: Vec<Waker>,
}

impl TransactionState {
    /// Claims the right to finalize once the transaction is sealed and idle.
    pub fn claim_finalize(&mut self) -> bool {
        if self.sealed && self.workers == 0 && !self.finalized {
            self.finalized = true;
            true
        } else {
            false
        }
    }

    pub fn register_waker(&mut self, waker: &Waker) {
        if !self.wakers.iter().any(|w| w.will_wake(waker)) {
            self.wakers.push(waker.clone());
        }
    }

    /// Returns true once no further work can run.
    pub fn is_finished(&self) -> bool {
        self.sealed && self.workers == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalize_is_claimed_once() {
        let mut state = TransactionState::default();
        assert!(!state.claim_finalize());

        state.workers = 1;
        state.sealed = true;
        assert!(!state.claim_finalize());
        assert!(!state.is_finished());

        state.workers = 0;
        assert!(state.claim_finalize());
        assert!(!state.claim_finalize());
        assert!(state.is_finished());
    }
}
