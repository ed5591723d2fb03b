//! Admission of overlapping asynchronous calls.
//!
//! Every asynchronous call of a cache entry registers a run before it starts.
//! The entry's [`Reentrance`] policy decides what happens to a new call
//! while earlier runs are registered: fail it, let it run alongside, cancel
//! the earlier runs, or queue it behind the most recent one.

use super::cell::{CacheCell, Phase};
use crate::config::Reentrance;
use crate::error::{CoreError, CoreResult};
use crate::transaction::Transaction;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// The transaction a run is executing in, and whether it was superseded.
#[derive(Default)]
pub(crate) struct RunSlot {
    pub transaction: Option<Transaction>,
    pub canceled: Option<String>,
}

/// A registered run of a cache entry.
pub(crate) struct RunEntry {
    id: u64,
    slot: Arc<Mutex<RunSlot>>,
    done: watch::Receiver<bool>,
}

/// Permission for one call to run.
pub(crate) struct Admission {
    pub slot: Arc<Mutex<RunSlot>>,
    /// Completion of the run this call is queued behind.
    pub wait_for: Option<watch::Receiver<bool>>,
    pub guard: RunGuard,
}

/// Unregisters a run when dropped and reports its outcome.
pub(crate) struct RunGuard {
    cell: Arc<CacheCell>,
    id: u64,
    outcome: Phase,
    done: watch::Sender<bool>,
}

impl RunGuard {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Records how the run ended.
    pub fn finish(&mut self, outcome: Phase) {
        self.outcome = outcome;
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        {
            let mut state = self.cell.state.lock();
            state.runs.retain(|run| run.id != self.id);
            if state.runs.is_empty() {
                state.phase = self.outcome;
            }
        }
        self.done.send_replace(true);
    }
}

/// Registers a new run of `cell` according to its reentrance policy.
pub(crate) fn admit(cell: &Arc<CacheCell>) -> CoreResult<Admission> {
    let policy = cell.options().reentrance;
    let id = cell.next_run_id();
    let slot = Arc::new(Mutex::new(RunSlot::default()));
    let (done, receiver) = watch::channel(false);
    let mut superseded = Vec::new();
    let mut wait_for = None;
    {
        let mut state = cell.state.lock();
        if let Some(last) = state.runs.last() {
            match policy {
                Reentrance::PreventWithError => {
                    return Err(CoreError::Reentrance {
                        cache: cell.hint().to_string(),
                        running: describe(&last.slot),
                    });
                }
                Reentrance::RunSideBySide => {}
                Reentrance::CancelPrevious => {
                    superseded = state.runs.iter().map(|run| Arc::clone(&run.slot)).collect();
                }
                Reentrance::WaitAndRestart => wait_for = Some(last.done.clone()),
            }
        }
        state.runs.push(RunEntry {
            id,
            slot: Arc::clone(&slot),
            done: receiver,
        });
        state.phase = Phase::Running;
    }
    for previous in superseded {
        supersede(&previous, cell.hint());
    }
    if wait_for.is_some() {
        debug!(cache = cell.hint(), run = id, "call queued behind running call");
    }
    Ok(Admission {
        slot,
        wait_for,
        guard: RunGuard {
            cell: Arc::clone(cell),
            id,
            outcome: Phase::Canceled,
            done,
        },
    })
}

/// Records the transaction a run executes in; cancels it if the run was
/// superseded.
pub(crate) fn attach(slot: &Mutex<RunSlot>, transaction: &Transaction) {
    let reason = {
        let mut slot = slot.lock();
        slot.transaction = Some(transaction.clone());
        slot.canceled.clone()
    };
    if let Some(reason) = reason {
        transaction.cancel(CoreError::canceled(transaction.id(), transaction.hint(), reason), None);
    }
}

fn supersede(slot: &Mutex<RunSlot>, hint: &str) {
    debug!(cache = hint, "run superseded");
    cancel(slot, format!("superseded by newer call of {hint}"));
}

/// Cancels a run now if it is attached to a transaction, otherwise as soon
/// as it is.
pub(crate) fn cancel(slot: &Mutex<RunSlot>, reason: String) {
    let transaction = {
        let mut slot = slot.lock();
        slot.canceled.get_or_insert_with(|| reason.clone());
        slot.transaction.clone()
    };
    if let Some(transaction) = transaction {
        transaction.cancel(CoreError::canceled(transaction.id(), transaction.hint(), reason), None);
    }
}

fn describe(slot: &Mutex<RunSlot>) -> String {
    match &slot.lock().transaction {
        Some(transaction) => transaction.to_string(),
        None => "a pending call".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheOptions;
    use crate::Store;

    fn cell(store: &Store, policy: Reentrance) -> Arc<CacheCell> {
        let handle = store.handle("DemoModel");
        CacheCell::new(store, &handle, "load", CacheOptions::action().reentrance(policy))
    }

    #[test]
    fn prevent_rejects_second_call() {
        let store = Store::new();
        let cell = cell(&store, Reentrance::PreventWithError);
        let first = admit(&cell).unwrap();
        let tx = store.transaction("load");
        attach(&first.slot, &tx);

        let error = admit(&cell).err().unwrap();
        assert_eq!(
            error.to_string(),
            format!("{} is not reentrant over {} (load)", cell.hint(), tx.id())
        );
        assert_eq!(cell.phase(), Phase::Running);
        assert!(!tx.is_canceled());
    }

    #[test]
    fn phase_follows_last_run() {
        let store = Store::new();
        let cell = cell(&store, Reentrance::RunSideBySide);
        let mut first = admit(&cell).unwrap();
        let mut second = admit(&cell).unwrap();
        assert!(first.wait_for.is_none() && second.wait_for.is_none());

        first.guard.finish(Phase::Finished);
        drop(first);
        assert_eq!(cell.phase(), Phase::Running);

        second.guard.finish(Phase::Finished);
        drop(second);
        assert_eq!(cell.observe(), Phase::Finished);
        assert_eq!(cell.phase(), Phase::Idle);
    }

    #[test]
    fn cancel_previous_cancels_attached_and_pending_runs() {
        let store = Store::new();
        let cell = cell(&store, Reentrance::CancelPrevious);
        let first = admit(&cell).unwrap();
        let tx = store.transaction("load");
        attach(&first.slot, &tx);
        let pending = admit(&cell).unwrap();

        let _third = admit(&cell).unwrap();
        assert!(tx.is_canceled());
        assert!(tx.error().unwrap().is_canceled());

        let late = store.transaction("late");
        attach(&pending.slot, &late);
        assert!(late.is_canceled());
    }

    #[tokio::test]
    async fn wait_and_restart_queues_behind_last_run() {
        let store = Store::new();
        let cell = cell(&store, Reentrance::WaitAndRestart);
        let first = admit(&cell).unwrap();
        let second = admit(&cell).unwrap();
        let mut waiting = second.wait_for.clone().unwrap();
        assert!(!*waiting.borrow());

        drop(first);
        waiting.wait_for(|done| *done).await.unwrap();
        assert_eq!(cell.phase(), Phase::Running);
    }
}
