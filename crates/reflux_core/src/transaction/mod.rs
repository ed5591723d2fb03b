//! Transactions.
//!
//! A transaction owns one [`Snapshot`] and executes code against it:
//!
//! - **Nesting**: [`Store::run`] joins the current transaction; a separate
//!   run spawns a new one.
//! - **Asynchronous bodies**: [`Transaction::bind`] wraps a future so every
//!   poll re-enters the transaction. The transaction commits only after all
//!   bound futures settle.
//! - **Commit**: sealing validates the snapshot against newer commits and
//!   installs its records atomically, or cancels it with a conflict.
//! - **Cancellation**: [`Transaction::cancel`] sets a terminal error seen by
//!   every later run and poll; with a retry target, the body is re-executed
//!   once the target finishes.

mod bound;
mod run;
mod state;

pub use bound::Bound;
pub use run::{nonreactive, outside, standalone};
pub(crate) use run::{autoretry, run_as};

use crate::cache::observer::Observer;
use crate::cache::trigger;
use crate::context::{self, Frame};
use crate::error::{CoreError, CoreResult};
use crate::snapshot::Snapshot;
use crate::store::Store;
use crate::types::{BoxFuture, SnapshotId};
use parking_lot::Mutex;
use state::TransactionState;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error};

struct Inner {
    store: Store,
    snapshot: Arc<Snapshot>,
    margin: usize,
    reaction_depth: usize,
    state: Mutex<TransactionState>,
    outcome: watch::Sender<Option<CoreResult<()>>>,
}

/// A unit of work executed against a private snapshot.
///
/// Cloning a transaction is cheap and yields the same transaction.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<Inner>,
}

impl Transaction {
    /// Starts a new root transaction.
    ///
    /// Started from inside a reaction, it keeps that reaction's depth.
    pub(crate) fn new(store: &Store, hint: &str) -> Self {
        let depth = Transaction::current()
            .filter(|t| t.store().same(store))
            .map_or(0, |t| t.reaction_depth());
        Self::spawn(store, hint, depth)
    }

    /// Starts a transaction at the given reaction depth.
    pub(crate) fn spawn(store: &Store, hint: &str, reaction_depth: usize) -> Self {
        let outer = Transaction::current().filter(|t| t.store().same(store));
        let margin = outer.as_ref().map_or(0, |t| t.margin() + 1);
        let parent = outer.as_ref().map(Transaction::id);
        let snapshot = Snapshot::acquire(store, hint, parent);
        let (outcome, _) = watch::channel(None);
        store.counters().record_transaction_start();
        debug!(transaction = %snapshot.id(), hint, margin, "transaction started");
        Self {
            inner: Arc::new(Inner {
                store: store.clone(),
                snapshot,
                margin,
                reaction_depth,
                state: Mutex::new(TransactionState::default()),
                outcome,
            }),
        }
    }

    /// Returns the transaction that is current on this thread.
    pub fn current() -> Option<Transaction> {
        context::current().transaction
    }

    /// Returns the transaction ID.
    #[must_use]
    pub fn id(&self) -> SnapshotId {
        self.inner.snapshot.id()
    }

    /// Returns the human-readable label.
    #[must_use]
    pub fn hint(&self) -> &str {
        self.inner.snapshot.hint()
    }

    /// Returns the nesting depth at creation, for diagnostics.
    #[must_use]
    pub fn margin(&self) -> usize {
        self.inner.margin
    }

    /// Returns the snapshot.
    pub fn snapshot(&self) -> &Arc<Snapshot> {
        &self.inner.snapshot
    }

    /// Returns the owning store.
    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub(crate) fn reaction_depth(&self) -> usize {
        self.inner.reaction_depth
    }

    pub(crate) fn same(&self, other: &Transaction) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn is_current(&self) -> bool {
        Transaction::current().is_some_and(|t| t.same(self))
    }

    /// Runs `f` with this transaction current.
    ///
    /// A failure returned by `f` cancels the transaction.
    pub fn run<T>(&self, f: impl FnOnce() -> CoreResult<T>) -> CoreResult<T> {
        self.guard()?;
        self.execute(false, f)
    }

    /// Runs `f` against this transaction's snapshot without modifying it.
    ///
    /// Writes fail with a misuse error, and failures of `f` do not cancel
    /// the transaction.
    pub fn inspect<T>(&self, f: impl FnOnce() -> CoreResult<T>) -> CoreResult<T> {
        self.execute(true, f)
    }

    /// Seals the transaction and commits it immediately.
    pub fn commit(&self) -> CoreResult<()> {
        {
            let state = self.inner.state.lock();
            if state.workers > 0 {
                return Err(CoreError::misuse("cannot commit transaction having active workers"));
            }
            if let Some(error) = &state.error {
                return Err(CoreError::misuse(format!(
                    "cannot commit transaction that is already canceled: {error}"
                )));
            }
        }
        self.seal()
    }

    /// Stops accepting new work; commits once running work has finished.
    ///
    /// Returns the commit failure if the transaction finalized during this
    /// call, or the terminal error if it was already sealed and canceled.
    pub fn seal(&self) -> CoreResult<()> {
        let claimed = {
            let mut state = self.inner.state.lock();
            if state.sealed {
                return state.error.clone().map_or(Ok(()), Err);
            }
            state.sealed = true;
            state.claim_finalize()
        };
        if claimed {
            self.finalize()
        } else {
            Ok(())
        }
    }

    /// Cancels the transaction with a terminal error.
    ///
    /// With `retry_after`, the runner re-executes the body against a fresh
    /// transaction once `retry_after` finishes, and
    /// [`when_finished`](Self::when_finished) resolves successfully. Has no
    /// effect on a finished transaction.
    pub fn cancel(&self, error: CoreError, retry_after: Option<&Transaction>) {
        let (claimed, wakers) = {
            let mut state = self.inner.state.lock();
            if state.finalized {
                return;
            }
            if state.error.is_none() {
                debug!(transaction = %self.id(), hint = self.hint(), reason = %error, "transaction canceled");
                state.error = Some(error);
                state.retry_after = retry_after.cloned();
            }
            state.sealed = true;
            (state.claim_finalize(), std::mem::take(&mut state.wakers))
        };
        for waker in wakers {
            waker.wake();
        }
        if claimed {
            let _ = self.finalize();
        }
    }

    /// Wraps a future so that every poll runs inside this transaction.
    ///
    /// The transaction counts the bound future as a worker until it
    /// completes or is dropped. After cancellation the next poll returns the
    /// terminal error without polling `future`.
    pub fn bind<T, F>(&self, future: F) -> CoreResult<Bound<T>>
    where
        F: Future<Output = CoreResult<T>> + Send + 'static,
    {
        let frame = self.frame(false);
        self.bind_frame(Box::pin(future), frame)
    }

    pub(crate) fn bind_observed<T>(
        &self,
        future: BoxFuture<CoreResult<T>>,
        observer: Option<Arc<Observer>>,
    ) -> CoreResult<Bound<T>> {
        let mut frame = self.frame(false);
        if observer.is_some() {
            frame.observer = observer;
        }
        self.bind_frame(future, frame)
    }

    fn bind_frame<T>(&self, future: BoxFuture<CoreResult<T>>, frame: Frame) -> CoreResult<Bound<T>> {
        self.guard()?;
        self.inner.state.lock().workers += 1;
        Ok(Bound::new(self.clone(), frame, future))
    }

    /// Binds `future`, awaits it and, for a root transaction, seals and
    /// waits until the transaction has finished.
    ///
    /// `finish` sees the body's result inside this transaction before it is
    /// sealed. It is skipped when the transaction is going to be retried.
    pub(crate) async fn settle<T>(
        &self,
        future: BoxFuture<CoreResult<T>>,
        observer: Option<Arc<Observer>>,
        root: bool,
        finish: impl FnOnce(&CoreResult<T>),
    ) -> CoreResult<T> {
        let result = match self.bind_observed(future, observer) {
            Ok(bound) => bound.await,
            Err(error) => Err(error),
        };
        if self.retry_target().is_none() {
            let _guard = context::enter(self.frame(false));
            finish(&result);
        }
        if !root {
            return result;
        }
        let sealed = self.seal();
        let finished = self.when_finished(false).await;
        let value = result?;
        sealed?;
        finished?;
        Ok(value)
    }

    /// Returns true if the transaction has a terminal error.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.inner.state.lock().error.is_some()
    }

    /// Returns true once the transaction is sealed and no work is running.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.inner.state.lock().is_finished()
    }

    /// Returns the terminal error, if any.
    #[must_use]
    pub fn error(&self) -> Option<CoreError> {
        self.inner.state.lock().error.clone()
    }

    /// Returns the reaction spawned after this transaction finished.
    #[must_use]
    pub fn reaction(&self) -> Option<Transaction> {
        self.inner.state.lock().reaction.clone()
    }

    pub(crate) fn retry_target(&self) -> Option<Transaction> {
        self.inner.state.lock().retry_after.clone()
    }

    /// Waits until the transaction has committed or been canceled.
    ///
    /// Resolves with the terminal error of a canceled transaction, unless it
    /// was canceled with a retry target. With `including_reaction`, also
    /// waits for the chain of reactions this transaction caused.
    pub async fn when_finished(&self, including_reaction: bool) -> CoreResult<()> {
        let mut transaction = self.clone();
        loop {
            transaction.outcome().await?;
            if !including_reaction {
                return Ok(());
            }
            match transaction.reaction() {
                Some(reaction) => transaction = reaction,
                None => return Ok(()),
            }
        }
    }

    async fn outcome(&self) -> CoreResult<()> {
        let mut receiver = self.inner.outcome.subscribe();
        loop {
            let current = receiver.borrow_and_update().clone();
            if let Some(outcome) = current {
                return outcome;
            }
            if receiver.changed().await.is_err() {
                return Err(CoreError::fatal("transaction outcome channel closed"));
            }
        }
    }

    /// Reverts the changes of a committed transaction in a new transaction.
    pub fn undo(&self) -> CoreResult<()> {
        if self.inner.snapshot.state() != crate::snapshot::SnapshotState::Committed {
            return Err(CoreError::misuse(format!(
                "cannot undo transaction {} ({}) that is not committed",
                self.id(),
                self.hint()
            )));
        }
        let reverts = self.inner.snapshot.reverts();
        let hint = format!("{}.undo", self.hint());
        run_as(&self.inner.store, &hint, true, || {
            let current = Transaction::current()
                .ok_or_else(|| CoreError::fatal("undo is running outside of its transaction"))?;
            for (handle, base, fields) in reverts {
                for field in fields {
                    current.snapshot().write(&handle, field, base.get(field))?;
                }
            }
            Ok(())
        })
    }

    fn guard(&self) -> CoreResult<()> {
        let state = self.inner.state.lock();
        if let Some(error) = &state.error {
            return Err(error.clone());
        }
        if state.sealed && !self.is_current() {
            return Err(CoreError::misuse(format!(
                "cannot run transaction {} ({}) that is already sealed",
                self.id(),
                self.hint()
            )));
        }
        Ok(())
    }

    /// Builds the frame this transaction runs in, keeping the recording
    /// observer when re-entered from its own frame.
    fn frame(&self, inspection: bool) -> Frame {
        let outer = context::current();
        let joined = outer.transaction.as_ref().is_some_and(|t| t.same(self));
        Frame {
            transaction: Some(self.clone()),
            observer: if joined { outer.observer } else { None },
            inspection: inspection || (joined && outer.inspection),
            nonreactive: joined && outer.nonreactive,
        }
    }

    fn execute<T>(&self, inspection: bool, f: impl FnOnce() -> CoreResult<T>) -> CoreResult<T> {
        self.inner.state.lock().workers += 1;
        let result = {
            let _guard = context::enter(self.frame(inspection));
            f()
        };
        if let Err(error) = &result {
            if !inspection {
                self.cancel(error.clone(), None);
            }
        }
        merge(result, self.leave())
    }

    pub(crate) fn register_waker(&self, waker: &std::task::Waker) {
        self.inner.state.lock().register_waker(waker);
    }

    /// Removes one worker; finalizes if it was the last one of a sealed
    /// transaction and returns the outcome.
    pub(crate) fn leave(&self) -> Option<CoreResult<()>> {
        let claimed = {
            let mut state = self.inner.state.lock();
            state.workers = state.workers.saturating_sub(1);
            state.claim_finalize()
        };
        claimed.then(|| self.finalize())
    }

    fn finalize(&self) -> CoreResult<()> {
        let error = self.inner.state.lock().error.clone();
        let outcome = match error {
            None => self.perform_commit(),
            Some(error) => {
                self.perform_cancel(&error);
                Err(error)
            }
        };
        let reaction = trigger::react(self);
        let (wakers, retrying) = {
            let mut state = self.inner.state.lock();
            state.reaction = reaction;
            (std::mem::take(&mut state.wakers), state.retry_after.is_some())
        };
        for waker in wakers {
            waker.wake();
        }
        let published = if retrying { Ok(()) } else { outcome.clone() };
        self.inner.outcome.send_replace(Some(published));
        outcome
    }

    fn perform_commit(&self) -> CoreResult<()> {
        let snapshot = &self.inner.snapshot;
        let store = &self.inner.store;
        snapshot.seal();
        let applied = {
            let _lock = store.commit_lock();
            let conflicts = snapshot.rebase();
            if conflicts.is_empty() {
                snapshot.apply(store.next_timestamp())
            } else {
                Err(CoreError::Conflict {
                    transaction: self.id(),
                    hint: self.hint().to_string(),
                    conflicts,
                })
            }
        };
        snapshot.archive();
        match applied {
            Ok(invalidated) => {
                store.counters().record_transaction_commit();
                debug!(
                    transaction = %self.id(),
                    hint = self.hint(),
                    margin = self.margin(),
                    invalidated = invalidated.len(),
                    "transaction committed"
                );
                Ok(())
            }
            Err(failure) => {
                match &failure {
                    CoreError::Fatal { message } => {
                        error!(transaction = %self.id(), hint = self.hint(), message, "commit failed");
                    }
                    CoreError::Conflict { .. } => {
                        store.counters().record_conflict();
                        debug!(transaction = %self.id(), hint = self.hint(), error = %failure, "transaction conflict");
                    }
                    _ => {}
                }
                self.inner.state.lock().error = Some(failure.clone());
                let dropped = snapshot.discard();
                if failure.is_conflict() {
                    for cell in dropped.into_iter().filter(|cell| cell.is_trigger()) {
                        snapshot.push_trigger(cell);
                    }
                }
                store.counters().record_transaction_cancel();
                Err(failure)
            }
        }
    }

    fn perform_cancel(&self, error: &CoreError) {
        let snapshot = &self.inner.snapshot;
        snapshot.seal();
        let _ = snapshot.discard();
        snapshot.archive();
        self.inner.store.counters().record_transaction_cancel();
        debug!(transaction = %self.id(), hint = self.hint(), error = %error, "transaction rolled back");
    }
}

/// Combines a body result with the outcome of a finalization it caused.
pub(crate) fn merge<T>(result: CoreResult<T>, finalized: Option<CoreResult<()>>) -> CoreResult<T> {
    match (result, finalized) {
        (Ok(_), Some(Err(error))) => Err(error),
        (result, _) => result,
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Transaction")
            .field("id", &self.id())
            .field("hint", &self.hint())
            .field("margin", &self.inner.margin)
            .field("workers", &state.workers)
            .field("sealed", &state.sealed)
            .field("error", &state.error)
            .finish()
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id(), self.hint())
    }
}
