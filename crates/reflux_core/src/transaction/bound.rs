//! Futures bound to a transaction.

use super::{merge, Transaction};
use crate::context::{self, Frame};
use crate::error::CoreResult;
use crate::types::BoxFuture;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// A future whose every poll runs inside its transaction.
///
/// Created by [`Transaction::bind`]. The transaction counts the future as a
/// worker until it completes or is dropped.
pub struct Bound<T> {
    transaction: Transaction,
    frame: Frame,
    future: Option<BoxFuture<CoreResult<T>>>,
}

impl<T> Bound<T> {
    pub(super) fn new(transaction: Transaction, frame: Frame, future: BoxFuture<CoreResult<T>>) -> Self {
        Self {
            transaction,
            frame,
            future: Some(future),
        }
    }

    /// Returns the transaction the future is bound to.
    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }
}

impl<T> Future for Bound<T> {
    type Output = CoreResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let Some(future) = this.future.as_mut() else {
            return Poll::Pending;
        };
        if let Some(error) = this.transaction.error() {
            this.future = None;
            let finalized = this.transaction.leave();
            return Poll::Ready(merge(Err(error), finalized));
        }
        this.transaction.register_waker(cx.waker());
        let polled = {
            let _guard = context::enter(this.frame.clone());
            future.as_mut().poll(cx)
        };
        match polled {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                this.future = None;
                if let Err(error) = &result {
                    if !this.frame.inspection {
                        this.transaction.cancel(error.clone(), None);
                    }
                }
                Poll::Ready(merge(result, this.transaction.leave()))
            }
        }
    }
}

impl<T> Drop for Bound<T> {
    fn drop(&mut self) {
        if self.future.take().is_some() {
            let _ = self.transaction.leave();
        }
    }
}

impl<T> fmt::Debug for Bound<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bound")
            .field("transaction", &self.transaction)
            .field("pending", &self.future.is_some())
            .finish()
    }
}
