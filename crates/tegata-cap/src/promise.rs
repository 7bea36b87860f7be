//! Single-threaded promise primitives the capability runtime is built on.
//!
//! Everything here is `!Send` and belongs to one tokio `LocalSet`; hooks,
//! call contexts, and their futures must all be created and driven inside
//! `LocalSet::run_until` (the same constraint the rest of the runtime
//! documents). A [`Promise`] is a boxed future fixed to [`crate::Error`];
//! [`ForkedPromise`] hands out independent branches of one result; a
//! [`Fulfiller`] is the write end of a one-shot.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::{Either, FutureExt, Shared};
use tokio::sync::oneshot;

use crate::error::Error;

type BoxedFuture<T> = Pin<Box<dyn Future<Output = Result<T, Error>>>>;

/// A future value, or the error that took its place.
pub struct Promise<T> {
    inner: BoxedFuture<T>,
}

impl<T: 'static> Promise<T> {
    pub fn from_future(future: impl Future<Output = Result<T, Error>> + 'static) -> Self {
        Self {
            inner: Box::pin(future),
        }
    }

    /// An already-fulfilled promise.
    pub fn ok(value: T) -> Self {
        Self::from_future(std::future::ready(Ok(value)))
    }

    /// An already-rejected promise.
    pub fn err(error: Error) -> Self {
        Self::from_future(std::future::ready(Err(error)))
    }

    /// Tie `owner`'s lifetime to this promise. The owner is dropped exactly
    /// when the promise resolves or is itself dropped.
    pub fn attach<O: 'static>(self, owner: O) -> Promise<T> {
        Promise::from_future(async move {
            let result = self.await;
            drop(owner);
            result
        })
    }

    /// Race two promises: whichever settles first (value or error) wins, and
    /// the loser is dropped on the spot.
    pub fn exclusive_join(self, other: Promise<T>) -> Promise<T> {
        Promise::from_future(async move {
            match futures::future::select(self, other).await {
                Either::Left((result, _)) => result,
                Either::Right((result, _)) => result,
            }
        })
    }

    /// Split this promise into a multi-subscriber handle.
    pub fn fork(self) -> ForkedPromise<T>
    where
        T: Clone,
    {
        ForkedPromise {
            inner: self.inner.shared(),
        }
    }
}

impl<T> Future for Promise<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().inner.as_mut().poll(cx)
    }
}

/// Multi-subscriber handle over one promise.
///
/// Branches poll the shared inner future cooperatively; once it settles,
/// every branch (including ones created afterwards) observes a clone of the
/// result. Dropping every branch drops the inner future, cancelling whatever
/// work it was driving.
pub struct ForkedPromise<T: Clone> {
    inner: Shared<BoxedFuture<T>>,
}

impl<T: Clone + 'static> ForkedPromise<T> {
    /// An independent future for this promise's outcome.
    pub fn add_branch(&self) -> Promise<T> {
        Promise::from_future(self.inner.clone())
    }
}

impl<T: Clone> Clone for ForkedPromise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Write end of a one-shot promise.
///
/// Dropping a fulfiller without calling [`Fulfiller::fulfill`] rejects the
/// paired promise.
pub struct Fulfiller<T> {
    sender: Option<oneshot::Sender<Result<T, Error>>>,
}

impl<T> Fulfiller<T> {
    pub fn fulfill(mut self, value: T) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(Ok(value));
        }
    }

    pub fn reject(mut self, error: Error) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(Err(error));
        }
    }
}

/// A promise and the fulfiller that settles it.
pub fn promise_and_fulfiller<T: 'static>() -> (Promise<T>, Fulfiller<T>) {
    let (sender, receiver) = oneshot::channel();
    let promise = Promise::from_future(async move {
        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(Error::failed(
                "fulfiller was dropped before fulfilling its promise",
            )),
        }
    });
    (
        promise,
        Fulfiller {
            sender: Some(sender),
        },
    )
}

/// Drive a promise to completion without holding a handle to it.
///
/// Errors are routed to the tracing sink: once nobody holds the promise
/// there is no caller left to report to.
pub fn daemonize(promise: Promise<()>) {
    tokio::task::spawn_local(async move {
        if let Err(error) = promise.await {
            tracing::debug!(%error, "daemonized promise failed");
        }
    });
}
