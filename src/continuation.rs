use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::Result;
use crate::error::Error;

/// Single-use resume handle for callback-style collaborators.
///
/// Dropping a continuation without resuming it fails the waiting side with
/// [`Error::Deallocated`].
#[must_use = "a continuation must be resumed or the waiting stage fails with Deallocated"]
pub struct Continuation<T> {
    sender: oneshot::Sender<Result<T>>,
}

impl<T> Continuation<T> {
    pub fn resume(self, result: Result<T>) {
        let _ = self.sender.send(result);
    }

    pub fn succeed(self, value: T) {
        self.resume(Ok(value));
    }

    pub fn fail(self, error: Error) {
        self.resume(Err(error));
    }

    /// True once the awaiting side is gone and resuming has no effect.
    pub fn is_abandoned(&self) -> bool {
        self.sender.is_closed()
    }
}

impl<T> std::fmt::Debug for Continuation<T> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Continuation")
            .field("abandoned", &self.is_abandoned())
            .finish()
    }
}

/// Future side of a [`Continuation`].
pub struct Pending<T> {
    receiver: oneshot::Receiver<Result<T>>,
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(Error::Deallocated)))
    }
}

pub fn continuation<T>() -> (Continuation<T>, Pending<T>) {
    let (sender, receiver) = oneshot::channel();
    (Continuation { sender }, Pending { receiver })
}
