//! Completion callbacks and callback-to-future utilities.
//!
//! Commands complete asynchronously: a submission registers an
//! [`IoCompletion`] and the callback runs from inside
//! [`NvmeQpair::process_completions`] once the controller reports the command
//! done. The callback is a typed continuation: it owns whatever state the next
//! step needs, and receives the queue pair so it can submit follow-up
//! commands.
//!
//! Closures `FnOnce(&NvmeQpair, Completion)` are completions, so are explicit
//! state machines such as [`IoContext`](crate::pipeline::IoContext).
//!
//! For code that prefers `async`, this module also converts completions into
//! futures using oneshot channels:
//!
//! 1. Create a completion pair with [`completion()`]
//! 2. Move the sender into the completion callback
//! 3. In the callback, send the result
//! 4. Await the receiver while something polls the queue pair, e.g.
//!    [`block_on`]

use std::future::Future;
use std::pin::{Pin, pin};
use std::task::{Context, Poll};
use std::time::Instant;

use futures_channel::oneshot;
use futures_task::noop_waker_ref;

use crate::error::{Error, Result};
use crate::nvme::{Completion, NvmeQpair};
use crate::poller::PollLimit;

/// Continuation invoked when a submitted command completes.
///
/// Runs synchronously inside [`NvmeQpair::process_completions`]; it must not
/// block. It may submit new commands on `qpair`.
pub trait IoCompletion {
    /// Consume the continuation with the command's completion.
    fn complete(self: Box<Self>, qpair: &NvmeQpair, cpl: Completion);
}

impl<F> IoCompletion for F
where
    F: FnOnce(&NvmeQpair, Completion),
{
    fn complete(self: Box<Self>, qpair: &NvmeQpair, cpl: Completion) {
        (*self)(qpair, cpl)
    }
}

/// Sender half of a completion pair.
pub struct CompletionSender<T> {
    tx: oneshot::Sender<Result<T>>,
}

impl<T> CompletionSender<T> {
    /// Send a result.
    pub fn complete(self, result: Result<T>) {
        // Ignore send error - receiver may have been dropped
        let _ = self.tx.send(result);
    }
}

/// Receiver half of a completion pair.
///
/// Implements `Future` - await this to get the result. Resolves to
/// [`Error::Cancelled`] if the sender is dropped without sending, which is
/// what happens when a queue pair is dropped with the command in flight.
pub struct CompletionReceiver<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Future for CompletionReceiver<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Create a completion sender/receiver pair.
pub fn completion<T>() -> (CompletionSender<T>, CompletionReceiver<T>) {
    let (tx, rx) = oneshot::channel();
    (CompletionSender { tx }, CompletionReceiver { rx })
}

/// Block on a future, polling `qpair` while waiting.
///
/// This function runs the future to completion by repeatedly:
/// 1. Polling the future
/// 2. If pending, processing completions on the queue pair
///
/// This is necessary because completion callbacks only fire when the queue
/// pair is polled. Transport errors while polling are logged and polling
/// continues.
///
/// # Errors
///
/// [`Error::PollTimeout`] when `limit` is reached before the future resolves.
pub fn block_on<F: Future>(qpair: &NvmeQpair, limit: &PollLimit, future: F) -> Result<F::Output> {
    let mut cx = Context::from_waker(noop_waker_ref());
    let mut future = pin!(future);

    let start = Instant::now();
    let mut iterations = 0u64;

    loop {
        if let Poll::Ready(result) = future.as_mut().poll(&mut cx) {
            return Ok(result);
        }

        if limit.is_exhausted(iterations, start) {
            return Err(Error::PollTimeout { iterations });
        }
        iterations += 1;

        if let Err(err) = qpair.process_completions(limit.max_completions) {
            tracing::warn!(%err, "Error occurred in processing queue pairs");
        }
    }
}
