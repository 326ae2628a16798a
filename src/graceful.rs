use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use pin_project_lite::pin_project;

use crate::{
    sync::{Arc, AtomicU8, Ordering},
    trigger::{trigger, Receiver, Sender},
};

const PENDING: u8 = 0;
const DRAINED: u8 = 1;
const FORCED: u8 = 2;

/// Exactly-once completion state of a shutdown.
#[derive(Debug)]
pub(crate) struct Outcome {
    state: Arc<AtomicU8>,
    done_tx: Sender,
    done_rx: Receiver,
}

impl Outcome {
    pub(crate) fn new() -> Self {
        let (done_tx, done_rx) = trigger();
        Self {
            state: Arc::new(AtomicU8::new(PENDING)),
            done_tx,
            done_rx,
        }
    }

    /// Records the outcome, returns `false` if one was recorded before.
    pub(crate) fn complete(&self, drained: bool) -> bool {
        let value = if drained { DRAINED } else { FORCED };
        if self
            .state
            .compare_exchange(PENDING, value, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.done_tx.trigger();
        true
    }

    pub(crate) fn get(&self) -> Option<bool> {
        decode(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn wait(&self) -> Graceful {
        Graceful {
            done: self.done_rx.clone(),
            state: self.state.clone(),
        }
    }
}

fn decode(state: u8) -> Option<bool> {
    match state {
        DRAINED => Some(true),
        FORCED => Some(false),
        _ => None,
    }
}

pin_project! {
    /// Future returned by [`Coordinator::graceful`] and [`Coordinator::shutdown`].
    ///
    /// Resolves once the shutdown finished, to `true` if every connection
    /// drained on its own, or to `false` if the grace period expired first
    /// and remaining connections were forced closed.
    ///
    /// [`Coordinator::graceful`]: crate::Coordinator::graceful
    /// [`Coordinator::shutdown`]: crate::Coordinator::shutdown
    #[derive(Debug, Clone)]
    #[must_use = "futures do nothing unless polled"]
    pub struct Graceful {
        #[pin]
        done: Receiver,
        state: Arc<AtomicU8>,
    }
}

impl Graceful {
    /// Returns the outcome without waiting, `None` while still pending.
    pub fn outcome(&self) -> Option<bool> {
        decode(self.state.load(Ordering::SeqCst))
    }
}

impl Future for Graceful {
    type Output = bool;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.done.poll(cx) {
            Poll::Ready(()) => {
                Poll::Ready(decode(this.state.load(Ordering::SeqCst)).unwrap_or(false))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
