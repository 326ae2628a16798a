//! One-shot broadcast latch.
//!
//! A [`Sender`] fires the latch at most once, every [`Receiver`]
//! (and every clone of one) resolves from then on.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll, Waker},
};

use pin_project_lite::pin_project;
use slab::Slab;

use crate::sync::{lock, Arc, AtomicBool, Mutex, Ordering};

#[derive(Debug)]
struct Latch {
    fired: AtomicBool,
    wakers: Mutex<Slab<Waker>>,
}

impl Latch {
    fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Registers (or refreshes) the waker stored under `key`,
    /// returns `None` if the latch fired in the meantime.
    fn register(&self, cx: &mut Context<'_>, key: Option<usize>) -> Option<usize> {
        let mut wakers = lock(&self.wakers);
        if self.is_fired() {
            return None;
        }

        let waker = cx.waker().clone();
        match key.and_then(|key| wakers.get_mut(key).map(|slot| (key, slot))) {
            Some((key, slot)) => {
                if !slot.will_wake(&waker) {
                    *slot = waker;
                }
                Some(key)
            }
            None => {
                let key = wakers.insert(waker);
                tracing::trace!("trigger: registered waker under key {}", key);
                Some(key)
            }
        }
    }

    fn forget(&self, key: usize) {
        let mut wakers = lock(&self.wakers);
        if wakers.try_remove(key).is_some() {
            tracing::trace!("trigger: removed waker under key {}", key);
        }
    }
}

#[derive(Debug)]
enum ReceiverState {
    Waiting { latch: Arc<Latch>, key: Option<usize> },
    Done,
}

impl Clone for ReceiverState {
    fn clone(&self) -> Self {
        match self {
            ReceiverState::Waiting { latch, .. } => ReceiverState::Waiting {
                latch: latch.clone(),
                key: None,
            },
            ReceiverState::Done => ReceiverState::Done,
        }
    }
}

impl Drop for ReceiverState {
    fn drop(&mut self) {
        if let ReceiverState::Waiting {
            latch,
            key: Some(key),
        } = self
        {
            latch.forget(*key);
        }
    }
}

pin_project! {
    /// Future resolving once the paired [`Sender`] fired.
    #[derive(Debug, Clone)]
    pub(crate) struct Receiver {
        state: ReceiverState,
    }
}

impl Receiver {
    pub(crate) fn is_triggered(&self) -> bool {
        match &self.state {
            ReceiverState::Waiting { latch, .. } => latch.is_fired(),
            ReceiverState::Done => true,
        }
    }
}

impl Future for Receiver {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let next_key = match this.state {
            ReceiverState::Waiting { latch, key } => {
                if latch.is_fired() {
                    None
                } else {
                    latch.register(cx, *key)
                }
            }
            ReceiverState::Done => return Poll::Ready(()),
        };
        match next_key {
            Some(key) => {
                if let ReceiverState::Waiting { key: slot, .. } = this.state {
                    *slot = Some(key);
                }
                Poll::Pending
            }
            None => {
                *this.state = ReceiverState::Done;
                Poll::Ready(())
            }
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Sender {
    latch: Arc<Latch>,
}

impl Sender {
    /// Fires the latch, waking all registered receivers.
    ///
    /// Returns `true` only for the call that actually fired it.
    pub(crate) fn trigger(&self) -> bool {
        let wakers = lock(&self.latch.wakers);
        if self.latch.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        for (key, waker) in wakers.iter() {
            tracing::trace!("trigger: wake waker under key {}", key);
            waker.wake_by_ref();
        }
        true
    }

    pub(crate) fn is_triggered(&self) -> bool {
        self.latch.is_fired()
    }
}

pub(crate) fn trigger() -> (Sender, Receiver) {
    let latch = Arc::new(Latch {
        fired: AtomicBool::new(false),
        wakers: Mutex::new(Slab::new()),
    });
    let receiver = Receiver {
        state: ReceiverState::Waiting {
            latch: latch.clone(),
            key: None,
        },
    };
    (Sender { latch }, receiver)
}
