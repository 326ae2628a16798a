//! The contract between a [`Coordinator`] and the server it drains.
//!
//! A server hands its connections to the coordinator as [`Connection`]s
//! and exposes its accept loop as a [`Listener`]. For tokio based servers
//! [`close_signal`] and [`accept_gate`] provide ready made implementations
//! that turn the coordinator's requests into futures the server's own
//! tasks can `select!` on.
//!
//! [`Coordinator`]: crate::Coordinator

use std::fmt;

use crate::{
    sync::{lock, Arc, Mutex},
    trigger::{trigger, Receiver, Sender},
};

/// A transport connection the coordinator can close.
///
/// Both methods must tolerate being called on a connection
/// that is already closing or closed.
pub trait Connection: Send + Sync + 'static {
    /// Graceful end: flush buffered output, then close the transport.
    fn end(&self);

    /// Forceful destroy: abort the transport, discarding unflushed data.
    fn destroy(&self);
}

impl<T: Connection + ?Sized> Connection for std::sync::Arc<T> {
    fn end(&self) {
        (**self).end()
    }

    fn destroy(&self) {
        (**self).destroy()
    }
}

impl<T: Connection + ?Sized> Connection for Box<T> {
    fn end(&self) {
        (**self).end()
    }

    fn destroy(&self) {
        (**self).destroy()
    }
}

/// The accepting side of a server.
pub trait Listener: Send + Sync + 'static {
    /// Stop accepting new connections.
    ///
    /// Once the listener no longer accepts, it reports so by calling
    /// [`ListenerClosed::notify`] (or by dropping `closed`).
    fn stop_accepting(&self, closed: ListenerClosed);
}

impl<T: Listener + ?Sized> Listener for std::sync::Arc<T> {
    fn stop_accepting(&self, closed: ListenerClosed) {
        (**self).stop_accepting(closed)
    }
}

pub(crate) type OnComplete = Box<dyn FnOnce() + Send + 'static>;

/// Notifier handed to [`Listener::stop_accepting`].
///
/// Reports the listener closed when notified or dropped,
/// whichever comes first.
pub struct ListenerClosed {
    closed_tx: Sender,
    on_complete: Option<OnComplete>,
}

impl ListenerClosed {
    pub(crate) fn new(closed_tx: Sender, on_complete: Option<OnComplete>) -> Self {
        Self {
            closed_tx,
            on_complete,
        }
    }

    /// Report that the listener stopped accepting connections.
    pub fn notify(self) {
        drop(self)
    }
}

impl fmt::Debug for ListenerClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerClosed")
            .field("closed", &self.closed_tx.is_triggered())
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

impl Drop for ListenerClosed {
    fn drop(&mut self) {
        if self.closed_tx.trigger() {
            tracing::debug!("listener: closed, no longer accepting connections");
        }
        if let Some(on_complete) = self.on_complete.take() {
            on_complete();
        }
    }
}

/// Create a [`Connection`] for a tokio connection task.
///
/// The [`CloseHandle`] is registered with the coordinator,
/// the [`CloseSignal`] stays with the task serving the connection,
/// which is expected to stop reading new requests and close the transport
/// once [`CloseSignal::ended`] resolves, and to abort immediately once
/// [`CloseSignal::destroyed`] resolves.
pub fn close_signal() -> (CloseHandle, CloseSignal) {
    let (end_tx, end_rx) = trigger();
    let (destroy_tx, destroy_rx) = trigger();
    (
        CloseHandle { end_tx, destroy_tx },
        CloseSignal { end_rx, destroy_rx },
    )
}

/// Coordinator side of [`close_signal`].
#[derive(Debug, Clone)]
pub struct CloseHandle {
    end_tx: Sender,
    destroy_tx: Sender,
}

impl Connection for CloseHandle {
    fn end(&self) {
        self.end_tx.trigger();
    }

    fn destroy(&self) {
        self.end_tx.trigger();
        self.destroy_tx.trigger();
    }
}

/// Connection task side of [`close_signal`].
#[derive(Debug, Clone)]
pub struct CloseSignal {
    end_rx: Receiver,
    destroy_rx: Receiver,
}

impl CloseSignal {
    /// Resolves once the connection was asked to end (or destroyed).
    ///
    /// # Cancel safety
    ///
    /// This method is cancel safe.
    pub async fn ended(&self) {
        self.end_rx.clone().await
    }

    /// Resolves once the connection was asked to abort.
    ///
    /// # Cancel safety
    ///
    /// This method is cancel safe.
    pub async fn destroyed(&self) {
        self.destroy_rx.clone().await
    }

    pub fn is_ended(&self) -> bool {
        self.end_rx.is_triggered()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroy_rx.is_triggered()
    }
}

#[derive(Debug, Default)]
struct GateState {
    pending: Option<ListenerClosed>,
    loop_closed: bool,
}

/// Create a [`Listener`] for a tokio accept loop.
///
/// The [`AcceptGate`] is given to the coordinator, the [`AcceptSignal`]
/// is owned by the accept loop. The loop breaks out once
/// [`AcceptSignal::stopped`] resolves; dropping the signal reports
/// the listener closed.
pub fn accept_gate() -> (AcceptGate, AcceptSignal) {
    let (stop_tx, stop_rx) = trigger();
    let state = Arc::new(Mutex::new(GateState::default()));
    (
        AcceptGate {
            stop_tx,
            state: state.clone(),
        },
        AcceptSignal { stop_rx, state },
    )
}

/// Coordinator side of [`accept_gate`].
#[derive(Debug)]
pub struct AcceptGate {
    stop_tx: Sender,
    state: Arc<Mutex<GateState>>,
}

impl Listener for AcceptGate {
    fn stop_accepting(&self, closed: ListenerClosed) {
        let closed_now = {
            let mut state = lock(&self.state);
            if state.loop_closed {
                Some(closed)
            } else {
                state.pending = Some(closed);
                None
            }
        };
        self.stop_tx.trigger();
        if let Some(closed) = closed_now {
            tracing::trace!("accept gate: accept loop already gone");
            closed.notify();
        }
    }
}

/// Accept loop side of [`accept_gate`].
#[derive(Debug)]
pub struct AcceptSignal {
    stop_rx: Receiver,
    state: Arc<Mutex<GateState>>,
}

impl AcceptSignal {
    /// Resolves once the coordinator asked to stop accepting.
    ///
    /// # Cancel safety
    ///
    /// This method is cancel safe.
    pub async fn stopped(&self) {
        self.stop_rx.clone().await
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_rx.is_triggered()
    }
}

impl Drop for AcceptSignal {
    fn drop(&mut self) {
        let pending = {
            let mut state = lock(&self.state);
            state.loop_closed = true;
            state.pending.take()
        };
        if let Some(closed) = pending {
            closed.notify();
        }
    }
}
