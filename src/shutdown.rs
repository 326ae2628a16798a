use std::{fmt, time::Duration};

use tokio::time::Instant;

use crate::{
    graceful::{Graceful, Outcome},
    guard::ConnectionGuard,
    listener::{ListenerClosed, OnComplete},
    sync::{lock, Arc, Mutex},
    tracker::{ConnectionId, Tracker, UnknownConnection},
    trigger::{trigger, Receiver, Sender},
    Connection, Listener,
};

/// Options for [`Coordinator::shutdown`].
///
/// By default there is no grace period: connections are never destroyed,
/// only asked to end once they are idle, and the shutdown waits for as long
/// as that takes.
#[derive(Default)]
pub struct ShutdownOptions {
    on_complete: Option<OnComplete>,
    timeout: Option<Duration>,
}

impl ShutdownOptions {
    /// Create options without grace period and without callback.
    pub fn new() -> Self {
        Self::default()
    }

    /// Force remaining connections closed once `timeout` passed
    /// since the shutdown was requested.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Same as [`ShutdownOptions::with_timeout`], in milliseconds.
    pub fn with_timeout_ms(self, timeout_ms: u64) -> Self {
        self.with_timeout(Duration::from_millis(timeout_ms))
    }

    /// Callback invoked once the listener stopped accepting connections.
    ///
    /// Note that open connections might still be draining at that point,
    /// await [`Coordinator::graceful`] for those.
    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_complete = Some(Box::new(f));
        self
    }

    /// The configured grace period, `None` when connections are never forced closed.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl fmt::Debug for ShutdownOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownOptions")
            .field("on_complete", &self.on_complete.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Lifecycle of a [`Coordinator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Accepting and serving, no shutdown requested yet.
    Running,
    /// Shutdown requested: no new connections, in-flight work finishing.
    Draining,
    /// Listener closed, completion recorded and no connection left in the table.
    Terminated,
}

/// State shared between a [`Coordinator`] and its guards.
pub(crate) struct Shared<C> {
    tracker: Tracker<C>,
    outcome: Outcome,
    closed_tx: Sender,
    closed_rx: Receiver,
    draining_since: Mutex<Option<Instant>>,
}

impl<C: Connection> Shared<C> {
    fn new() -> Self {
        let (closed_tx, closed_rx) = trigger();
        Self {
            tracker: Tracker::new(),
            outcome: Outcome::new(),
            closed_tx,
            closed_rx,
            draining_since: Mutex::new(None),
        }
    }

    fn open(&self, conn: C) -> ConnectionId {
        let opened = self
            .tracker
            .open(Arc::new(conn), self.outcome.get().is_some());
        if let Some(conn) = opened.end_now {
            tracing::debug!(
                "shutdown: {} accepted while draining, ending it",
                opened.id
            );
            conn.end();
        }
        opened.id
    }

    pub(crate) fn close(&self, id: ConnectionId) -> bool {
        match self.tracker.close(id) {
            Some(left) => {
                if left == 0 && self.tracker.is_draining() {
                    self.complete(true);
                }
                true
            }
            None => {
                tracing::trace!("shutdown: ignore close of untracked {}", id);
                false
            }
        }
    }

    pub(crate) fn request_start(&self, id: ConnectionId) -> Result<usize, UnknownConnection> {
        self.tracker.request_start(id).map_err(|err| {
            tracing::warn!("shutdown: request started on untracked connection: {}", err);
            err
        })
    }

    pub(crate) fn request_finish(&self, id: ConnectionId) {
        if let Some(conn) = self.tracker.request_finish(id) {
            tracing::trace!("shutdown: {} became idle while draining, ending it", id);
            conn.end();
        }
    }

    pub(crate) fn count(&self, id: ConnectionId) -> Option<usize> {
        self.tracker.count(id)
    }

    fn elapsed_secs(&self) -> f64 {
        let since = *lock(&self.draining_since);
        since
            .map(|since| since.elapsed().as_secs_f64())
            .unwrap_or_default()
    }

    fn complete(&self, drained: bool) {
        if !self.outcome.complete(drained) {
            return;
        }
        if drained {
            tracing::info!(
                "shutdown: all connections drained after {}s",
                self.elapsed_secs()
            );
        } else {
            tracing::warn!(
                "shutdown: grace period expired after {}s with {} connections left",
                self.elapsed_secs(),
                self.tracker.len()
            );
        }
    }

    fn sweep_idle(&self) {
        let idle = self.tracker.sweep_idle();
        tracing::trace!("shutdown: ending {} idle connections", idle.len());
        for conn in idle {
            conn.end();
        }
    }
}

/// Grace timer: once `timeout` expires, end and then destroy
/// whatever is still tracked.
///
/// Runs even when the table was empty at shutdown, as the listener may
/// still register connections it accepted before it stopped.
async fn escalate<C: Connection>(shared: Arc<Shared<C>>, timeout: Duration) {
    tokio::time::sleep(timeout).await;

    shared.complete(shared.tracker.is_empty());

    let remaining = shared.tracker.remaining();
    if remaining.is_empty() {
        tracing::trace!("shutdown: grace period expired with nothing left to close");
        return;
    }
    tracing::warn!(
        "shutdown: grace period of {}s expired, ending {} connections",
        timeout.as_secs_f64(),
        remaining.len()
    );
    for conn in &remaining {
        conn.end();
    }
    drop(remaining);

    // one more turn for pending writes to flush before severing
    tokio::task::yield_now().await;

    let stuck = shared.tracker.remaining();
    if !stuck.is_empty() {
        tracing::warn!("shutdown: destroying {} connections", stuck.len());
    }
    for conn in stuck {
        conn.destroy();
    }
}

impl<C> fmt::Debug for Shared<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("connections", &self.tracker.len())
            .field("draining", &self.tracker.is_draining())
            .field("outcome", &self.outcome.get())
            .finish_non_exhaustive()
    }
}

/// Tracks the connections of a server and shuts it down gracefully.
///
/// The server reports its connection lifecycle through
/// [`Coordinator::on_connection_open`] (and the returned [`ConnectionGuard`]),
/// the coordinator closes connections through the [`Connection`] trait
/// and stops the server from accepting through the [`Listener`] trait.
///
/// Cloning a coordinator is cheap, all clones share the same state.
pub struct Coordinator<L, C> {
    shared: Arc<Shared<C>>,
    listener: Arc<L>,
}

impl<L, C> Clone for Coordinator<L, C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            listener: self.listener.clone(),
        }
    }
}

impl<L, C> fmt::Debug for Coordinator<L, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("shared", &self.shared)
            .finish_non_exhaustive()
    }
}

impl<L: Listener, C: Connection> Coordinator<L, C> {
    /// Wrap `listener`, starting out in [`Phase::Running`].
    pub fn new(listener: L) -> Self {
        Self {
            shared: Arc::new(Shared::new()),
            listener: Arc::new(listener),
        }
    }

    /// The wrapped listener.
    pub fn listener(&self) -> &L {
        &self.listener
    }

    /// Registers a freshly accepted connection with zero requests in flight.
    ///
    /// Dropping the returned guard (or passing its id to
    /// [`Coordinator::on_connection_close`]) removes the connection again.
    /// A connection registered while a shutdown already swept idle
    /// connections is asked to end right away.
    pub fn on_connection_open(&self, conn: C) -> ConnectionGuard<C> {
        let id = self.shared.open(conn);
        ConnectionGuard::new(self.shared.clone(), id)
    }

    /// Removes a closed connection from the tracking table.
    ///
    /// Returns `false` if it was not tracked, duplicate close events are fine.
    pub fn on_connection_close(&self, id: ConnectionId) -> bool {
        self.shared.close(id)
    }

    /// Increments the in-flight count of `id`, returning the new count.
    pub fn on_request_start(&self, id: ConnectionId) -> Result<usize, UnknownConnection> {
        self.shared.request_start(id)
    }

    /// Decrements the in-flight count of `id`.
    ///
    /// While draining, a connection left without requests is ended.
    /// Unknown connections are ignored.
    pub fn on_request_finish(&self, id: ConnectionId) {
        self.shared.request_finish(id)
    }

    /// Number of requests in flight on `id`, `None` if not tracked.
    pub fn count(&self, id: ConnectionId) -> Option<usize> {
        self.shared.count(id)
    }

    /// Number of connections currently tracked.
    pub fn num_connections(&self) -> usize {
        self.shared.tracker.len()
    }

    /// Whether [`Coordinator::shutdown`] was called.
    pub fn is_draining(&self) -> bool {
        self.shared.tracker.is_draining()
    }

    pub fn phase(&self) -> Phase {
        if !self.shared.tracker.is_draining() {
            Phase::Running
        } else if self.shared.closed_rx.is_triggered()
            && self.shared.outcome.get().is_some()
            && self.shared.tracker.is_empty()
        {
            Phase::Terminated
        } else {
            Phase::Draining
        }
    }

    /// Future resolving once a shutdown completed,
    /// see [`Graceful`] for the meaning of its output.
    ///
    /// Never resolves if [`Coordinator::shutdown`] is never called.
    pub fn graceful(&self) -> Graceful {
        self.shared.outcome.wait()
    }

    /// Resolves once the listener reported that it stopped accepting.
    ///
    /// # Cancel safety
    ///
    /// This method is cancel safe.
    pub async fn closed(&self) {
        self.shared.closed_rx.clone().await
    }

    /// Resolves once the listener closed and the shutdown completed,
    /// returning whether all connections drained gracefully.
    pub async fn terminated(&self) -> bool {
        self.closed().await;
        self.graceful().await
    }

    /// Starts a graceful shutdown.
    ///
    /// The listener is told to stop accepting, idle connections are ended on
    /// the next scheduling turn, busy ones once their last request finishes.
    /// With a timeout configured, connections still open when it expires are
    /// ended and, one turn later, destroyed.
    ///
    /// Calling it again while draining changes nothing: it returns the same
    /// pending completion and only schedules the new `on_complete` callback
    /// for when the listener closed.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn shutdown(&self, options: ShutdownOptions) -> Graceful {
        let ShutdownOptions {
            on_complete,
            timeout,
        } = options;

        if !self.shared.tracker.begin_drain() {
            tracing::debug!("shutdown: already draining, ignoring repeated shutdown");
            if let Some(on_complete) = on_complete {
                let closed = self.shared.closed_rx.clone();
                tokio::spawn(async move {
                    closed.await;
                    on_complete();
                });
            }
            return self.graceful();
        }

        *lock(&self.shared.draining_since) = Some(Instant::now());
        tracing::debug!(
            "shutdown: draining {} connections (timeout: {:?})",
            self.shared.tracker.len(),
            timeout
        );

        self.listener.stop_accepting(ListenerClosed::new(
            self.shared.closed_tx.clone(),
            on_complete,
        ));

        let shared = self.shared.clone();
        tokio::spawn(async move { shared.sweep_idle() });

        if self.shared.tracker.is_empty() {
            self.shared.complete(true);
        }
        if let Some(timeout) = timeout {
            tokio::spawn(escalate(self.shared.clone(), timeout));
        }

        self.graceful()
    }
}
