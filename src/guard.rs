use std::{fmt, future::Future};

use tokio::task::JoinHandle;

use crate::{
    shutdown::Shared,
    sync::Arc,
    tracker::{ConnectionId, UnknownConnection},
    Connection,
};

/// A guard, linked to a [`Coordinator`], representing one open connection.
///
/// Dropping the guard is the connection's close event: the connection is
/// removed from the tracking table, and if a shutdown is draining and this
/// was the last connection, the shutdown completes gracefully.
///
/// [`Coordinator`]: crate::Coordinator
pub struct ConnectionGuard<C: Connection> {
    shared: Arc<Shared<C>>,
    id: ConnectionId,
}

/// A guard, linked to a [`ConnectionGuard`], representing one in-flight request.
///
/// Dropping the guard is the request's finish event.
/// Drop it once the response was fully written.
pub struct RequestGuard<C: Connection> {
    shared: Arc<Shared<C>>,
    id: ConnectionId,
}

impl<C: Connection> ConnectionGuard<C> {
    pub(crate) fn new(shared: Arc<Shared<C>>, id: ConnectionId) -> Self {
        Self { shared, id }
    }

    /// The id under which this connection is tracked.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Number of requests currently in flight on this connection,
    /// `None` if it is no longer tracked.
    pub fn in_flight(&self) -> Option<usize> {
        self.shared.count(self.id)
    }

    /// Marks the start of a request on this connection.
    ///
    /// Fails only if the connection was already closed
    /// through [`Coordinator::on_connection_close`].
    ///
    /// [`Coordinator::on_connection_close`]: crate::Coordinator::on_connection_close
    pub fn request(&self) -> Result<RequestGuard<C>, UnknownConnection> {
        self.shared.request_start(self.id)?;
        Ok(RequestGuard {
            shared: self.shared.clone(),
            id: self.id,
        })
    }

    /// Returns a Tokio [`JoinHandle`] that can be awaited on
    /// to wait for the spawned connection task to complete. See
    /// [`tokio::spawn`] for more information.
    ///
    /// The guard is moved into the task and dropped once the task future
    /// is fulfilled, closing the connection in the tracking table.
    ///
    /// [`JoinHandle`]: https://docs.rs/tokio/*/tokio/task/struct.JoinHandle.html
    /// [`tokio::spawn`]: https://docs.rs/tokio/*/tokio/task/fn.spawn.html
    pub fn into_spawn_task<T>(self, task: T) -> JoinHandle<T::Output>
    where
        T: Future + Send + 'static,
        T::Output: Send + 'static,
    {
        tokio::spawn(async move {
            let output = task.await;
            drop(self);
            output
        })
    }

    /// Returns a Tokio [`JoinHandle`] that can be awaited on
    /// to wait for the spawned connection task (fn) to complete.
    ///
    /// In contrast to [`ConnectionGuard::into_spawn_task`] the task function
    /// receives the guard, so it can start requests on the connection.
    pub fn into_spawn_task_fn<F, T>(self, task: F) -> JoinHandle<T::Output>
    where
        F: FnOnce(ConnectionGuard<C>) -> T + Send + 'static,
        T: Future + Send + 'static,
        T::Output: Send + 'static,
    {
        tokio::spawn(async move { task(self).await })
    }

    /// Explicit close event, equivalent to dropping the guard.
    pub fn close(self) {
        drop(self)
    }
}

impl<C: Connection> Drop for ConnectionGuard<C> {
    fn drop(&mut self) {
        self.shared.close(self.id);
    }
}

impl<C: Connection> fmt::Debug for ConnectionGuard<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionGuard")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl<C: Connection> RequestGuard<C> {
    /// The connection this request runs on.
    pub fn connection_id(&self) -> ConnectionId {
        self.id
    }
}

impl<C: Connection> Drop for RequestGuard<C> {
    fn drop(&mut self) {
        self.shared.request_finish(self.id);
    }
}

impl<C: Connection> fmt::Debug for RequestGuard<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestGuard")
            .field("connection", &self.id)
            .finish_non_exhaustive()
    }
}
