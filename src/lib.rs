//! Connection draining and graceful shutdown for tokio servers.
//!
//! A [`Coordinator`] wraps the accepting side of a server ([`Listener`]) and
//! tracks every open [`Connection`] together with the number of requests in
//! flight on it. [`Coordinator::shutdown`] then:
//!
//! 1. tells the listener to stop accepting new connections;
//! 2. ends idle connections on the next scheduling turn;
//! 3. ends busy connections as soon as their last request finished;
//! 4. optionally, once a grace period expires, ends and then destroys
//!    whatever is still open.
//!
//! The returned [`Graceful`] future resolves to `true` if all connections
//! drained on their own, or to `false` if the grace period forced them closed.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use tokio::net::TcpListener;
//! use tokio_drain::{accept_gate, close_signal, Coordinator, ShutdownOptions};
//!
//! # async fn serve() -> std::io::Result<()> {
//! let listener = TcpListener::bind("127.0.0.1:8080").await?;
//! let (gate, accepting) = accept_gate();
//! let coordinator = Coordinator::new(gate);
//!
//! let server = {
//!     let coordinator = coordinator.clone();
//!     tokio::spawn(async move {
//!         loop {
//!             let (stream, _) = tokio::select! {
//!                 _ = accepting.stopped() => break,
//!                 result = listener.accept() => match result {
//!                     Ok(accepted) => accepted,
//!                     Err(_) => continue,
//!                 },
//!             };
//!             let (handle, close) = close_signal();
//!             coordinator.on_connection_open(handle).into_spawn_task_fn(|conn| async move {
//!                 // serve requests on `stream`, holding `conn.request()` guards
//!                 // while a response is being produced, until `close.ended()`
//!                 # let _ = (stream, conn);
//!                 close.ended().await;
//!             });
//!         }
//!     })
//! };
//!
//! tokio::signal::ctrl_c().await?;
//! let drained = coordinator
//!     .shutdown(ShutdownOptions::new().with_timeout(Duration::from_secs(10)))
//!     .await;
//! # let _ = (server, drained);
//! # Ok(())
//! # }
//! ```

mod graceful;
mod guard;
mod listener;
mod shutdown;
mod sync;
mod tracker;
mod trigger;

pub use graceful::Graceful;
pub use guard::{ConnectionGuard, RequestGuard};
pub use listener::{
    accept_gate, close_signal, AcceptGate, AcceptSignal, CloseHandle, CloseSignal, Connection,
    Listener, ListenerClosed,
};
pub use shutdown::{Coordinator, Phase, ShutdownOptions};
pub use tracker::{ConnectionId, UnknownConnection};
