use std::fmt;

use slab::Slab;

use crate::sync::{lock, Arc, Mutex};

/// Identity of a connection registered with a [`Coordinator`].
///
/// Ids are never reused: a stale id (for example one that already
/// received its close event) simply no longer matches any entry.
///
/// [`Coordinator`]: crate::Coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    key: usize,
    seq: u64,
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.seq)
    }
}

/// Returned when a request hook names a connection that is not tracked,
/// either because it was never opened or because it already closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownConnection(pub ConnectionId);

impl fmt::Display for UnknownConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection {} is not tracked", self.0)
    }
}

impl std::error::Error for UnknownConnection {}

#[derive(Debug)]
struct Entry<C> {
    seq: u64,
    conn: Arc<C>,
    in_flight: usize,
    ending: bool,
}

#[derive(Debug)]
struct Table<C> {
    entries: Slab<Entry<C>>,
    next_seq: u64,
    draining: bool,
    swept: bool,
}

impl<C> Table<C> {
    fn entry_mut(&mut self, id: ConnectionId) -> Option<&mut Entry<C>> {
        self.entries.get_mut(id.key).filter(|entry| entry.seq == id.seq)
    }

    fn entry(&self, id: ConnectionId) -> Option<&Entry<C>> {
        self.entries.get(id.key).filter(|entry| entry.seq == id.seq)
    }
}

/// Result of registering a connection.
#[derive(Debug)]
pub(crate) struct Opened<C> {
    pub(crate) id: ConnectionId,
    /// Set when the connection arrived too late for the idle sweep of a shutdown.
    pub(crate) end_now: Option<Arc<C>>,
}

/// The connection table: connection -> number of in-flight requests,
/// plus the draining flag that gates closure on request completion.
///
/// Every method decides under the lock and hands connections that must be
/// ended back to the caller, which acts on them after the lock is released.
#[derive(Debug)]
pub(crate) struct Tracker<C> {
    table: Mutex<Table<C>>,
}

impl<C> Tracker<C> {
    pub(crate) fn new() -> Self {
        Self {
            table: Mutex::new(Table {
                entries: Slab::new(),
                next_seq: 0,
                draining: false,
                swept: false,
            }),
        }
    }

    /// Registers `conn` with zero requests in flight.
    ///
    /// While draining, the connection is handed back to be ended right away
    /// if the idle sweep already ran or if `drain_finished` is set.
    pub(crate) fn open(&self, conn: Arc<C>, drain_finished: bool) -> Opened<C> {
        let mut table = lock(&self.table);
        let seq = table.next_seq;
        table.next_seq += 1;

        let ending = table.draining && (table.swept || drain_finished);
        let end_now = ending.then(|| conn.clone());
        let key = table.entries.insert(Entry {
            seq,
            conn,
            in_flight: 0,
            ending,
        });
        let id = ConnectionId { key, seq };
        tracing::trace!(
            "tracker: open {} (connections: {})",
            id,
            table.entries.len()
        );
        Opened { id, end_now }
    }

    /// Removes the entry, returning the number of connections left,
    /// or `None` if `id` was not tracked (duplicate close).
    pub(crate) fn close(&self, id: ConnectionId) -> Option<usize> {
        let mut table = lock(&self.table);
        table.entry(id)?;
        table.entries.remove(id.key);
        let left = table.entries.len();
        tracing::trace!("tracker: close {} (connections: {})", id, left);
        Some(left)
    }

    pub(crate) fn request_start(&self, id: ConnectionId) -> Result<usize, UnknownConnection> {
        let mut table = lock(&self.table);
        let entry = table.entry_mut(id).ok_or(UnknownConnection(id))?;
        entry.in_flight += 1;
        tracing::trace!("tracker: request start on {} (in flight: {})", id, entry.in_flight);
        Ok(entry.in_flight)
    }

    /// Decrements the in-flight count of `id`.
    ///
    /// Returns the connection every time it becomes idle while draining.
    pub(crate) fn request_finish(&self, id: ConnectionId) -> Option<Arc<C>> {
        let mut table = lock(&self.table);
        let draining = table.draining;
        let entry = table.entry_mut(id)?;
        entry.in_flight = entry.in_flight.saturating_sub(1);
        tracing::trace!(
            "tracker: request finish on {} (in flight: {})",
            id,
            entry.in_flight
        );
        if draining && entry.in_flight < 1 {
            entry.ending = true;
            return Some(entry.conn.clone());
        }
        None
    }

    pub(crate) fn count(&self, id: ConnectionId) -> Option<usize> {
        lock(&self.table).entry(id).map(|entry| entry.in_flight)
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.table).entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        lock(&self.table).entries.is_empty()
    }

    pub(crate) fn is_draining(&self) -> bool {
        lock(&self.table).draining
    }

    /// Flips the table into draining mode.
    ///
    /// Returns `false` if it was already draining.
    pub(crate) fn begin_drain(&self) -> bool {
        let mut table = lock(&self.table);
        if table.draining {
            return false;
        }
        table.draining = true;
        true
    }

    /// Marks every idle connection as ending and returns them.
    pub(crate) fn sweep_idle(&self) -> Vec<Arc<C>> {
        let mut table = lock(&self.table);
        table.swept = true;
        table
            .entries
            .iter_mut()
            .filter(|(_, entry)| entry.in_flight == 0 && !entry.ending)
            .map(|(_, entry)| {
                entry.ending = true;
                entry.conn.clone()
            })
            .collect()
    }

    /// Marks every remaining connection as ending and returns them all,
    /// regardless of whether they were already asked to end.
    pub(crate) fn remaining(&self) -> Vec<Arc<C>> {
        let mut table = lock(&self.table);
        table
            .entries
            .iter_mut()
            .map(|(_, entry)| {
                entry.ending = true;
                entry.conn.clone()
            })
            .collect()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn tracker() -> Tracker<&'static str> {
        Tracker::new()
    }

    #[test]
    fn open_registers_idle_connection() {
        let tracker = tracker();
        let opened = tracker.open(Arc::new("a"), false);
        assert!(opened.end_now.is_none());
        assert_eq!(tracker.count(opened.id), Some(0));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn requests_move_the_in_flight_count() {
        let tracker = tracker();
        let id = tracker.open(Arc::new("a"), false).id;
        assert_eq!(tracker.request_start(id), Ok(1));
        assert_eq!(tracker.request_start(id), Ok(2));
        assert!(tracker.request_finish(id).is_none());
        assert_eq!(tracker.count(id), Some(1));
    }

    #[test]
    fn duplicate_close_is_a_noop() {
        let tracker = tracker();
        let a = tracker.open(Arc::new("a"), false).id;
        let b = tracker.open(Arc::new("b"), false).id;
        assert_eq!(tracker.close(a), Some(1));
        assert_eq!(tracker.close(a), None);
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.count(b), Some(0));
    }

    #[test]
    fn stale_id_does_not_hit_reused_slot() {
        let tracker = tracker();
        let a = tracker.open(Arc::new("a"), false).id;
        tracker.close(a);
        let b = tracker.open(Arc::new("b"), false).id;
        assert_eq!(a.key, b.key);
        assert_ne!(a, b);

        assert_eq!(tracker.close(a), None);
        assert_eq!(tracker.request_start(a), Err(UnknownConnection(a)));
        assert!(tracker.request_finish(a).is_none());
        assert_eq!(tracker.count(a), None);
        assert_eq!(tracker.count(b), Some(0));
    }

    #[test]
    fn finish_on_removed_connection_is_a_noop() {
        let tracker = tracker();
        let id = tracker.open(Arc::new("a"), false).id;
        tracker.request_start(id).unwrap();
        tracker.close(id);
        tracker.begin_drain();
        assert!(tracker.request_finish(id).is_none());
        assert!(tracker.is_empty());
    }

    #[test]
    fn finish_while_draining_hands_out_connection_each_time_idle() {
        let tracker = tracker();
        let id = tracker.open(Arc::new("a"), false).id;
        tracker.request_start(id).unwrap();
        tracker.request_start(id).unwrap();
        assert!(tracker.begin_drain());
        assert!(!tracker.begin_drain());

        assert!(tracker.request_finish(id).is_none());
        assert_eq!(tracker.request_finish(id).as_deref(), Some(&"a"));

        tracker.request_start(id).unwrap();
        assert_eq!(tracker.request_finish(id).as_deref(), Some(&"a"));
    }

    #[test]
    fn swept_connection_is_ended_again_when_idle_again() {
        let tracker = tracker();
        let id = tracker.open(Arc::new("a"), false).id;
        tracker.begin_drain();
        assert_eq!(tracker.sweep_idle().len(), 1);

        tracker.request_start(id).unwrap();
        assert_eq!(tracker.request_finish(id).as_deref(), Some(&"a"));
        assert!(tracker.sweep_idle().is_empty());
    }

    #[test]
    fn sweep_only_returns_idle_connections() {
        let tracker = tracker();
        let idle = tracker.open(Arc::new("idle"), false).id;
        let busy = tracker.open(Arc::new("busy"), false).id;
        tracker.request_start(busy).unwrap();
        tracker.begin_drain();

        let swept = tracker.sweep_idle();
        assert_eq!(swept.len(), 1);
        assert_eq!(*swept[0], "idle");
        assert!(tracker.sweep_idle().is_empty());

        assert_eq!(tracker.request_finish(busy).as_deref(), Some(&"busy"));
        assert_eq!(tracker.count(idle), Some(0));
        assert_eq!(tracker.remaining().len(), 2);
    }

    #[test]
    fn late_connection_is_ended_after_sweep() {
        let tracker = tracker();
        tracker.begin_drain();
        assert!(tracker.open(Arc::new("early"), false).end_now.is_none());
        tracker.sweep_idle();
        let late = tracker.open(Arc::new("late"), false);
        assert_eq!(late.end_now.as_deref(), Some(&"late"));
        assert!(tracker.sweep_idle().is_empty());
    }

    #[test]
    fn connection_after_finished_drain_is_ended_before_sweep() {
        let tracker = tracker();
        assert!(tracker.open(Arc::new("running"), true).end_now.is_none());
        tracker.begin_drain();
        let late = tracker.open(Arc::new("late"), true);
        assert_eq!(late.end_now.as_deref(), Some(&"late"));
        assert_eq!(tracker.sweep_idle().len(), 1);
    }
}
