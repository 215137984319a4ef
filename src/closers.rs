//! The closer registry: every resource the server owns, closeable in bulk.
//!
//! A handle here is authority to close, not the socket itself: each entry
//! holds the cancellation token of the task that owns the sockets. Cancelling
//! it resolves the task's pending reads and writes, and the unwinding task
//! drops, and thereby closes, everything it holds. Drivers cannot be asked to
//! clean up cooperatively while suspended in a read; forcing the token under
//! them is what makes `close_all` bounded.

use std::collections::HashMap;
use std::fmt;

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloserKind {
    Listener,
    Connection,
}

impl fmt::Display for CloserKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloserKind::Listener => write!(f, "listener"),
            CloserKind::Connection => write!(f, "connection"),
        }
    }
}

/// Guarded by the server's state mutex; not synchronized on its own.
#[derive(Default)]
pub(crate) struct Closers {
    next_id: u64,
    entries: HashMap<u64, (CloserKind, CancellationToken)>,
}

impl Closers {
    pub(crate) fn register(&mut self, kind: CloserKind, token: CancellationToken) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, (kind, token));
        id
    }

    /// Removes an entry without closing it. Unknown ids are fine: the entry
    /// was already closed or drained.
    pub(crate) fn deregister(&mut self, id: u64) {
        self.entries.remove(&id);
    }

    /// Cancels and removes one entry. Returns what was closed, or `None`
    /// when the id was already gone, which callers treat as the
    /// already-closed case and swallow.
    pub(crate) fn close(&mut self, id: u64) -> Option<CloserKind> {
        self.entries.remove(&id).map(|(kind, token)| {
            token.cancel();
            kind
        })
    }

    /// Takes a snapshot of every entry and empties the registry. The caller
    /// cancels (and logs) each one; anything registered afterwards belongs
    /// to a server that is already going down.
    pub(crate) fn drain(&mut self) -> Vec<(CloserKind, CancellationToken)> {
        self.entries.drain().map(|(_, entry)| entry).collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
