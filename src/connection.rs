// Shared connection. The engine opens exactly one `RustConnection` per
// session; this wraps it in a `Mutex` so the capture path, the
// damage/cursor subscriptions, and input injection all serialise through
// the same lock instead of racing on independent connections. Grounded on
// the cooperative-locking contract this crate's concurrency model
// requires: every call that touches the connection is bracketed by
// acquiring the lock before the request and releasing it after the
// reply (or after `flush`, for fire-and-forget calls).

use std::sync::Mutex;

use x11rb::rust_connection::RustConnection;

use crate::prelude::*;

/// Owns the session's one `RustConnection`. Every subsystem that talks to
/// the X server — capture, damage, cursor, input — borrows or shares this
/// instead of opening its own connection.
pub struct SharedConnection {
    inner: Mutex<RustConnection>,
}

impl SharedConnection {
    pub fn new(conn: RustConnection) -> Self {
        Self {
            inner: Mutex::new(conn),
        }
    }

    /// Runs `f` with the connection locked for the whole call. `f` should
    /// cover one full request/reply round trip (or, for input, one whole
    /// gesture of several requests plus a flush) so no other subsystem's
    /// traffic can interleave with it.
    pub fn locked<R>(&self, f: impl FnOnce(&RustConnection) -> Result<R>) -> Result<R> {
        let conn = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&conn)
    }
}
