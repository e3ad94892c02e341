use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{Connection, ErrorCode};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::{HubError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub free: usize,
    pub in_use: usize,
    pub created: u64,
    pub discarded: u64,
    /// Connections handed out past `max_connections` after acquire gave up waiting.
    pub overflow: u64,
}

#[derive(Default)]
struct PoolState {
    free: Vec<Connection>,
    in_use: usize,
    created: u64,
    discarded: u64,
    overflow: u64,
    closed: bool,
}

/// Bounded set of SQLite connections. The state lock is never held while a
/// caller runs SQL or while `acquire` sleeps.
pub struct ConnectionPool {
    db_path: PathBuf,
    max_connections: usize,
    acquire_attempts: u32,
    base_delay: Duration,
    busy_timeout: Duration,
    state: Mutex<PoolState>,
}

impl ConnectionPool {
    pub fn new(config: &PoolConfig) -> Result<Self> {
        if let Some(parent) = config.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            db_path: config.db_path.clone(),
            max_connections: config.max_connections.max(1),
            acquire_attempts: config.acquire_attempts.max(1),
            base_delay: config.acquire_base_delay,
            busy_timeout: config.busy_timeout,
            state: Mutex::new(PoolState::default()),
        })
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Hands out a free connection, opens a new one below the limit, or waits
    /// with linear backoff. Once the attempts run out the limit is treated as
    /// soft: a warning is logged and an extra connection is opened.
    pub fn acquire(&self) -> Result<PooledConnection<'_>> {
        for attempt in 1..=self.acquire_attempts {
            match self.try_take()? {
                Slot::Ready(conn) => return Ok(self.guard(conn)),
                Slot::Open => return self.open_reserved(),
                Slot::Busy => {
                    let delay = self.base_delay * attempt;
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "pool busy, waiting");
                    std::thread::sleep(delay);
                }
            }
        }

        let in_use = {
            let mut state = self.lock();
            if state.closed {
                return Err(closed());
            }
            state.in_use += 1;
            state.overflow += 1;
            state.in_use
        };
        warn!(
            in_use,
            max = self.max_connections,
            "pool exhausted after {} attempts, opening overflow connection",
            self.acquire_attempts
        );
        self.open_reserved()
    }

    /// Like `acquire` but fails instead of overflowing.
    pub fn try_acquire(&self) -> Result<PooledConnection<'_>> {
        match self.try_take()? {
            Slot::Ready(conn) => Ok(self.guard(conn)),
            Slot::Open => self.open_reserved(),
            Slot::Busy => {
                let state = self.lock();
                Err(HubError::PoolExhausted {
                    in_use: state.in_use,
                    max: self.max_connections,
                })
            }
        }
    }

    /// Closes every idle connection and refuses further acquires. Connections
    /// still checked out are closed when their guards drop.
    pub fn close_all(&self) {
        let drained = {
            let mut state = self.lock();
            state.closed = true;
            std::mem::take(&mut state.free)
        };
        let count = drained.len();
        for conn in drained {
            if let Err((_, err)) = conn.close() {
                warn!(error = %err, "failed to close pooled connection");
            }
        }
        info!(closed = count, "connection pool closed");
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            free: state.free.len(),
            in_use: state.in_use,
            created: state.created,
            discarded: state.discarded,
            overflow: state.overflow,
        }
    }

    fn try_take(&self) -> Result<Slot> {
        let mut state = self.lock();
        if state.closed {
            return Err(closed());
        }
        if let Some(conn) = state.free.pop() {
            state.in_use += 1;
            return Ok(Slot::Ready(conn));
        }
        if state.in_use < self.max_connections {
            // Reserve the slot before opening outside the lock.
            state.in_use += 1;
            return Ok(Slot::Open);
        }
        Ok(Slot::Busy)
    }

    /// Opens a connection for a slot already counted in `in_use`.
    fn open_reserved(&self) -> Result<PooledConnection<'_>> {
        match self.open() {
            Ok(conn) => {
                self.lock().created += 1;
                Ok(self.guard(conn))
            }
            Err(err) => {
                self.lock().in_use -= 1;
                Err(err)
            }
        }
    }

    fn open(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        apply_pragmas(&conn, self.busy_timeout)?;
        debug!(path = %self.db_path.display(), "opened sqlite connection");
        Ok(conn)
    }

    fn guard(&self, conn: Connection) -> PooledConnection<'_> {
        PooledConnection {
            pool: self,
            conn: Some(conn),
            broken: false,
        }
    }

    fn release(&self, conn: Connection, mut broken: bool) {
        if !broken && !conn.is_autocommit() {
            warn!("connection returned inside a transaction, rolling back");
            if let Err(err) = conn.execute_batch("ROLLBACK") {
                warn!(error = %err, "rollback failed, discarding connection");
                broken = true;
            }
        }

        let mut state = self.lock();
        state.in_use = state.in_use.saturating_sub(1);
        let keep =
            !broken && !state.closed && state.free.len() + state.in_use < self.max_connections;
        if keep {
            state.free.push(conn);
            return;
        }
        if broken {
            state.discarded += 1;
        }
        drop(state);
        drop(conn);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

enum Slot {
    Ready(Connection),
    Open,
    Busy,
}

/// A closed pool reports itself as exhausted with no capacity.
fn closed() -> HubError {
    HubError::PoolExhausted { in_use: 0, max: 0 }
}

/// Pragmas applied once per physical connection.
fn apply_pragmas(conn: &Connection, busy_timeout: Duration) -> Result<()> {
    conn.busy_timeout(busy_timeout)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.execute_batch(
        "PRAGMA synchronous = NORMAL;
         PRAGMA temp_store = MEMORY;
         PRAGMA foreign_keys = ON;",
    )?;
    Ok(())
}

/// Whether an error means the connection itself is unusable, as opposed to
/// a failed statement.
pub fn is_connection_error(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => matches!(
            e.code,
            ErrorCode::CannotOpen
                | ErrorCode::DatabaseCorrupt
                | ErrorCode::NotADatabase
                | ErrorCode::SystemIoFailure
                | ErrorCode::OutOfMemory
                | ErrorCode::PermissionDenied
                | ErrorCode::ReadOnly
        ),
        _ => false,
    }
}

/// Scoped checkout. Returned to the pool on drop, or discarded when marked
/// broken.
pub struct PooledConnection<'a> {
    pool: &'a ConnectionPool,
    conn: Option<Connection>,
    broken: bool,
}

impl PooledConnection<'_> {
    /// Runs `f` and marks the connection broken if it fails with a
    /// connection-level error.
    pub fn run<T>(&mut self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let Some(conn) = self.conn.as_ref() else {
            return Err(closed());
        };
        match f(conn) {
            Ok(value) => Ok(value),
            Err(err) => {
                if is_connection_error(&err) {
                    warn!(error = %err, "discarding broken connection");
                    self.broken = true;
                }
                Err(err.into())
            }
        }
    }

    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl Deref for PooledConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // Only `None` after drop has started.
        self.conn.as_ref().unwrap_or_else(|| unreachable!("connection taken before drop"))
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, self.broken);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(dir: &tempfile::TempDir, max: usize) -> ConnectionPool {
        ConnectionPool::new(&PoolConfig {
            db_path: dir.path().join("hub.db"),
            max_connections: max,
            acquire_attempts: 3,
            acquire_base_delay: Duration::from_millis(5),
            busy_timeout: Duration::from_secs(1),
        })
        .expect("pool")
    }

    #[test]
    fn connections_are_reused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = pool(&dir, 2);
        {
            let conn = pool.acquire().expect("acquire");
            let mode: String = conn
                .query_row("PRAGMA journal_mode", [], |r| r.get(0))
                .expect("pragma");
            assert_eq!(mode.to_ascii_lowercase(), "wal");
        }
        let _again = pool.acquire().expect("acquire");
        let stats = pool.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.in_use, 1);
    }

    #[test]
    fn open_transaction_is_rolled_back_on_release() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = pool(&dir, 1);
        {
            let conn = pool.acquire().expect("acquire");
            conn.execute_batch("CREATE TABLE t (x INTEGER); BEGIN; INSERT INTO t VALUES (1);")
                .expect("begin");
        }
        let conn = pool.acquire().expect("acquire");
        assert!(conn.is_autocommit());
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))
            .expect("count");
        assert_eq!(n, 0);
    }

    #[test]
    fn try_acquire_fails_when_full() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = pool(&dir, 1);
        let _held = pool.acquire().expect("acquire");
        assert!(matches!(
            pool.try_acquire(),
            Err(HubError::PoolExhausted { in_use: 1, max: 1 })
        ));
    }
}
