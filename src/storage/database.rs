use rusqlite::{Connection, Result as SqlResult};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Base database connection wrapper.
///
/// The connection sits behind a mutex so one store can be shared between
/// threads; every statement group runs while holding the guard.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn new<P: AsRef<Path>>(path: P) -> SqlResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> SqlResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn connection(&self) -> MutexGuard<'_, Connection> {
        // Open transactions roll back on drop, so a poisoned lock is still consistent.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
