use anyhow::{bail, Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Supported values of `DB_TYPE`.
pub mod db_type {
    pub const SQLITE3: &str = "sqlite3";
    pub const MYSQL: &str = "mysql";
}

/// Single SQLite connection shared by the store, the rotation controller and
/// the migrator.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open the database selected by `DB_TYPE`.
    pub fn connect(db_type: &str, path: &str) -> Result<Self> {
        match db_type {
            "" | db_type::SQLITE3 => Self::open(path),
            db_type::MYSQL => bail!(
                "DB_TYPE {:?} is not available in this build, use {:?}",
                db_type::MYSQL,
                db_type::SQLITE3
            ),
            other => bail!("unknown DB_TYPE {other:?}, expected one of {:?}", [db_type::SQLITE3, db_type::MYSQL]),
        }
    }

    /// Open or create a SQLite database file.
    pub fn open(db_path: &str) -> Result<Self> {
        if let Some(dir) = Path::new(db_path).parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open database at {}", db_path))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    pub(crate) fn now() -> String {
        chrono::Utc::now().to_rfc3339()
    }
}
