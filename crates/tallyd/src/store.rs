//! SQLite-backed series store.
//!
//! Schema:
//!   currencies(name TEXT PRIMARY KEY)
//!   finance(id, currency, value, inc_rel, inc_abs, date)   date = unix ms
//!
//! One connection behind a mutex; worker tasks take turns.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};

use tally_services::store::now_millis;
use tally_services::{HistoryEntry, SeriesStore, SeriesSummary, StoreError, StoreStatus};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS currencies (
        name TEXT PRIMARY KEY
    );
    CREATE TABLE IF NOT EXISTS finance (
        id       INTEGER PRIMARY KEY,
        currency TEXT    NOT NULL,
        value    REAL    NOT NULL,
        inc_rel  REAL    NOT NULL,
        inc_abs  REAL    NOT NULL,
        date     INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS finance_currency ON finance (currency, id);
";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Backend(format!("create {}: {e}", parent.display()))
            })?;
        }
        Self::init(Connection::open(path).map_err(backend)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(backend)?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(backend)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend("connection lock poisoned".into()))
    }
}

fn exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM currencies WHERE name = ?1",
        params![name],
        |_| Ok(()),
    )
    .optional()
    .map(|row| row.is_some())
}

impl SeriesStore for SqliteStore {
    fn add(&self, name: &str) -> Result<StoreStatus, StoreError> {
        let conn = self.conn()?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO currencies (name) VALUES (?1)",
                params![name],
            )
            .map_err(backend)?;
        Ok(if inserted == 0 {
            StoreStatus::AlreadyExists
        } else {
            StoreStatus::Ok
        })
    }

    fn add_value(&self, name: &str, value: f64) -> Result<StoreStatus, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(backend)?;
        if !exists(&tx, name).map_err(backend)? {
            return Ok(StoreStatus::NotFound);
        }
        let previous: Option<f64> = tx
            .query_row(
                "SELECT value FROM finance WHERE currency = ?1 ORDER BY id DESC LIMIT 1",
                params![name],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)?;
        let entry = HistoryEntry::after(previous, value, now_millis());
        tx.execute(
            "INSERT INTO finance (currency, value, inc_rel, inc_abs, date)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![name, entry.value, entry.inc_rel, entry.inc_abs, entry.date as i64],
        )
        .map_err(backend)?;
        tx.commit().map_err(backend)?;
        Ok(StoreStatus::Ok)
    }

    fn remove(&self, name: &str) -> Result<StoreStatus, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(backend)?;
        tx.execute("DELETE FROM finance WHERE currency = ?1", params![name])
            .map_err(backend)?;
        let removed = tx
            .execute("DELETE FROM currencies WHERE name = ?1", params![name])
            .map_err(backend)?;
        tx.commit().map_err(backend)?;
        Ok(if removed == 0 {
            StoreStatus::NotFound
        } else {
            StoreStatus::Ok
        })
    }

    fn list(&self) -> Result<Vec<SeriesSummary>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT c.name,
                        (SELECT f.value FROM finance f
                          WHERE f.currency = c.name ORDER BY f.id DESC LIMIT 1)
                   FROM currencies c ORDER BY c.name",
            )
            .map_err(backend)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(SeriesSummary {
                    currency: row.get(0)?,
                    value: row.get(1)?,
                })
            })
            .map_err(backend)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(backend)
    }

    fn history(&self, name: &str) -> Result<Option<Vec<HistoryEntry>>, StoreError> {
        let conn = self.conn()?;
        if !exists(&conn, name).map_err(backend)? {
            return Ok(None);
        }
        let mut stmt = conn
            .prepare(
                "SELECT value, inc_abs, inc_rel, date FROM finance
                  WHERE currency = ?1 ORDER BY id",
            )
            .map_err(backend)?;
        let rows = stmt
            .query_map(params![name], |row| {
                Ok(HistoryEntry {
                    value: row.get(0)?,
                    inc_abs: row.get(1)?,
                    inc_rel: row.get(2)?,
                    date: row.get::<_, i64>(3)?.max(0) as u64,
                })
            })
            .map_err(backend)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map(Some)
            .map_err(backend)
    }
}
