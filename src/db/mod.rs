//! SQLite persistence handle.
//!
//! A single connection guarded by a mutex: every writer goes through it, which
//! gives the single-writer discipline the full-text indexes need.

mod batches;
mod models;
mod projects;
pub mod schema;

pub use batches::{BatchRecord, BatchUnit, BatchUnitStatus, BatchUnitUpdate};
pub use models::{
    CachedTranslationRow, ProjectLanguage, TranslationSource, TranslationStatus,
    TranslationUnit, TranslationVersion,
};
pub use projects::NewUnit;

use crate::error::{Result, TranslationError};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use schema::TriggerGroup;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::info;

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Open (or create) the database file and bring the schema up to date
    pub fn new(database_path: &str) -> Result<Self> {
        let conn = Connection::open(database_path).map_err(|e| {
            TranslationError::database(format!("failed to open database at {}", database_path), e)
        })?;
        Self::initialize(conn)
    }

    /// Private in-memory database, mainly for tests and previews
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| TranslationError::database("failed to open in-memory database", e))?;
        Self::initialize(conn)
    }

    fn initialize(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .map_err(|e| TranslationError::database("failed to configure connection", e))?;

        if Self::needs_migration(&conn)? {
            Self::run_migration(&conn)?;
        }

        conn.execute_batch(schema::TABLES)
            .map_err(|e| TranslationError::database("failed to create tables", e))?;
        conn.execute_batch(schema::TM_TRIGGERS)
            .map_err(|e| TranslationError::database("failed to create index triggers", e))?;
        for group in TriggerGroup::ALL {
            for (_, sql) in group.definitions() {
                conn.execute_batch(&sql).map_err(|e| {
                    TranslationError::database("failed to create consistency trigger", e)
                })?;
            }
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Older databases stored translation memory without `updated_at`
    fn needs_migration(conn: &Connection) -> Result<bool> {
        let table_exists: bool = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='translation_memory'",
            [],
            |row| row.get::<_, i64>(0).map(|count| count > 0),
        )?;

        if !table_exists {
            return Ok(false);
        }

        let column_exists: bool = conn.query_row(
            "SELECT COUNT(*) FROM pragma_table_info('translation_memory') WHERE name='updated_at'",
            [],
            |row| row.get::<_, i64>(0).map(|count| count > 0),
        )?;

        Ok(!column_exists)
    }

    fn run_migration(conn: &Connection) -> Result<()> {
        info!("Migrating translation_memory table to add updated_at");
        conn.execute_batch(
            "BEGIN;
             ALTER TABLE translation_memory ADD COLUMN updated_at TEXT;
             UPDATE translation_memory SET updated_at = last_used_at;
             COMMIT;",
        )
        .map_err(|e| {
            let _ = conn.execute_batch("ROLLBACK");
            TranslationError::database("translation_memory migration failed and was rolled back", e)
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run read-only or single-statement work on the connection
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock();
        f(&conn)
    }

    /// Run `f` inside an immediate (write-locking) transaction.
    ///
    /// Commits when `f` returns `Ok`; any error rolls the whole transaction back.
    pub fn with_transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| TranslationError::database("failed to begin transaction", e))?;
        let value = f(&tx)?;
        tx.commit()
            .map_err(|e| TranslationError::database("failed to commit transaction", e))?;
        Ok(value)
    }

    /// Names of the consistency triggers currently missing from the schema
    pub fn missing_triggers(&self) -> Result<Vec<&'static str>> {
        self.with_connection(|conn| {
            let mut missing = Vec::new();
            for group in TriggerGroup::ALL {
                for name in group.names() {
                    if !trigger_exists(conn, name)? {
                        missing.push(name);
                    }
                }
            }
            Ok(missing)
        })
    }
}

pub(crate) fn trigger_exists(conn: &Connection, name: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'trigger' AND name = ?1",
        [name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Build `?,?,?` for an IN list of `count` parameters
pub(crate) fn placeholders(count: usize) -> String {
    vec!["?"; count].join(",")
}
