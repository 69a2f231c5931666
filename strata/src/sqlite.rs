//! SQLite storage backend.
//!
//! SQLite supports transactional DDL, so [SqliteStore] runs each migration script and its
//! ledger write inside one transaction: a failing script leaves neither schema changes nor
//! a ledger row behind.
//!
//! ```
//! use strata::sqlite::SqliteStore;
//! use strata::Ledger;
//!
//! let mut store = SqliteStore::open_in_memory()?;
//! store.initialize(None)?;
//! assert!(store.is_initialized()?);
//! # Ok::<(), strata::Error>(())
//! ```
//!
//! Timestamps are stored as RFC 3339 text.

use crate::core::{Backend, Direction, Ledger, LedgerEntry, MigrationUnit, Step, DEFAULT_LEDGER_TABLE_NAME};
use crate::error::Error;
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::time::Duration;

const CREATED_AT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// A [Backend] over a single SQLite connection.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    table_name: String,
}

impl SqliteStore {
    /// Wrap an open connection. A 30 second busy timeout is set so that a concurrent writer
    /// makes this store wait instead of failing immediately.
    pub fn new(conn: Connection) -> Result<Self, Error> {
        conn.busy_timeout(Duration::from_secs(30))?;
        Ok(Self {
            conn,
            table_name: DEFAULT_LEDGER_TABLE_NAME.to_string(),
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::new(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, Error> {
        Self::new(Connection::open_in_memory()?)
    }

    /// Set a custom name for the ledger table.
    /// Defaults to "_strata_ledger_".
    pub fn with_table_name(mut self, name: impl Into<String>) -> Self {
        self.table_name = name.into();
        self
    }

    /// Set how long to wait on a locked database before giving up.
    pub fn with_busy_timeout(self, timeout: Duration) -> Result<Self, Error> {
        self.conn.busy_timeout(timeout)?;
        Ok(self)
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn into_inner(self) -> Connection {
        self.conn
    }

    fn table_exists(&self) -> Result<bool, Error> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name=?1")?;
        let exists = stmt.query([&self.table_name])?.next()?.is_some();
        Ok(exists)
    }

    fn row_id(conn: &Connection, table: &str, identity: &str) -> Result<i64, Error> {
        conn.query_row(
            &format!("SELECT id FROM {} WHERE identity = ?1", table),
            [identity],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| Error::PositionNotFound(identity.to_string()))
    }

    fn insert_row(
        conn: &Connection,
        table: &str,
        unit: &MigrationUnit,
        marker: bool,
        seed: bool,
    ) -> Result<(), Error> {
        conn.execute(
            &format!(
                "INSERT INTO {} (created_at, merged_at, executed_at, identity, author, marker, seed) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                table
            ),
            params![
                unit.created_at().format(CREATED_AT_FORMAT).to_string(),
                unit.merged_at().to_rfc3339(),
                Utc::now().to_rfc3339(),
                unit.identity(),
                unit.author(),
                marker,
                seed,
            ],
        )?;
        Ok(())
    }

    fn delete_row(conn: &Connection, table: &str, identity: &str) -> Result<(), Error> {
        let id = Self::row_id(conn, table, identity)?;
        let marker: bool = conn.query_row(
            &format!("SELECT marker FROM {} WHERE id = ?1", table),
            [id],
            |row| row.get(0),
        )?;
        conn.execute(&format!("DELETE FROM {} WHERE id = ?1", table), [id])?;
        if marker {
            conn.execute(
                &format!(
                    "UPDATE {table} SET marker = 1 WHERE id = (SELECT MAX(id) FROM {table})",
                    table = table
                ),
                [],
            )?;
        }
        Ok(())
    }
}

fn text_column_error(index: usize, e: chrono::ParseError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(e))
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let created_at: String = row.get(0)?;
    let merged_at: String = row.get(1)?;
    let executed_at: String = row.get(2)?;
    Ok(LedgerEntry {
        created_at: NaiveDateTime::parse_from_str(&created_at, CREATED_AT_FORMAT)
            .map_err(|e| text_column_error(0, e))?,
        merged_at: DateTime::parse_from_rfc3339(&merged_at).map_err(|e| text_column_error(1, e))?,
        executed_at: DateTime::parse_from_rfc3339(&executed_at)
            .map_err(|e| text_column_error(2, e))?
            .with_timezone(&Utc),
        identity: row.get(3)?,
        author: row.get(4)?,
        marker: row.get(5)?,
        seed: row.get(6)?,
    })
}

impl Ledger for SqliteStore {
    fn table_name(&self) -> &str {
        &self.table_name
    }

    fn is_initialized(&mut self) -> Result<bool, Error> {
        self.table_exists()
    }

    fn initialize(&mut self, seed: Option<&MigrationUnit>) -> Result<(), Error> {
        let tx = self.conn.transaction()?;
        tx.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    created_at TEXT,
                    merged_at TEXT,
                    executed_at TEXT NOT NULL,
                    identity TEXT NOT NULL UNIQUE,
                    author TEXT NOT NULL,
                    marker INTEGER NOT NULL DEFAULT 0,
                    seed INTEGER NOT NULL DEFAULT 0
                )",
                self.table_name
            ),
            [],
        )?;
        if let Some(unit) = seed {
            let rows: i64 = tx.query_row(
                &format!("SELECT COUNT(*) FROM {}", self.table_name),
                [],
                |row| row.get(0),
            )?;
            if rows > 0 {
                return Err(Error::Generic(format!(
                    "cannot seed {}: ledger table {} already has {} entries",
                    unit.identity(),
                    self.table_name,
                    rows
                )));
            }
            Self::insert_row(&tx, &self.table_name, unit, true, true)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn position_at_offset(&mut self, offset: usize) -> Result<Option<String>, Error> {
        let identity = self
            .conn
            .query_row(
                &format!(
                    "SELECT identity FROM {} WHERE marker = 1 ORDER BY id DESC LIMIT 1 OFFSET ?1",
                    self.table_name
                ),
                [offset as i64],
                |row| row.get(0),
            )
            .optional()?;
        Ok(identity)
    }

    fn count_after(&mut self, identity: Option<&str>) -> Result<usize, Error> {
        let after = match identity {
            Some(identity) => Self::row_id(&self.conn, &self.table_name, identity)?,
            None => 0,
        };
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE id > ?1", self.table_name),
            [after],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn entries(&mut self) -> Result<Vec<LedgerEntry>, Error> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT created_at, merged_at, executed_at, identity, author, marker, seed FROM {} ORDER BY id",
            self.table_name
        ))?;
        let entries = stmt
            .query_map([], entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    fn seed(&mut self) -> Result<Option<String>, Error> {
        let identity = self
            .conn
            .query_row(
                &format!(
                    "SELECT identity FROM {} WHERE seed = 1 ORDER BY id LIMIT 1",
                    self.table_name
                ),
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(identity)
    }

    fn insert(&mut self, unit: &MigrationUnit, is_marker: bool) -> Result<(), Error> {
        Self::insert_row(&self.conn, &self.table_name, unit, is_marker, false)
    }

    fn delete(&mut self, identity: &str) -> Result<(), Error> {
        let tx = self.conn.transaction()?;
        Self::delete_row(&tx, &self.table_name, identity)?;
        tx.commit()?;
        Ok(())
    }

    fn mark(&mut self, identity: &str) -> Result<(), Error> {
        let updated = self.conn.execute(
            &format!("UPDATE {} SET marker = 1 WHERE identity = ?1", self.table_name),
            [identity],
        )?;
        if updated == 0 {
            return Err(Error::PositionNotFound(identity.to_string()));
        }
        Ok(())
    }
}

impl Backend for SqliteStore {
    fn run_script(&mut self, script: &str) -> Result<(), Error> {
        self.conn.execute_batch(script)?;
        Ok(())
    }

    fn apply(&mut self, step: &Step<'_>) -> Result<(), Error> {
        let tx = self.conn.transaction()?;
        tx.execute_batch(step.script)?;
        match step.direction {
            Direction::Up => {
                Self::insert_row(&tx, &self.table_name, step.unit, step.is_marker, false)?
            }
            Direction::Down => Self::delete_row(&tx, &self.table_name, step.unit.identity())?,
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Order;
    use crate::executor::Executor;
    use crate::testing::Fixture;
    use crate::Migrator;
    use crate::Steps;

    const NAMES: [&str; 4] = ["a", "b", "c", "d"];

    fn initialized_store() -> SqliteStore {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.initialize(None).unwrap();
        store
    }

    fn table_exists(store: &SqliteStore, name: &str) -> bool {
        store
            .connection()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                [name],
                |row| row.get::<_, i64>(0),
            )
            .unwrap()
            == 1
    }

    #[test]
    fn initialize_creates_ledger_table() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        assert!(!store.is_initialized().unwrap());
        store.initialize(None).unwrap();
        assert!(store.is_initialized().unwrap());
        assert!(table_exists(&store, "_strata_ledger_"));

        // idempotent
        store.initialize(None).unwrap();
        assert!(store.entries().unwrap().is_empty());
    }

    #[test]
    fn custom_table_name() {
        let mut store = SqliteStore::open_in_memory()
            .unwrap()
            .with_table_name("my_ledger");
        store.initialize(None).unwrap();
        assert_eq!(store.table_name(), "my_ledger");
        assert!(table_exists(&store, "my_ledger"));
        assert!(!table_exists(&store, "_strata_ledger_"));
    }

    #[test]
    fn entries_round_trip_unit_metadata() {
        let fixture = Fixture::new(&NAMES).unwrap();
        let catalog = fixture.catalog();
        let mut store = initialized_store();
        let unit = catalog.find("b").unwrap();
        store.insert(unit, true).unwrap();

        let entries = store.entries().unwrap();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.identity, "b");
        assert_eq!(entry.author, "b b");
        assert_eq!(entry.created_at, unit.created_at());
        assert_eq!(entry.merged_at, unit.merged_at());
        assert!(entry.marker);
        assert!(!entry.seed);
        assert!(Utc::now() - entry.executed_at < chrono::Duration::minutes(1));
    }

    #[test]
    fn markers_and_counts() {
        let fixture = Fixture::new(&NAMES).unwrap();
        let catalog = fixture.catalog();
        let mut store = initialized_store();
        for (name, marker) in [("a", false), ("b", true), ("c", false), ("d", true)] {
            store.insert(catalog.find(name).unwrap(), marker).unwrap();
        }

        assert_eq!(store.position_at_offset(0).unwrap().as_deref(), Some("d"));
        assert_eq!(store.position_at_offset(1).unwrap().as_deref(), Some("b"));
        assert_eq!(store.position_at_offset(2).unwrap(), None);
        assert_eq!(store.count_after(None).unwrap(), 4);
        assert_eq!(store.count_after(Some("b")).unwrap(), 2);
        assert_eq!(
            store.count_after(Some("zzz")),
            Err(Error::PositionNotFound("zzz".to_string()))
        );

        store.delete("d").unwrap();
        assert_eq!(store.position_at_offset(0).unwrap().as_deref(), Some("c"));
        store.delete("a").unwrap();
        assert_eq!(store.position_at_offset(0).unwrap().as_deref(), Some("c"));
        assert_eq!(store.position_at_offset(1).unwrap().as_deref(), Some("b"));

        store.mark("b").unwrap();
        assert_eq!(store.mark("zzz"), Err(Error::PositionNotFound("zzz".to_string())));
    }

    #[test]
    fn duplicate_identity_is_rejected() {
        let fixture = Fixture::new(&NAMES).unwrap();
        let catalog = fixture.catalog();
        let mut store = initialized_store();
        let unit = catalog.find("a").unwrap();
        store.insert(unit, false).unwrap();
        assert!(matches!(store.insert(unit, false), Err(Error::Rusqlite(_))));
    }

    #[test]
    fn seed_row() {
        let fixture = Fixture::new(&NAMES).unwrap();
        let catalog = fixture.catalog();
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.initialize(catalog.find("b")).unwrap();

        assert_eq!(store.seed().unwrap().as_deref(), Some("b"));
        assert_eq!(store.position_at_offset(0).unwrap().as_deref(), Some("b"));
        let entries = store.entries().unwrap();
        assert!(entries[0].seed && entries[0].marker);

        // a second seed is refused and changes nothing
        assert!(matches!(
            store.initialize(catalog.find("c")),
            Err(Error::Generic(_))
        ));
        assert_eq!(store.entries().unwrap().len(), 1);
    }

    #[test]
    fn failed_script_rolls_back_ledger_write() {
        let fixture = Fixture::new(&NAMES).unwrap();
        fixture
            .write_script(
                "b",
                Direction::Up,
                "CREATE TABLE half (id INTEGER); THIS IS NOT VALID SQL",
            )
            .unwrap();
        let catalog = fixture.catalog();
        let mut store = initialized_store();

        let selection = catalog.select(Order::Ascending, 0..3);
        let report = Executor::new().execute(&selection, Direction::Up, &mut store, None);

        assert_eq!(report.applied(), vec!["a"]);
        assert_eq!(report.failure.as_ref().unwrap().identity(), "b");
        assert!(matches!(
            report.failure.as_ref().unwrap().error(),
            Error::Rusqlite(_)
        ));
        assert!(table_exists(&store, "a"));
        assert!(!table_exists(&store, "half"));
        assert_eq!(
            store
                .entries()
                .unwrap()
                .into_iter()
                .map(|e| (e.identity, e.marker))
                .collect::<Vec<_>>(),
            vec![("a".to_string(), true)]
        );
    }

    #[test]
    fn file_backed_ledger_survives_reopen() {
        let fixture = Fixture::new(&NAMES).unwrap();
        let migrator = Migrator::new(fixture.catalog());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db");

        {
            let mut store = SqliteStore::open(&path).unwrap();
            migrator.init(&mut store, None).unwrap();
            migrator.up(&mut store, Steps::Count(2)).unwrap();
        }

        let mut store = SqliteStore::open(&path)
            .unwrap()
            .with_busy_timeout(Duration::from_secs(1))
            .unwrap();
        assert_eq!(migrator.position(&mut store).unwrap().as_deref(), Some("b"));
        let report = migrator.up(&mut store, Steps::All).unwrap();
        assert_eq!(report.applied(), vec!["c", "d"]);
        assert!(table_exists(&store, "d"));
    }

    #[test]
    fn run_script_executes_multiple_statements() {
        let mut store = initialized_store();
        store
            .run_script("CREATE TABLE x (id INTEGER); INSERT INTO x VALUES (1); INSERT INTO x VALUES (2);")
            .unwrap();
        let count: i64 = store
            .connection()
            .query_row("SELECT COUNT(*) FROM x", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
        assert!(store.into_inner().is_autocommit());
    }
}
