//! PostgreSQL storage backend.
//!
//! PostgreSQL fully supports transactional DDL. [PostgresStore] runs each migration script
//! together with its ledger write in one transaction, so a failing script leaves the schema
//! and the ledger exactly as they were before that unit.
//!
//! ```ignore
//! use strata::postgres::{NoTls, PostgresClient, PostgresStore};
//! use strata::{Catalog, GitHistory, Migrator, Steps};
//!
//! let client = PostgresClient::connect("postgres://localhost/app", NoTls)?;
//! let mut store = PostgresStore::new(client);
//! let migrator = Migrator::new(Catalog::build(&GitHistory::new("migrations"))?);
//! migrator.init(&mut store, None)?;
//! migrator.up(&mut store, Steps::All)?.into_result()?;
//! ```

use crate::core::{Backend, Direction, Ledger, LedgerEntry, MigrationUnit, Step, DEFAULT_LEDGER_TABLE_NAME};
use crate::error::Error;
use postgres::{Client, GenericClient};

// Re-exported so callers can connect without a direct postgres dependency
pub use postgres::Client as PostgresClient;
pub use postgres::NoTls;

/// A [Backend] over a PostgreSQL client.
pub struct PostgresStore {
    client: Client,
    table_name: String,
}

// Manual Debug impl since the client doesn't implement a useful one
impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore")
            .field("table_name", &self.table_name)
            .finish()
    }
}

impl PostgresStore {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            table_name: DEFAULT_LEDGER_TABLE_NAME.to_string(),
        }
    }

    /// Set a custom name for the ledger table.
    /// Defaults to "_strata_ledger_".
    pub fn with_table_name(mut self, name: impl Into<String>) -> Self {
        self.table_name = name.into();
        self
    }

    pub fn client(&mut self) -> &mut Client {
        &mut self.client
    }

    pub fn into_inner(self) -> Client {
        self.client
    }

    fn row_id<C: GenericClient>(client: &mut C, table: &str, identity: &str) -> Result<i64, Error> {
        let row = client.query_opt(
            &format!("SELECT id FROM {} WHERE identity = $1", table),
            &[&identity],
        )?;
        row.map(|r| r.get(0))
            .ok_or_else(|| Error::PositionNotFound(identity.to_string()))
    }

    fn insert_row<C: GenericClient>(
        client: &mut C,
        table: &str,
        unit: &MigrationUnit,
        marker: bool,
        seed: bool,
    ) -> Result<(), Error> {
        client.execute(
            &format!(
                "INSERT INTO {} (created_at, merged_at, identity, author, marker, seed) VALUES ($1, $2, $3, $4, $5, $6)",
                table
            ),
            &[
                &unit.created_at(),
                &unit.merged_at(),
                &unit.identity(),
                &unit.author(),
                &marker,
                &seed,
            ],
        )?;
        Ok(())
    }

    fn delete_row<C: GenericClient>(client: &mut C, table: &str, identity: &str) -> Result<(), Error> {
        let id = Self::row_id(client, table, identity)?;
        let row = client.query_one(
            &format!("DELETE FROM {} WHERE id = $1 RETURNING marker", table),
            &[&id],
        )?;
        let marker: bool = row.get(0);
        if marker {
            client.execute(
                &format!(
                    "UPDATE {table} SET marker = TRUE WHERE id = (SELECT MAX(id) FROM {table})",
                    table = table
                ),
                &[],
            )?;
        }
        Ok(())
    }
}

impl Ledger for PostgresStore {
    fn table_name(&self) -> &str {
        &self.table_name
    }

    fn is_initialized(&mut self) -> Result<bool, Error> {
        let row = self.client.query_one(
            "SELECT EXISTS (SELECT FROM information_schema.tables WHERE table_schema = 'public' AND table_name = $1)",
            &[&self.table_name],
        )?;
        Ok(row.get(0))
    }

    fn initialize(&mut self, seed: Option<&MigrationUnit>) -> Result<(), Error> {
        let mut tx = self.client.transaction()?;
        tx.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id BIGSERIAL PRIMARY KEY,
                    created_at TIMESTAMP,
                    merged_at TIMESTAMPTZ,
                    executed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    identity TEXT NOT NULL UNIQUE,
                    author TEXT NOT NULL,
                    marker BOOLEAN NOT NULL DEFAULT FALSE,
                    seed BOOLEAN NOT NULL DEFAULT FALSE
                )",
                self.table_name
            ),
            &[],
        )?;
        if let Some(unit) = seed {
            let rows: i64 = tx
                .query_one(&format!("SELECT COUNT(*) FROM {}", self.table_name), &[])?
                .get(0);
            if rows > 0 {
                return Err(Error::Generic(format!(
                    "cannot seed {}: ledger table {} already has {} entries",
                    unit.identity(),
                    self.table_name,
                    rows
                )));
            }
            Self::insert_row(&mut tx, &self.table_name, unit, true, true)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn position_at_offset(&mut self, offset: usize) -> Result<Option<String>, Error> {
        let row = self.client.query_opt(
            &format!(
                "SELECT identity FROM {} WHERE marker ORDER BY id DESC LIMIT 1 OFFSET $1",
                self.table_name
            ),
            &[&(offset as i64)],
        )?;
        Ok(row.map(|r| r.get(0)))
    }

    fn count_after(&mut self, identity: Option<&str>) -> Result<usize, Error> {
        let after = match identity {
            Some(identity) => Self::row_id(&mut self.client, &self.table_name, identity)?,
            None => 0,
        };
        let count: i64 = self
            .client
            .query_one(
                &format!("SELECT COUNT(*) FROM {} WHERE id > $1", self.table_name),
                &[&after],
            )?
            .get(0);
        Ok(count as usize)
    }

    fn entries(&mut self) -> Result<Vec<LedgerEntry>, Error> {
        let rows = self.client.query(
            &format!(
                "SELECT created_at, merged_at, executed_at, identity, author, marker, seed FROM {} ORDER BY id",
                self.table_name
            ),
            &[],
        )?;
        rows.iter()
            .map(|row| -> Result<LedgerEntry, Error> {
                Ok(LedgerEntry {
                    created_at: row.try_get(0)?,
                    merged_at: row.try_get(1)?,
                    executed_at: row.try_get(2)?,
                    identity: row.try_get(3)?,
                    author: row.try_get(4)?,
                    marker: row.try_get(5)?,
                    seed: row.try_get(6)?,
                })
            })
            .collect()
    }

    fn seed(&mut self) -> Result<Option<String>, Error> {
        let row = self.client.query_opt(
            &format!(
                "SELECT identity FROM {} WHERE seed ORDER BY id LIMIT 1",
                self.table_name
            ),
            &[],
        )?;
        Ok(row.map(|r| r.get(0)))
    }

    fn insert(&mut self, unit: &MigrationUnit, is_marker: bool) -> Result<(), Error> {
        Self::insert_row(&mut self.client, &self.table_name, unit, is_marker, false)
    }

    fn delete(&mut self, identity: &str) -> Result<(), Error> {
        let mut tx = self.client.transaction()?;
        Self::delete_row(&mut tx, &self.table_name, identity)?;
        tx.commit()?;
        Ok(())
    }

    fn mark(&mut self, identity: &str) -> Result<(), Error> {
        let updated = self.client.execute(
            &format!(
                "UPDATE {} SET marker = TRUE WHERE identity = $1",
                self.table_name
            ),
            &[&identity],
        )?;
        if updated == 0 {
            return Err(Error::PositionNotFound(identity.to_string()));
        }
        Ok(())
    }
}

impl Backend for PostgresStore {
    fn run_script(&mut self, script: &str) -> Result<(), Error> {
        self.client.batch_execute(script)?;
        Ok(())
    }

    fn apply(&mut self, step: &Step<'_>) -> Result<(), Error> {
        let mut tx = self.client.transaction()?;
        tx.batch_execute(step.script)?;
        match step.direction {
            Direction::Up => {
                Self::insert_row(&mut tx, &self.table_name, step.unit, step.is_marker, false)?
            }
            Direction::Down => Self::delete_row(&mut tx, &self.table_name, step.unit.identity())?,
        }
        tx.commit()?;
        Ok(())
    }
}
