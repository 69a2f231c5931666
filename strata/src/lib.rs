#![cfg_attr(docsrs, feature(doc_cfg))]
//! `strata` runs reversible SQL migrations in the order they entered source history, and
//! groups every run into a batch that can be rolled back or redone as a unit.
//!
//! Core concepts:
//! - A migration is a directory named `YYYYMMDD_HHMMSS_<first>_<last>_<message>` holding an
//!   `up.sql` and a `down.sql`. The [Catalog] pairs them into [MigrationUnit]s.
//! - Order comes from history, not from file names: with [GitHistory] a migration's place is
//!   the commit that added it, so two branches that each add a migration merge without
//!   renumbering. [DirectoryHistory] is available when there is no repository.
//! - The ledger records each applied unit. The last unit of each run carries a *marker*;
//!   the two most recent markers delimit the most recent batch (see [last_batch]).
//!
//! # Workflows
//!
//! [Migrator] ties the pieces together:
//! - `up` / `down` move the position forward or backward by a number of steps.
//! - `rollback` undoes exactly the most recent batch; `redo` undoes and re-applies it.
//! - `init` creates the ledger, optionally seeding it with an already-applied baseline.
//!
//! ```
//! use strata::sqlite::SqliteStore;
//! use strata::{Catalog, DirectoryHistory, Migrator, Steps};
//!
//! # fn main() -> Result<(), strata::Error> {
//! # let dir = tempfile::tempdir()?;
//! # let unit = dir.path().join("20200101_120000_jane_doe_users");
//! # std::fs::create_dir(&unit)?;
//! # std::fs::write(unit.join("up.sql"), "CREATE TABLE users (id INTEGER PRIMARY KEY)")?;
//! # std::fs::write(unit.join("down.sql"), "DROP TABLE users")?;
//! # let migrations = dir.path();
//! let migrator = Migrator::new(Catalog::build(&DirectoryHistory::new(migrations))?);
//! let mut store = SqliteStore::open_in_memory()?;
//! migrator.init(&mut store, None)?;
//!
//! let report = migrator.up(&mut store, Steps::All)?.into_result()?;
//! assert_eq!(report.applied().len(), 1);
//!
//! migrator.rollback(&mut store)?.into_result()?;
//! assert_eq!(migrator.position(&mut store)?, None);
//! # Ok(())
//! # }
//! ```
//!
//! # Database support
//!
//! - [`SQLite`](sqlite) - available with the `sqlite` feature flag.
//! - [`PostgreSQL`](postgres) - available with the `postgres` feature flag.
//!
//! Tracing integration is available with the `tracing` feature flag, and test fixtures with
//! the `testing` feature flag.

mod core;
pub use core::{
    Backend, Batch, Direction, Ledger, LedgerEntry, MigrationUnit, Order, ScriptRef, Step,
    Steps, UnitState,
};

mod error;
pub use error::Error;

mod history;
pub use history::{DirectoryHistory, GitHistory, HistoryEvent, HistorySource};

mod catalog;
pub use catalog::{parse_directory_name, Catalog, DirectoryName};

mod resolver;
pub use resolver::resolve;

mod batch;
pub use batch::last_batch;

mod executor;
pub use executor::{ExecutionFailure, ExecutionReport, Executor, UnitOutcome};

mod migrator;
pub use migrator::{Migrator, RedoReport};

#[cfg(feature = "sqlite")]
#[cfg_attr(docsrs, doc(cfg(feature = "sqlite")))]
pub mod sqlite;

#[cfg(feature = "postgres")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
pub mod postgres;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(all(test, feature = "postgres"))]
pub(crate) mod test_postgres;
