use crate::error::Error;
use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

pub(crate) const DEFAULT_LEDGER_TABLE_NAME: &str = "_strata_ledger_";

/// Which way a selection of migrations is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Run `down.sql` scripts and remove ledger rows.
    Down,
    /// Run `up.sql` scripts and insert ledger rows.
    Up,
}

impl Direction {
    /// The catalog ordering a selection in this direction is resolved against.
    pub fn order(self) -> Order {
        match self {
            Direction::Up => Order::Ascending,
            Direction::Down => Order::Descending,
        }
    }

    pub fn arrow(self) -> &'static str {
        match self {
            Direction::Up => "↑",
            Direction::Down => "↓",
        }
    }

    pub(crate) fn script_file_name(self) -> &'static str {
        match self {
            Direction::Up => "up.sql",
            Direction::Down => "down.sql",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Up => f.write_str("up"),
            Direction::Down => f.write_str("down"),
        }
    }
}

/// Sort order of the catalog by sequence index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Ascending,
    Descending,
}

/// How many units a selection may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Steps {
    /// Everything to the end of the catalog.
    #[default]
    All,
    /// At most this many units. `Count(0)` is treated as [Steps::All].
    Count(usize),
}

impl Steps {
    /// Interpret a raw step argument: `-1` (or any negative value) and `0` mean "all remaining".
    pub fn from_arg(steps: i64) -> Self {
        if steps <= 0 {
            Steps::All
        } else {
            Steps::Count(steps as usize)
        }
    }

    /// Normalized form: a zero count becomes [Steps::All].
    pub fn normalized(self) -> Self {
        match self {
            Steps::Count(0) => Steps::All,
            other => other,
        }
    }
}

impl From<Option<u32>> for Steps {
    fn from(value: Option<u32>) -> Self {
        match value {
            Some(n) => Steps::from_arg(n as i64),
            None => Steps::All,
        }
    }
}

/// A reference to one directional script of a migration unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptRef {
    path: PathBuf,
    direction: Direction,
}

impl ScriptRef {
    pub(crate) fn new(path: PathBuf, direction: Direction) -> Self {
        Self { path, direction }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Read the script text from disk.
    pub fn read(&self) -> Result<String, Error> {
        std::fs::read_to_string(&self.path).map_err(|e| {
            Error::Generic(format!(
                "failed to read {} script {}: {}",
                self.direction,
                self.path.display(),
                e
            ))
        })
    }
}

/// One reversible schema change, discovered from the migration history.
///
/// Units are built once by the [Catalog](crate::Catalog) and never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationUnit {
    pub(crate) identity: String,
    pub(crate) sequence_index: usize,
    pub(crate) directory: String,
    pub(crate) author: String,
    pub(crate) created_at: NaiveDateTime,
    pub(crate) merged_at: DateTime<FixedOffset>,
    pub(crate) up: ScriptRef,
    pub(crate) down: ScriptRef,
}

impl MigrationUnit {
    /// Stable key shared with the ledger (a commit id or content hash).
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Position of this unit in discovery order.
    pub fn sequence_index(&self) -> usize {
        self.sequence_index
    }

    /// Name of the directory holding the scripts, e.g. `20200101_120000_jane_doe_add_users`.
    pub fn directory(&self) -> &str {
        &self.directory
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    /// Creation time encoded in the directory name.
    pub fn created_at(&self) -> NaiveDateTime {
        self.created_at
    }

    /// Time the unit entered the history (commit time, or modification time for directory scans).
    pub fn merged_at(&self) -> DateTime<FixedOffset> {
        self.merged_at
    }

    pub fn up(&self) -> &ScriptRef {
        &self.up
    }

    pub fn down(&self) -> &ScriptRef {
        &self.down
    }

    pub fn script(&self, direction: Direction) -> &ScriptRef {
        match direction {
            Direction::Up => &self.up,
            Direction::Down => &self.down,
        }
    }
}

/// A row of the ledger table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    pub identity: String,
    pub author: String,
    pub created_at: NaiveDateTime,
    pub merged_at: DateTime<FixedOffset>,
    pub executed_at: DateTime<Utc>,
    /// Set on the last entry applied in its batch.
    pub marker: bool,
    /// Set on the baseline row written by `init`.
    pub seed: bool,
}

/// The most recent batch in the ledger, reconstructed on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Identity of the marker that closes the batch.
    pub anchor_identity: String,
    /// Number of ledger rows in the batch.
    pub step_count: usize,
    /// Marker of the batch before this one; execution stops before reaching it.
    pub exclude_identity: Option<String>,
}

/// Lifecycle of one unit inside an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitState {
    Pending,
    Applying,
    Applied,
    Failed,
}

/// A single unit of work handed to a [Backend].
#[derive(Debug)]
pub struct Step<'a> {
    pub unit: &'a MigrationUnit,
    pub direction: Direction,
    pub script: &'a str,
    /// Forward steps only: whether the inserted row closes the batch.
    pub is_marker: bool,
}

/// Persistent record of executed migrations and their batch markers.
///
/// Rows are ordered by insertion; "most recent" always means the last inserted row.
pub trait Ledger {
    /// Name of the ledger table.
    fn table_name(&self) -> &str;

    /// Whether the ledger table exists.
    fn is_initialized(&mut self) -> Result<bool, Error>;

    /// Create the ledger table. When `seed` is given, record it as an already-applied,
    /// marked baseline row. Seeding a ledger that already has entries is an error.
    fn initialize(&mut self, seed: Option<&MigrationUnit>) -> Result<(), Error>;

    /// Identity of the `offset`-th most recent marker row (0 is the current position).
    fn position_at_offset(&mut self, offset: usize) -> Result<Option<String>, Error>;

    /// Number of rows inserted after the row for `identity`, or all rows when `None`.
    fn count_after(&mut self, identity: Option<&str>) -> Result<usize, Error>;

    /// All rows, oldest first.
    fn entries(&mut self) -> Result<Vec<LedgerEntry>, Error>;

    /// Identity of the seed row written by [Ledger::initialize], if any.
    fn seed(&mut self) -> Result<Option<String>, Error>;

    fn insert(&mut self, unit: &MigrationUnit, is_marker: bool) -> Result<(), Error>;

    /// Remove the row for `identity`. When the removed row carried the marker, the marker
    /// moves to the newest remaining row.
    fn delete(&mut self, identity: &str) -> Result<(), Error>;

    /// Set the marker on the row for `identity`.
    fn mark(&mut self, identity: &str) -> Result<(), Error>;
}

/// A database that can run migration scripts and keeps a [Ledger].
pub trait Backend: Ledger {
    /// Run raw script text as one opaque unit.
    fn run_script(&mut self, script: &str) -> Result<(), Error>;

    /// Run a step's script and record it in the ledger. Backends with transactional DDL
    /// override this to make the pair atomic.
    fn apply(&mut self, step: &Step<'_>) -> Result<(), Error> {
        self.run_script(step.script)?;
        match step.direction {
            Direction::Up => self.insert(step.unit, step.is_marker),
            Direction::Down => self.delete(step.unit.identity()),
        }
    }
}
