/// Error type for the strata crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A migration directory or history event could not be turned into a unit.
    #[error("discovery failed: {0}")]
    Discovery(String),
    /// The ledger position names an identity the catalog does not contain.
    #[error("can not find index for {0}: the ledger and the migration history have diverged")]
    PositionNotFound(String),
    /// A backward operation was requested against an empty ledger.
    #[error("no starting point found, nothing to do")]
    NoStartingPoint,
    /// The ledger holds no marker rows yet.
    #[error("no batch found in the ledger")]
    NoBatchFound,
    /// The ledger table has not been created yet.
    #[error("ledger table {0} does not exist, run `strata init` first")]
    Uninitialized(String),
    /// A script or ledger write failed part way through a selection.
    /// Units listed in `applied` ran successfully before the failure and remain applied.
    #[error("migration {identity} failed after applying {count} unit(s): {source}", count = .applied.len())]
    Execution {
        identity: String,
        applied: Vec<String>,
        source: Box<Error>,
    },
    /// A run failed part way and its last applied unit could not be marked. Rows after the
    /// previous marker are applied but belong to no batch until `marker` is marked.
    #[error(
        "migration {identity} failed after applying {count} unit(s): {source}; \
         the partial batch could not be closed at {marker}: {mark_error}",
        count = .applied.len()
    )]
    UnmarkedBatch {
        identity: String,
        applied: Vec<String>,
        marker: String,
        mark_error: Box<Error>,
        source: Box<Error>,
    },
    /// The ledger holds rows newer than its most recent marker.
    #[error(
        "ledger has {count} row(s) after its last marker, \
         mark {newest} to close the partial batch before migrating"
    )]
    UnmarkedRows {
        newest: String,
        count: usize,
    },
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "sqlite")]
    #[error("{0}")]
    Rusqlite(rusqlite::Error),
    #[cfg(feature = "postgres")]
    #[error("{0}")]
    Postgres(#[from] postgres::Error),
    #[error("{0}")]
    Generic(String),
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for Error {
    fn from(value: rusqlite::Error) -> Self {
        Self::Rusqlite(value)
    }
}

impl From<String> for Error {
    fn from(value: String) -> Self {
        Self::Generic(value)
    }
}

// Manual PartialEq implementation because io::Error and postgres::Error don't implement PartialEq
impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Discovery(a), Self::Discovery(b)) => a == b,
            (Self::PositionNotFound(a), Self::PositionNotFound(b)) => a == b,
            (Self::NoStartingPoint, Self::NoStartingPoint) => true,
            (Self::NoBatchFound, Self::NoBatchFound) => true,
            (Self::Uninitialized(a), Self::Uninitialized(b)) => a == b,
            (
                Self::Execution {
                    identity: a,
                    applied: a_applied,
                    source: a_source,
                },
                Self::Execution {
                    identity: b,
                    applied: b_applied,
                    source: b_source,
                },
            ) => a == b && a_applied == b_applied && a_source == b_source,
            (
                Self::UnmarkedBatch {
                    identity: a,
                    applied: a_applied,
                    marker: a_marker,
                    mark_error: a_mark,
                    source: a_source,
                },
                Self::UnmarkedBatch {
                    identity: b,
                    applied: b_applied,
                    marker: b_marker,
                    mark_error: b_mark,
                    source: b_source,
                },
            ) => {
                a == b
                    && a_applied == b_applied
                    && a_marker == b_marker
                    && a_mark == b_mark
                    && a_source == b_source
            }
            (
                Self::UnmarkedRows {
                    newest: a,
                    count: a_count,
                },
                Self::UnmarkedRows {
                    newest: b,
                    count: b_count,
                },
            ) => a == b && a_count == b_count,
            (Self::Io(a), Self::Io(b)) => a.kind() == b.kind() && a.to_string() == b.to_string(),
            #[cfg(feature = "sqlite")]
            (Self::Rusqlite(a), Self::Rusqlite(b)) => a == b,
            #[cfg(feature = "postgres")]
            (Self::Postgres(a), Self::Postgres(b)) => a.to_string() == b.to_string(),
            (Self::Generic(a), Self::Generic(b)) => a == b,
            _ => false,
        }
    }
}
