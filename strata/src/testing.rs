//! Testing utilities for migration development.
//!
//! - [Fixture] writes a migration directory tree into a temporary directory.
//! - [FixtureHistory] is a [HistorySource] whose events are supplied up front, so catalogs can
//!   be built without a git repository.
//! - [MemoryStore] is an in-memory [Backend](crate::Backend) with failure injection.

mod memory;
pub use memory::MemoryStore;

use crate::catalog::Catalog;
use crate::core::Direction;
use crate::error::Error;
use crate::history::{HistoryEvent, HistorySource};
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A history source backed by a fixed list of events.
#[derive(Debug, Clone)]
pub struct FixtureHistory {
    root: PathBuf,
    events: Vec<HistoryEvent>,
}

impl FixtureHistory {
    pub fn new(root: impl Into<PathBuf>, events: Vec<HistoryEvent>) -> Self {
        Self {
            root: root.into(),
            events,
        }
    }
}

impl HistorySource for FixtureHistory {
    fn root(&self) -> &Path {
        &self.root
    }

    fn events(&self) -> Result<Vec<HistoryEvent>, Error> {
        Ok(self.events.clone())
    }
}

fn base_time() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2020, 1, 1)
        .and_then(|d| d.and_hms_opt(12, 0, 0))
        .unwrap_or_default()
}

/// A migration tree on disk, one directory per name.
///
/// Each name `m` becomes `<timestamp>_m_m_m/` holding `up.sql` (`CREATE TABLE m (id INTEGER
/// PRIMARY KEY)`) and `down.sql` (`DROP TABLE m`). Timestamps start at 2020-01-01 12:00:00
/// and advance one minute per name, so lexical and history order agree. The identity of
/// each unit in [Fixture::history] is the name itself.
#[derive(Debug)]
pub struct Fixture {
    dir: TempDir,
    names: Vec<String>,
    directories: Vec<String>,
}

impl Fixture {
    pub fn new(names: &[&str]) -> Result<Self, Error> {
        let dir = tempfile::tempdir()?;
        let mut directories = Vec::with_capacity(names.len());

        for (i, name) in names.iter().enumerate() {
            let created_at = base_time() + Duration::minutes(i as i64);
            let directory = format!(
                "{}_{}_{}_{}",
                created_at.format("%Y%m%d_%H%M%S"),
                name,
                name,
                name
            );
            let path = dir.path().join(&directory);
            std::fs::create_dir(&path)?;
            std::fs::write(
                path.join("up.sql"),
                format!("CREATE TABLE {} (id INTEGER PRIMARY KEY)", name),
            )?;
            std::fs::write(path.join("down.sql"), format!("DROP TABLE {}", name))?;
            directories.push(directory);
        }

        Ok(Self {
            dir,
            names: names.iter().map(|n| n.to_string()).collect(),
            directories,
        })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Directory name written for `name`.
    pub fn directory(&self, name: &str) -> Option<&str> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| self.directories[i].as_str())
    }

    /// One event per name, in the order given to [Fixture::new].
    pub fn history(&self) -> FixtureHistory {
        let base: DateTime<FixedOffset> = base_time().and_utc().fixed_offset();
        let events = self
            .names
            .iter()
            .zip(&self.directories)
            .enumerate()
            .map(|(i, (name, directory))| HistoryEvent {
                identity: name.clone(),
                committed_at: base + Duration::hours(i as i64),
                added: vec![
                    PathBuf::from(directory).join("up.sql"),
                    PathBuf::from(directory).join("down.sql"),
                ],
            })
            .collect();
        FixtureHistory::new(self.root(), events)
    }

    /// Build the catalog for [Fixture::history].
    ///
    /// # Panics
    /// If the fixture names collide.
    pub fn catalog(&self) -> Catalog {
        Catalog::build(&self.history()).expect("fixture catalog is valid")
    }

    /// Overwrite one script of the unit created for `name`.
    pub fn write_script(&self, name: &str, direction: Direction, contents: &str) -> Result<(), Error> {
        let directory = self
            .directory(name)
            .ok_or_else(|| Error::Generic(format!("no fixture directory for {}", name)))?;
        std::fs::write(
            self.root().join(directory).join(direction.script_file_name()),
            contents,
        )?;
        Ok(())
    }
}

/// Write a [Fixture] for `names` and build its catalog.
pub fn fixture_catalog(names: &[&str]) -> Result<(Fixture, Catalog), Error> {
    let fixture = Fixture::new(names)?;
    let catalog = Catalog::build(&fixture.history())?;
    Ok((fixture, catalog))
}
