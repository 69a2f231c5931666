//! Ordered sources of migration history.
//!
//! A [HistorySource] yields one [HistoryEvent] per change that added migration scripts,
//! oldest first. The [Catalog](crate::Catalog) turns those events into migration units.
//!
//! Two sources ship with the crate:
//! - [GitHistory] reads `git log` in the migration directory. Identities are commit ids and
//!   the order is the order commits were made.
//! - [DirectoryHistory] scans the migration directory. Identities are SHA-256 hashes of the
//!   directory name and script contents, and the order is the lexical order of directory
//!   names (which start with a creation timestamp).

use crate::error::Error;
use chrono::{DateTime, FixedOffset, Utc};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Command;

/// One addition of migration files to the history.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEvent {
    pub identity: String,
    pub committed_at: DateTime<FixedOffset>,
    /// Added file paths, relative to the source root.
    pub added: Vec<PathBuf>,
}

/// An ordered, deterministic stream of migration additions.
pub trait HistorySource {
    /// Directory that event paths are relative to.
    fn root(&self) -> &Path;

    /// All events, oldest first.
    fn events(&self) -> Result<Vec<HistoryEvent>, Error>;
}

/// Migration history read from the commits of a git repository.
#[derive(Debug, Clone)]
pub struct GitHistory {
    root: PathBuf,
}

impl GitHistory {
    /// Read history for the migrations under `root`. Only files below `root` are considered,
    /// and event paths are reported relative to it.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl HistorySource for GitHistory {
    fn root(&self) -> &Path {
        &self.root
    }

    fn events(&self) -> Result<Vec<HistoryEvent>, Error> {
        let output = Command::new("git")
            .args([
                "-c",
                "core.quotePath=false",
                "log",
                "--pretty=format:%H|%aD",
                "--name-status",
                "--diff-filter=A",
                "--reverse",
                "--relative",
                "--",
                ".",
            ])
            .current_dir(&self.root)
            .output()
            .map_err(|e| {
                Error::Discovery(format!(
                    "failed to run git in {}: {}",
                    self.root.display(),
                    e
                ))
            })?;

        if !output.status.success() {
            return Err(Error::Discovery(format!(
                "git log failed in {}: {}",
                self.root.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let stdout = String::from_utf8(output.stdout)
            .map_err(|e| Error::Discovery(format!("git log produced invalid utf-8: {}", e)))?;

        #[cfg(feature = "tracing")]
        tracing::debug!(root = %self.root.display(), bytes = stdout.len(), "Read git history");

        parse_log(&stdout)
    }
}

/// Parse the output of `git log --pretty=format:%H|%aD --name-status`.
///
/// Each commit is a `hash|date` header line followed by `status<TAB>path` lines.
pub(crate) fn parse_log(log: &str) -> Result<Vec<HistoryEvent>, Error> {
    let mut events: Vec<HistoryEvent> = Vec::new();

    for line in log.lines() {
        if line.trim().is_empty() {
            continue;
        }

        if let Some((_status, path)) = line.rsplit_once('\t') {
            let current = events.last_mut().ok_or_else(|| {
                Error::Discovery(format!("file entry before any commit header: {}", line))
            })?;
            current.added.push(PathBuf::from(path));
            continue;
        }

        let (hash, date) = line
            .split_once('|')
            .ok_or_else(|| Error::Discovery(format!("malformed commit header: {}", line)))?;
        events.push(HistoryEvent {
            identity: hash.trim().to_string(),
            committed_at: parse_commit_time(date)?,
            added: Vec::new(),
        });
    }

    Ok(events)
}

/// Parse an RFC 2822 commit date such as `Sat, 14 Nov 2020 13:03:03 -0800`.
pub(crate) fn parse_commit_time(timestamp: &str) -> Result<DateTime<FixedOffset>, Error> {
    DateTime::parse_from_rfc2822(timestamp.trim()).map_err(|e| {
        Error::Discovery(format!("invalid commit timestamp '{}': {}", timestamp, e))
    })
}

/// Migration history read from the migration directories themselves.
#[derive(Debug, Clone)]
pub struct DirectoryHistory {
    root: PathBuf,
}

impl DirectoryHistory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn content_hash(&self, name: &str, files: &[PathBuf]) -> Result<String, Error> {
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        for file in files {
            hasher.update(b"|");
            hasher.update(std::fs::read(self.root.join(file))?);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }
}

impl HistorySource for DirectoryHistory {
    fn root(&self) -> &Path {
        &self.root
    }

    fn events(&self) -> Result<Vec<HistoryEvent>, Error> {
        let read = std::fs::read_dir(&self.root).map_err(|e| {
            Error::Discovery(format!(
                "failed to read migration directory {}: {}",
                self.root.display(),
                e
            ))
        })?;

        let mut dirs = Vec::new();
        for entry in read {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type()?.is_dir() && !name.starts_with('.') {
                dirs.push((name, entry.path()));
            }
        }
        dirs.sort_by(|a, b| a.0.cmp(&b.0));

        let mut events = Vec::with_capacity(dirs.len());
        for (name, path) in dirs {
            let mut added: Vec<PathBuf> = ["up.sql", "down.sql"]
                .iter()
                .filter(|file| path.join(file).is_file())
                .map(|file| PathBuf::from(&name).join(file))
                .collect();
            added.sort();

            let modified: DateTime<Utc> = std::fs::metadata(&path)?.modified()?.into();

            events.push(HistoryEvent {
                identity: self.content_hash(&name, &added)?,
                committed_at: modified.fixed_offset(),
                added,
            });
        }

        Ok(events)
    }
}
