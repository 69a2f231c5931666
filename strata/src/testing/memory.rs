use crate::core::{Backend, Ledger, LedgerEntry, MigrationUnit, DEFAULT_LEDGER_TABLE_NAME};
use crate::error::Error;
use chrono::Utc;

/// An in-memory [Backend] that records the scripts it runs.
///
/// Scripts containing the substring given to [MemoryStore::failing_on] fail instead of
/// running, which makes partial-batch behavior easy to exercise. With
/// [MemoryStore::failing_marks], closing a partial batch with [Ledger::mark] fails too.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    initialized: bool,
    rows: Vec<LedgerEntry>,
    scripts: Vec<String>,
    fail_on: Option<String>,
    fail_marks: bool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// A store whose ledger table already exists.
    pub fn new() -> Self {
        Self {
            initialized: true,
            rows: Vec::new(),
            scripts: Vec::new(),
            fail_on: None,
            fail_marks: false,
        }
    }

    /// A store with no ledger table; [Ledger::initialize] must run first.
    pub fn uninitialized() -> Self {
        Self {
            initialized: false,
            ..Self::new()
        }
    }

    pub fn failing_on(mut self, pattern: impl Into<String>) -> Self {
        self.fail_on = Some(pattern.into());
        self
    }

    pub fn failing_marks(mut self) -> Self {
        self.fail_marks = true;
        self
    }

    /// Scripts run so far, oldest first. Failed scripts are not included.
    pub fn scripts_run(&self) -> &[String] {
        &self.scripts
    }

    fn index_of(&self, identity: &str) -> Result<usize, Error> {
        self.rows
            .iter()
            .position(|r| r.identity == identity)
            .ok_or_else(|| Error::PositionNotFound(identity.to_string()))
    }

    fn entry_for(unit: &MigrationUnit, marker: bool, seed: bool) -> LedgerEntry {
        LedgerEntry {
            identity: unit.identity().to_string(),
            author: unit.author().to_string(),
            created_at: unit.created_at(),
            merged_at: unit.merged_at(),
            executed_at: Utc::now(),
            marker,
            seed,
        }
    }
}

impl Ledger for MemoryStore {
    fn table_name(&self) -> &str {
        DEFAULT_LEDGER_TABLE_NAME
    }

    fn is_initialized(&mut self) -> Result<bool, Error> {
        Ok(self.initialized)
    }

    fn initialize(&mut self, seed: Option<&MigrationUnit>) -> Result<(), Error> {
        if let Some(unit) = seed {
            if !self.rows.is_empty() {
                return Err(Error::Generic(format!(
                    "cannot seed {}: the ledger already has {} entries",
                    unit.identity(),
                    self.rows.len()
                )));
            }
            self.rows.push(Self::entry_for(unit, true, true));
        }
        self.initialized = true;
        Ok(())
    }

    fn position_at_offset(&mut self, offset: usize) -> Result<Option<String>, Error> {
        Ok(self
            .rows
            .iter()
            .rev()
            .filter(|r| r.marker)
            .nth(offset)
            .map(|r| r.identity.clone()))
    }

    fn count_after(&mut self, identity: Option<&str>) -> Result<usize, Error> {
        match identity {
            None => Ok(self.rows.len()),
            Some(identity) => Ok(self.rows.len() - self.index_of(identity)? - 1),
        }
    }

    fn entries(&mut self) -> Result<Vec<LedgerEntry>, Error> {
        Ok(self.rows.clone())
    }

    fn seed(&mut self) -> Result<Option<String>, Error> {
        Ok(self
            .rows
            .iter()
            .find(|r| r.seed)
            .map(|r| r.identity.clone()))
    }

    fn insert(&mut self, unit: &MigrationUnit, is_marker: bool) -> Result<(), Error> {
        if self.index_of(unit.identity()).is_ok() {
            return Err(Error::Generic(format!(
                "ledger already has an entry for {}",
                unit.identity()
            )));
        }
        self.rows.push(Self::entry_for(unit, is_marker, false));
        Ok(())
    }

    fn delete(&mut self, identity: &str) -> Result<(), Error> {
        let removed = self.rows.remove(self.index_of(identity)?);
        if removed.marker {
            if let Some(last) = self.rows.last_mut() {
                last.marker = true;
            }
        }
        Ok(())
    }

    fn mark(&mut self, identity: &str) -> Result<(), Error> {
        if self.fail_marks {
            return Err(Error::Generic(format!("cannot mark {}", identity)));
        }
        let index = self.index_of(identity)?;
        self.rows[index].marker = true;
        Ok(())
    }
}

impl Backend for MemoryStore {
    fn run_script(&mut self, script: &str) -> Result<(), Error> {
        if let Some(pattern) = &self.fail_on {
            if script.contains(pattern.as_str()) {
                return Err(Error::Generic(format!("script failed: {}", script)));
            }
        }
        self.scripts.push(script.to_string());
        Ok(())
    }
}
