use crate::batch::last_batch;
use crate::catalog::Catalog;
use crate::core::{Backend, Direction, Ledger, MigrationUnit, Order, Steps};
use crate::error::Error;
use crate::executor::{ExecutionReport, Executor};
use crate::resolver::resolve;
use std::time::Duration;

/// Outcome of [Migrator::redo]: the batch that was undone, then the same units re-applied.
#[derive(Debug, PartialEq)]
pub struct RedoReport {
    pub rollback: ExecutionReport,
    pub reapply: ExecutionReport,
}

impl RedoReport {
    /// Fail with the first execution error of either phase.
    pub fn into_result(self) -> Result<Self, Error> {
        let rollback = self.rollback.into_result()?;
        let reapply = self.reapply.into_result()?;
        Ok(Self { rollback, reapply })
    }
}

/// Runs migration workflows for one catalog against a [Backend].
///
/// The catalog is built once per invocation; every workflow reads the ledger position
/// fresh from the store it is given.
#[derive(Debug)]
pub struct Migrator {
    catalog: Catalog,
    executor: Executor,
}

impl Migrator {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            catalog,
            executor: Executor::new(),
        }
    }

    /// Set a callback to be invoked when a unit starts running.
    pub fn on_unit_start<F>(mut self, callback: F) -> Self
    where
        F: Fn(&MigrationUnit, Direction) + Send + Sync + 'static,
    {
        self.executor.set_on_unit_start(callback);
        self
    }

    /// Set a callback to be invoked when a unit completes successfully.
    /// The callback receives the unit, the direction, and how long the step took.
    pub fn on_unit_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&MigrationUnit, Direction, Duration) + Send + Sync + 'static,
    {
        self.executor.set_on_unit_complete(callback);
        self
    }

    /// Set a callback to be invoked when a unit fails.
    pub fn on_unit_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&MigrationUnit, Direction, &Error) + Send + Sync + 'static,
    {
        self.executor.set_on_unit_error(callback);
        self
    }

    /// Set a callback to be invoked when a run stops before an excluded unit.
    pub fn on_unit_excluded<F>(mut self, callback: F) -> Self
    where
        F: Fn(&MigrationUnit, Direction) + Send + Sync + 'static,
    {
        self.executor.set_on_unit_excluded(callback);
        self
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    fn ensure_initialized<L: Ledger + ?Sized>(&self, ledger: &mut L) -> Result<(), Error> {
        if ledger.is_initialized()? {
            Ok(())
        } else {
            Err(Error::Uninitialized(ledger.table_name().to_string()))
        }
    }

    /// Identity of the most recent marker, i.e. the last unit of the last batch.
    pub fn position<L: Ledger + ?Sized>(&self, ledger: &mut L) -> Result<Option<String>, Error> {
        self.ensure_initialized(ledger)?;
        ledger.position_at_offset(0)
    }

    /// The position, provided every ledger row belongs to a batch. Rows after the most
    /// recent marker are left by a partial run whose closing mark failed.
    fn settled_position<L: Ledger + ?Sized>(&self, ledger: &mut L) -> Result<Option<String>, Error> {
        let position = self.position(ledger)?;
        let count = ledger.count_after(position.as_deref())?;
        if count > 0 {
            let newest = ledger
                .entries()?
                .pop()
                .map(|entry| entry.identity)
                .unwrap_or_default();
            return Err(Error::UnmarkedRows { newest, count });
        }
        Ok(position)
    }

    /// The units [Migrator::up] would run, without running them.
    pub fn preview_up<L: Ledger + ?Sized>(
        &self,
        ledger: &mut L,
        steps: Steps,
    ) -> Result<Vec<&MigrationUnit>, Error> {
        let position = self.settled_position(ledger)?;
        let range = resolve(
            &self.catalog,
            Order::Ascending,
            position.as_deref(),
            Direction::Up,
            steps,
        )?;
        Ok(self.catalog.select(Order::Ascending, range))
    }

    /// The units [Migrator::down] would undo, without undoing them.
    pub fn preview_down<L: Ledger + ?Sized>(
        &self,
        ledger: &mut L,
        steps: Steps,
    ) -> Result<Vec<&MigrationUnit>, Error> {
        let position = self.settled_position(ledger)?;
        let range = match resolve(
            &self.catalog,
            Order::Descending,
            position.as_deref(),
            Direction::Down,
            steps,
        ) {
            Ok(range) => range,
            Err(Error::NoStartingPoint) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let seed = ledger.seed()?;
        let mut selection = self.catalog.select(Order::Descending, range);
        if let Some(stop) = selection
            .iter()
            .position(|u| Some(u.identity()) == seed.as_deref())
        {
            selection.truncate(stop);
        }
        Ok(selection)
    }

    /// Apply up to `steps` pending units, as one batch.
    pub fn up<B: Backend + ?Sized>(
        &self,
        store: &mut B,
        steps: Steps,
    ) -> Result<ExecutionReport, Error> {
        let selection = self.preview_up(store, steps)?;

        #[cfg(feature = "tracing")]
        tracing::info!(units = selection.len(), ?steps, "Migrating up");

        Ok(self.executor.execute(&selection, Direction::Up, store, None))
    }

    /// Undo up to `steps` units, newest first, regardless of batch boundaries. The seed row
    /// written by `init` is never undone.
    pub fn down<B: Backend + ?Sized>(
        &self,
        store: &mut B,
        steps: Steps,
    ) -> Result<ExecutionReport, Error> {
        let position = self.settled_position(store)?;
        let range = match resolve(
            &self.catalog,
            Order::Descending,
            position.as_deref(),
            Direction::Down,
            steps,
        ) {
            Ok(range) => range,
            Err(Error::NoStartingPoint) => {
                #[cfg(feature = "tracing")]
                tracing::info!("Nothing to migrate down");
                return Ok(ExecutionReport::empty(Direction::Down));
            }
            Err(e) => return Err(e),
        };
        let seed = store.seed()?;
        let selection = self.catalog.select(Order::Descending, range);

        #[cfg(feature = "tracing")]
        tracing::info!(units = selection.len(), ?steps, "Migrating down");

        Ok(self
            .executor
            .execute(&selection, Direction::Down, store, seed.as_deref()))
    }

    /// Undo exactly the most recent batch.
    pub fn rollback<B: Backend + ?Sized>(&self, store: &mut B) -> Result<ExecutionReport, Error> {
        self.settled_position(store)?;
        let batch = match last_batch(store) {
            Ok(batch) => batch,
            Err(Error::NoBatchFound) => {
                #[cfg(feature = "tracing")]
                tracing::info!("No batch to roll back");
                return Ok(ExecutionReport::empty(Direction::Down));
            }
            Err(e) => return Err(e),
        };
        if batch.step_count == 0 {
            return Ok(ExecutionReport::empty(Direction::Down));
        }

        let range = resolve(
            &self.catalog,
            Order::Descending,
            Some(batch.anchor_identity.as_str()),
            Direction::Down,
            Steps::Count(batch.step_count),
        )?;
        let exclude = match batch.exclude_identity {
            Some(exclude) => Some(exclude),
            None => store.seed()?,
        };
        let selection = self.catalog.select(Order::Descending, range);

        #[cfg(feature = "tracing")]
        tracing::info!(
            anchor = %batch.anchor_identity,
            step_count = batch.step_count,
            exclude = ?exclude,
            "Rolling back last batch"
        );

        Ok(self
            .executor
            .execute(&selection, Direction::Down, store, exclude.as_deref()))
    }

    /// Roll back the most recent batch, then re-apply the units that were undone.
    ///
    /// When the rollback fails, nothing is re-applied.
    pub fn redo<B: Backend + ?Sized>(&self, store: &mut B) -> Result<RedoReport, Error> {
        let rollback = self.rollback(store)?;
        if rollback.failure.is_some() {
            return Ok(RedoReport {
                rollback,
                reapply: ExecutionReport::empty(Direction::Up),
            });
        }

        let mut selection: Vec<&MigrationUnit> = rollback
            .applied()
            .into_iter()
            .filter_map(|identity| self.catalog.find(identity))
            .collect();
        selection.sort_by_key(|u| u.sequence_index());

        #[cfg(feature = "tracing")]
        tracing::info!(units = selection.len(), "Re-applying rolled back batch");

        let reapply = self.executor.execute(&selection, Direction::Up, store, None);
        Ok(RedoReport { rollback, reapply })
    }

    /// Units at or before the current position, newest first.
    pub fn list_executed<L: Ledger + ?Sized>(
        &self,
        ledger: &mut L,
    ) -> Result<Vec<&MigrationUnit>, Error> {
        let position = self.position(ledger)?;
        let range = match resolve(
            &self.catalog,
            Order::Descending,
            position.as_deref(),
            Direction::Down,
            Steps::All,
        ) {
            Ok(range) => range,
            Err(Error::NoStartingPoint) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(self.catalog.select(Order::Descending, range))
    }

    /// Units after the current position, oldest first.
    pub fn list_pending<L: Ledger + ?Sized>(
        &self,
        ledger: &mut L,
    ) -> Result<Vec<&MigrationUnit>, Error> {
        self.preview_up(ledger, Steps::All)
    }

    /// Create the ledger table. With `seed`, record that unit as an already-applied baseline:
    /// later forward runs start after it, and it is never undone.
    pub fn init<L: Ledger + ?Sized>(&self, ledger: &mut L, seed: Option<&str>) -> Result<(), Error> {
        let seed = match seed.filter(|s| !s.is_empty()) {
            Some(identity) => Some(
                self.catalog
                    .find(identity)
                    .ok_or_else(|| Error::PositionNotFound(identity.to_string()))?,
            ),
            None => None,
        };
        ledger.initialize(seed)?;

        #[cfg(feature = "tracing")]
        tracing::info!(
            table = %ledger.table_name(),
            seed = ?seed.map(|u| u.identity()),
            "Initialized ledger"
        );

        Ok(())
    }
}
