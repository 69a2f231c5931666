use crate::core::{Backend, Direction, MigrationUnit, Step, UnitState};
use crate::error::Error;
use std::time::{Duration, Instant};

/// Represents the failure of one unit during an execution.
#[derive(Debug, PartialEq)]
pub struct ExecutionFailure {
    pub(crate) identity: String,
    pub(crate) error: Error,
    /// Set when the partial batch could not be closed with a marker.
    pub(crate) unmarked: Option<(String, Error)>,
}

impl ExecutionFailure {
    /// Identity of the unit that failed.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Get the error that caused the unit to fail.
    pub fn error(&self) -> &Error {
        &self.error
    }

    /// The unit that should have closed the partial batch, and why marking it failed.
    pub fn unmarked(&self) -> Option<(&str, &Error)> {
        self.unmarked
            .as_ref()
            .map(|(identity, error)| (identity.as_str(), error))
    }
}

/// The final state of one selected unit.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitOutcome {
    pub identity: String,
    pub state: UnitState,
}

/// A report of actions performed while executing a selection.
#[derive(Debug, PartialEq)]
pub struct ExecutionReport {
    pub direction: Direction,
    /// Every unit that was eligible to run, in execution order.
    pub outcomes: Vec<UnitOutcome>,
    /// The unit execution stopped before, when an exclude identity was reached.
    pub excluded: Option<String>,
    pub failure: Option<ExecutionFailure>,
}

impl ExecutionReport {
    pub(crate) fn empty(direction: Direction) -> Self {
        Self {
            direction,
            outcomes: Vec::new(),
            excluded: None,
            failure: None,
        }
    }

    /// Identities of the units applied, in the order they ran.
    pub fn applied(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| o.state == UnitState::Applied)
            .map(|o| o.identity.as_str())
            .collect()
    }

    /// Whether nothing was attempted.
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Convert a report carrying a failure into [Error::Execution], or
    /// [Error::UnmarkedBatch] when the partial batch was left without a marker.
    pub fn into_result(self) -> Result<Self, Error> {
        match self.failure {
            None => Ok(self),
            Some(failure) => {
                let applied = self
                    .outcomes
                    .iter()
                    .filter(|o| o.state == UnitState::Applied)
                    .map(|o| o.identity.clone())
                    .collect();
                Err(match failure.unmarked {
                    None => Error::Execution {
                        identity: failure.identity,
                        applied,
                        source: Box::new(failure.error),
                    },
                    Some((marker, mark_error)) => Error::UnmarkedBatch {
                        identity: failure.identity,
                        applied,
                        marker,
                        mark_error: Box::new(mark_error),
                        source: Box::new(failure.error),
                    },
                })
            }
        }
    }
}

type UnitCallback = Box<dyn Fn(&MigrationUnit, Direction) + Send + Sync>;
type CompleteCallback = Box<dyn Fn(&MigrationUnit, Direction, Duration) + Send + Sync>;
type ErrorCallback = Box<dyn Fn(&MigrationUnit, Direction, &Error) + Send + Sync>;

/// Runs a selection of units against a [Backend], one step at a time.
#[derive(Default)]
pub struct Executor {
    pub(crate) on_unit_start: Option<UnitCallback>,
    pub(crate) on_unit_complete: Option<CompleteCallback>,
    pub(crate) on_unit_error: Option<ErrorCallback>,
    pub(crate) on_unit_excluded: Option<UnitCallback>,
}

// Manual Debug impl since closures don't implement Debug
impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("on_unit_start", &self.on_unit_start.is_some())
            .field("on_unit_complete", &self.on_unit_complete.is_some())
            .field("on_unit_error", &self.on_unit_error.is_some())
            .field("on_unit_excluded", &self.on_unit_excluded.is_some())
            .finish()
    }
}

impl Executor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_on_unit_start(
        &mut self,
        callback: impl Fn(&MigrationUnit, Direction) + Send + Sync + 'static,
    ) -> &mut Self {
        self.on_unit_start = Some(Box::new(callback));
        self
    }

    pub fn set_on_unit_complete(
        &mut self,
        callback: impl Fn(&MigrationUnit, Direction, Duration) + Send + Sync + 'static,
    ) -> &mut Self {
        self.on_unit_complete = Some(Box::new(callback));
        self
    }

    pub fn set_on_unit_error(
        &mut self,
        callback: impl Fn(&MigrationUnit, Direction, &Error) + Send + Sync + 'static,
    ) -> &mut Self {
        self.on_unit_error = Some(Box::new(callback));
        self
    }

    pub fn set_on_unit_excluded(
        &mut self,
        callback: impl Fn(&MigrationUnit, Direction) + Send + Sync + 'static,
    ) -> &mut Self {
        self.on_unit_excluded = Some(Box::new(callback));
        self
    }

    /// Apply `selection` in the order given.
    ///
    /// Execution stops before a unit whose identity equals `exclude`, and at the first
    /// failure. Units applied before a failure stay applied; the failure is carried in the
    /// returned report.
    ///
    /// Going up, the last unit that will run is inserted with the batch marker. If the run
    /// fails after applying at least one unit, the last applied unit is marked instead so the
    /// partial batch can still be rolled back. Going down, deleting a marked row hands the
    /// marker to the newest remaining row.
    pub fn execute<B: Backend + ?Sized>(
        &self,
        selection: &[&MigrationUnit],
        direction: Direction,
        backend: &mut B,
        exclude: Option<&str>,
    ) -> ExecutionReport {
        let mut report = ExecutionReport::empty(direction);

        let runnable = match exclude {
            Some(exclude) => match selection.iter().position(|u| u.identity() == exclude) {
                Some(stop) => {
                    let excluded = selection[stop];
                    #[cfg(feature = "tracing")]
                    tracing::info!(
                        identity = %excluded.identity(),
                        %direction,
                        "Stopping before excluded migration"
                    );
                    if let Some(ref callback) = self.on_unit_excluded {
                        callback(excluded, direction);
                    }
                    report.excluded = Some(excluded.identity().to_string());
                    &selection[..stop]
                }
                None => selection,
            },
            None => selection,
        };

        report.outcomes = runnable
            .iter()
            .map(|u| UnitOutcome {
                identity: u.identity().to_string(),
                state: UnitState::Pending,
            })
            .collect();

        let last = runnable.len().saturating_sub(1);
        for (i, unit) in runnable.iter().enumerate() {
            report.outcomes[i].state = UnitState::Applying;

            #[cfg(feature = "tracing")]
            let _span = match direction {
                Direction::Up => tracing::info_span!("strata_unit_up", identity = %unit.identity(), directory = %unit.directory()),
                Direction::Down => tracing::info_span!("strata_unit_down", identity = %unit.identity(), directory = %unit.directory()),
            }
            .entered();

            #[cfg(feature = "tracing")]
            tracing::info!("Starting migration");

            if let Some(ref callback) = self.on_unit_start {
                callback(unit, direction);
            }

            let started = Instant::now();
            let result = unit.script(direction).read().and_then(|script| {
                backend.apply(&Step {
                    unit,
                    direction,
                    script: &script,
                    is_marker: direction == Direction::Up && i == last,
                })
            });

            match result {
                Ok(()) => {
                    let duration = started.elapsed();
                    report.outcomes[i].state = UnitState::Applied;

                    #[cfg(feature = "tracing")]
                    tracing::info!(
                        duration_ms = duration.as_millis(),
                        "Migration completed successfully"
                    );

                    if let Some(ref callback) = self.on_unit_complete {
                        callback(unit, direction, duration);
                    }
                }
                Err(error) => {
                    report.outcomes[i].state = UnitState::Failed;

                    #[cfg(feature = "tracing")]
                    tracing::error!(error = %error, "Migration failed");

                    if let Some(ref callback) = self.on_unit_error {
                        callback(unit, direction, &error);
                    }

                    let mut unmarked = None;
                    if direction == Direction::Up && i > 0 {
                        let closing = runnable[i - 1].identity();
                        if let Err(mark_error) = backend.mark(closing) {
                            #[cfg(feature = "tracing")]
                            tracing::error!(
                                identity = %closing,
                                error = %mark_error,
                                "Could not mark the last applied migration of a partial batch"
                            );
                            unmarked = Some((closing.to_string(), mark_error));
                        }
                    }

                    report.failure = Some(ExecutionFailure {
                        identity: unit.identity().to_string(),
                        error,
                        unmarked,
                    });
                    break;
                }
            }
        }

        report
    }
}
