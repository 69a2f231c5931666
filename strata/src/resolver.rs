use crate::catalog::Catalog;
use crate::core::{Direction, Order, Steps};
use crate::error::Error;
use std::ops::Range;

/// Compute the range of catalog indices, in `order`, to run for a command.
///
/// - `current` is the ledger position; `None` (or an empty identity) means nothing has run.
/// - Forward selections start after the current unit; backward selections start at it, so
///   the current unit is the first one undone.
/// - Callers resolve forward selections against [Order::Ascending] and backward ones
///   against [Order::Descending] (see [Direction::order]).
///
/// Fails with [Error::NoStartingPoint] for a backward selection with no position, and with
/// [Error::PositionNotFound] when the position is not in the catalog.
pub fn resolve(
    catalog: &Catalog,
    order: Order,
    current: Option<&str>,
    direction: Direction,
    steps: Steps,
) -> Result<Range<usize>, Error> {
    let items = catalog.len();
    let steps = steps.normalized();

    let current = current.filter(|identity| !identity.is_empty());
    let start = match (current, direction) {
        (None, Direction::Up) => 0,
        (None, Direction::Down) => return Err(Error::NoStartingPoint),
        (Some(identity), direction) => {
            let index = catalog
                .position_of(order, identity)
                .ok_or_else(|| Error::PositionNotFound(identity.to_string()))?;
            match direction {
                Direction::Up => index + 1,
                Direction::Down => index,
            }
        }
    };

    let range = start.min(items)..boundary(items, start, steps);

    #[cfg(feature = "tracing")]
    tracing::debug!(
        current = ?current,
        %direction,
        ?order,
        ?steps,
        start = range.start,
        stop = range.end,
        "Resolved migration range"
    );

    Ok(range)
}

/// Stop index for a selection of `steps` units starting at `start`, never past `items`.
pub(crate) fn boundary(items: usize, start: usize, steps: Steps) -> usize {
    match steps.normalized() {
        Steps::All => items,
        Steps::Count(n) => start.saturating_add(n).min(items),
    }
}
