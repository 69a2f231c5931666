use crate::core::{Batch, Ledger};
use crate::error::Error;

/// Reconstruct the most recent batch from the ledger's last two markers.
///
/// The anchor is the newest marker. The batch holds every row inserted after the previous
/// marker (or every row, for the first batch), and that previous marker becomes the
/// exclude identity so rollback and redo stop before touching the earlier batch.
///
/// Returns [Error::NoBatchFound] when the ledger has no markers yet.
pub fn last_batch<L: Ledger + ?Sized>(ledger: &mut L) -> Result<Batch, Error> {
    let anchor_identity = ledger.position_at_offset(0)?.ok_or(Error::NoBatchFound)?;
    let exclude_identity = ledger.position_at_offset(1)?;
    let step_count = ledger.count_after(exclude_identity.as_deref())?;

    #[cfg(feature = "tracing")]
    tracing::debug!(
        anchor = %anchor_identity,
        exclude = ?exclude_identity,
        step_count,
        "Reconstructed last batch"
    );

    Ok(Batch {
        anchor_identity,
        step_count,
        exclude_identity,
    })
}
