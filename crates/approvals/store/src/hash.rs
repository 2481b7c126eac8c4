//! Hash chaining for history entries.

use crate::{StoreError, StoreResult};
use approvals_types::{HistoryAppend, HistoryEntry};

/// Compute the chained hash of a history entry.
pub fn history_hash(
    entry: &HistoryAppend,
    previous_hash: Option<&str>,
    sequence: u64,
) -> StoreResult<String> {
    let serializable = serde_json::json!({
        "previous_hash": previous_hash,
        "sequence": sequence,
        "instance_id": entry.instance_id,
        "from_stage_id": entry.from_stage_id,
        "to_stage_id": entry.to_stage_id,
        "action": entry.action,
        "performed_by": entry.performed_by,
        "remarks": entry.remarks,
        "metadata": entry.metadata,
        "performed_at": entry.performed_at,
    });
    let serialized = serde_json::to_vec(&serializable)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(blake3::hash(&serialized).to_hex().to_string())
}

/// Recompute the chain of one instance's history (ordered by sequence).
///
/// Returns the sequence of the first entry that does not verify.
pub fn verify_chain(entries: &[HistoryEntry]) -> StoreResult<Option<u64>> {
    let mut previous: Option<&str> = None;
    for (index, entry) in entries.iter().enumerate() {
        let expected_sequence = index as u64 + 1;
        if entry.sequence != expected_sequence || entry.previous_hash.as_deref() != previous {
            return Ok(Some(entry.sequence));
        }
        let hash = history_hash(&entry.to_append(), previous, entry.sequence)?;
        if hash != entry.hash {
            return Ok(Some(entry.sequence));
        }
        previous = Some(entry.hash.as_str());
    }
    Ok(None)
}
