//! Emit one record per device.

use crate::{record::OutputRecord, store::Snapshot};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
/// Emits every device in the snapshot as its own record, routed by device
/// id and stamped with the flush time.
pub struct Immediate;

impl Immediate {
    /// Build one record per device in `snapshot`.
    ///
    /// Records are ordered by device id.
    #[must_use]
    pub fn on_flush(self, snapshot: &Snapshot, now_ms: i64) -> Vec<OutputRecord> {
        let mut ids: Vec<&String> = snapshot.keys().collect();
        ids.sort_unstable();
        ids.into_iter()
            .map(|id| OutputRecord::device(id.clone(), snapshot[id].clone(), now_ms))
            .collect()
    }
}
