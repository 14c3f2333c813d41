use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use hashbrown::HashMap;
use pregen_world::{CellCoord, KeySet, PartitionId, ViewerId, ViewerPosition};

#[derive(Debug)]
struct ViewerEntry {
    partition: PartitionId,
    cell: CellCoord,
    delivered: Arc<KeySet>,
}

/// Viewers the host reports, with the cells each one has already been sent.
///
/// The host updates positions from its own thread; the worker only reads snapshots.
#[derive(Debug, Default)]
pub struct ViewerTracker {
    viewers: RwLock<HashMap<ViewerId, ViewerEntry>>,
}

impl ViewerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ViewerId, ViewerEntry>> {
        self.viewers.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ViewerId, ViewerEntry>> {
        self.viewers.write().unwrap_or_else(|p| p.into_inner())
    }

    pub fn join(&self, id: ViewerId, partition: PartitionId, cell: CellCoord) {
        log::debug!("{} joined {} at {:?}", id, partition, cell);
        self.write().insert(
            id,
            ViewerEntry {
                partition,
                cell,
                delivered: Arc::new(KeySet::new()),
            },
        );
    }

    /// Moves a viewer, joining it if unknown. Crossing into another partition forgets what
    /// was delivered, since cell keys are only unique within one partition.
    pub fn update(&self, id: ViewerId, partition: PartitionId, cell: CellCoord) {
        let mut viewers = self.write();
        match viewers.get_mut(&id) {
            Some(entry) => {
                if entry.partition != partition {
                    entry.delivered = Arc::new(KeySet::new());
                    entry.partition = partition;
                }
                entry.cell = cell;
            }
            None => {
                viewers.insert(
                    id,
                    ViewerEntry {
                        partition,
                        cell,
                        delivered: Arc::new(KeySet::new()),
                    },
                );
            }
        }
    }

    pub fn leave(&self, id: ViewerId) -> bool {
        let left = self.write().remove(&id).is_some();
        if left {
            log::debug!("{} left", id);
        }
        left
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    /// Positions ordered by viewer id.
    pub fn snapshot(&self) -> Vec<ViewerPosition> {
        let mut out: Vec<ViewerPosition> = self
            .read()
            .iter()
            .map(|(id, e)| ViewerPosition {
                id: *id,
                partition: e.partition.clone(),
                cell: e.cell,
            })
            .collect();
        out.sort_by_key(|p| p.id);
        out
    }

    pub fn position(&self, id: ViewerId) -> Option<ViewerPosition> {
        self.read().get(&id).map(|e| ViewerPosition {
            id,
            partition: e.partition.clone(),
            cell: e.cell,
        })
    }

    pub fn delivered(&self, id: ViewerId) -> Option<Arc<KeySet>> {
        self.read().get(&id).map(|e| Arc::clone(&e.delivered))
    }

    /// Forgets what was sent to one viewer so catch-up resends it.
    pub fn reset_delivered(&self, id: ViewerId) {
        if let Some(e) = self.read().get(&id) {
            e.delivered.clear();
        }
    }

    /// Records `cell` as delivered to every viewer currently in `partition`.
    pub fn mark_delivered_in(&self, partition: &PartitionId, cell: CellCoord) {
        let key = cell.key();
        for e in self.read().values() {
            if &e.partition == partition {
                e.delivered.insert(key);
            }
        }
    }

    /// Takes `cell` back out of a viewer's delivered set, as long as the viewer is still in
    /// `partition`.
    pub fn unmark_delivered(&self, id: ViewerId, partition: &PartitionId, cell: CellCoord) -> bool {
        match self.read().get(&id) {
            Some(e) if &e.partition == partition => e.delivered.remove(cell.key()),
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
