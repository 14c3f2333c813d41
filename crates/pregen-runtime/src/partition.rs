use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use pregen_index::{BatchLedger, ProximityWorkIndex};
use pregen_io::RosterStore;
use pregen_world::{CellCoord, KeySet, PartitionId};

/// Per-partition scheduling state. Created on first use and loaded from disk before anyone
/// else can see it.
#[derive(Debug)]
pub(crate) struct PartitionState {
    pub id: PartitionId,
    pub completed: KeySet,
    /// Admitted cells whose generation has not resolved yet.
    pub tracked: KeySet,
    pub index: ProximityWorkIndex,
    pub batches: BatchLedger,
    remaining_in_radius: AtomicI64,
    pub fast_mode: bool,
    loaded: AtomicBool,
    /// Generated cells changed since they were last published.
    pub dirty: KeySet,
    last_flush: Mutex<Option<Instant>>,
}

impl PartitionState {
    pub fn new(id: PartitionId, fast_mode: bool) -> Self {
        Self {
            id,
            completed: KeySet::new(),
            tracked: KeySet::new(),
            index: ProximityWorkIndex::new(),
            batches: BatchLedger::new(),
            remaining_in_radius: AtomicI64::new(0),
            fast_mode,
            loaded: AtomicBool::new(false),
            dirty: KeySet::new(),
            last_flush: Mutex::new(None),
        }
    }

    /// Reads the saved roster and replays it into the index.
    pub fn load(&self, store: &RosterStore) -> usize {
        store.load(&self.id, &self.completed);
        let replayed = self
            .index
            .mark_all(self.completed.snapshot().into_iter().map(|k| k.coord()));
        self.loaded.store(true, Ordering::Release);
        replayed
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Saves the completed set if it was ever loaded; a never-loaded state would overwrite
    /// the roster with nothing.
    pub fn persist(&self, store: &RosterStore) {
        if self.is_loaded() {
            let _ = store.save(&self.id, &self.completed);
        }
    }

    /// Never negative.
    pub fn remaining_in_radius(&self) -> u64 {
        self.remaining_in_radius.load(Ordering::Acquire).max(0) as u64
    }

    pub fn set_remaining_in_radius(&self, n: u64) {
        self.remaining_in_radius
            .store(i64::try_from(n).unwrap_or(i64::MAX), Ordering::Release);
    }

    pub fn decrement_remaining(&self) {
        let _ = self
            .remaining_in_radius
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n > 0).then(|| n - 1)
            });
    }

    /// Admits a cell for generation. Returns `false` if it is already in flight.
    pub fn track(&self, cell: CellCoord) -> bool {
        if !self.tracked.insert(cell.key()) {
            return false;
        }
        self.index.mark_in_flight(cell);
        true
    }

    /// Returns `true` when the cell was in flight.
    pub fn untrack(&self, cell: CellCoord) -> bool {
        let was = self.tracked.remove(cell.key());
        self.index.clear_in_flight(cell);
        was
    }

    /// Adds to the completed set and the index. Returns `true` the first time.
    pub fn complete(&self, cell: CellCoord) -> bool {
        let fresh = self.completed.insert(cell.key());
        self.index.mark_completed(cell);
        fresh
    }

    /// Returns `true` and restarts the timer when `interval` passed since the last flush.
    pub fn flush_due(&self, now: Instant, interval: Duration) -> bool {
        let mut last = self.last_flush.lock().unwrap_or_else(|p| p.into_inner());
        match *last {
            Some(t) if now.saturating_duration_since(t) < interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

/// All partitions seen since start.
#[derive(Debug, Default)]
pub(crate) struct PartitionMap {
    states: RwLock<HashMap<PartitionId, Arc<PartitionState>>>,
}

impl PartitionMap {
    pub fn get(&self, id: &PartitionId) -> Option<Arc<PartitionState>> {
        self.states
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned()
    }

    /// Returns the state for `id`, creating and loading it first if needed. Loading happens
    /// under the write lock so no caller observes a half-loaded partition.
    pub fn get_or_load(
        &self,
        id: &PartitionId,
        store: &RosterStore,
        fast_mode: impl FnOnce() -> bool,
    ) -> Arc<PartitionState> {
        if let Some(state) = self.get(id) {
            return state;
        }
        let mut states = self.states.write().unwrap_or_else(|p| p.into_inner());
        if let Some(state) = states.get(id) {
            return Arc::clone(state);
        }
        let state = Arc::new(PartitionState::new(id.clone(), fast_mode()));
        let n = state.load(store);
        if state.fast_mode {
            log::info!("{} uses fast generation ({} cells already done)", id, n);
        } else {
            log::debug!("set up {} with {} completed cells", id, n);
        }
        states.insert(id.clone(), Arc::clone(&state));
        state
    }

    pub fn all(&self) -> Vec<Arc<PartitionState>> {
        self.states
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.states
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }
}
