//! Proximity-ordered discovery of cells that still need generating.
#![forbid(unsafe_code)]

mod ledger;
mod scan;

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use hashbrown::HashMap;
use pregen_world::{BatchKey, CellCoord, KeySet};

pub use ledger::{BatchLedger, BatchTicket};
use scan::{BucketWindow, ScanArea};

/// Cells handed out together by one [`ProximityWorkIndex::find_work`] call.
#[derive(Debug)]
pub struct Batch {
    pub key: BatchKey,
    /// Nearest first.
    pub cells: Vec<CellCoord>,
    pub ticket: Arc<BatchTicket>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Bucket {
    completed: u64,
    in_flight: u64,
}

/// Completed and in-flight cells of one partition, stored as 64-bit masks per batch bucket.
#[derive(Debug, Default)]
pub struct ProximityWorkIndex {
    buckets: RwLock<HashMap<BatchKey, Bucket>>,
}

impl ProximityWorkIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<BatchKey, Bucket>> {
        self.buckets.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<BatchKey, Bucket>> {
        self.buckets.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Returns `true` when the cell was not completed before.
    pub fn mark_completed(&self, cell: CellCoord) -> bool {
        let bit = 1u64 << BatchKey::slot(cell);
        let mut buckets = self.write();
        let bucket = buckets.entry(cell.batch()).or_default();
        let fresh = bucket.completed & bit == 0;
        bucket.completed |= bit;
        fresh
    }

    /// Bulk form of [`mark_completed`](Self::mark_completed) taking the lock once.
    pub fn mark_all(&self, cells: impl IntoIterator<Item = CellCoord>) -> usize {
        let mut buckets = self.write();
        let mut fresh = 0;
        for cell in cells {
            let bit = 1u64 << BatchKey::slot(cell);
            let bucket = buckets.entry(cell.batch()).or_default();
            if bucket.completed & bit == 0 {
                fresh += 1;
            }
            bucket.completed |= bit;
        }
        fresh
    }

    pub fn is_completed(&self, cell: CellCoord) -> bool {
        self.read()
            .get(&cell.batch())
            .is_some_and(|b| b.completed & (1u64 << BatchKey::slot(cell)) != 0)
    }

    pub fn completed_count(&self) -> u64 {
        self.read()
            .values()
            .map(|b| u64::from(b.completed.count_ones()))
            .sum()
    }

    /// Hides the cell from [`find_work`](Self::find_work) while it is being generated.
    /// Returns `true` when it was not in flight before.
    pub fn mark_in_flight(&self, cell: CellCoord) -> bool {
        let bit = 1u64 << BatchKey::slot(cell);
        let mut buckets = self.write();
        let bucket = buckets.entry(cell.batch()).or_default();
        let fresh = bucket.in_flight & bit == 0;
        bucket.in_flight |= bit;
        fresh
    }

    /// Returns `true` when the cell was in flight.
    pub fn clear_in_flight(&self, cell: CellCoord) -> bool {
        let bit = 1u64 << BatchKey::slot(cell);
        let mut buckets = self.write();
        match buckets.get_mut(&cell.batch()) {
            Some(bucket) if bucket.in_flight & bit != 0 => {
                bucket.in_flight &= !bit;
                true
            }
            _ => false,
        }
    }

    pub fn is_in_flight(&self, cell: CellCoord) -> bool {
        self.read()
            .get(&cell.batch())
            .is_some_and(|b| b.in_flight & (1u64 << BatchKey::slot(cell)) != 0)
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    /// Claims and returns the nearest bucket around `center` that still has cells neither
    /// completed nor in flight, and is not already open in `ledger`. The claim and the batch
    /// counter are registered in the ledger before returning, so concurrent callers never
    /// receive the same bucket.
    pub fn find_work(&self, center: CellCoord, radius: i32, ledger: &BatchLedger) -> Option<Batch> {
        let area = ScanArea::new(center, radius);
        let buckets = self.read();
        for window in area.windows_by_distance() {
            let bucket = buckets.get(&window.key).copied().unwrap_or_default();
            let missing = window.mask & !(bucket.completed | bucket.in_flight);
            if missing == 0 || ledger.is_open(window.key) {
                continue;
            }
            let cells = area.cells_nearest_first(&window, missing);
            if let Some(ticket) = ledger.claim(window.key, cells.len()) {
                return Some(Batch {
                    key: window.key,
                    cells,
                    ticket,
                });
            }
        }
        None
    }

    /// Cells within the square of `radius` around `center` that are not completed. In-flight
    /// cells still count as missing.
    pub fn count_missing_in_range(&self, center: CellCoord, radius: i32) -> u64 {
        let area = ScanArea::new(center, radius);
        let buckets = self.read();
        area.windows()
            .map(|w: BucketWindow| {
                let completed = buckets.get(&w.key).map_or(0, |b| b.completed);
                u64::from((w.mask & !completed).count_ones())
            })
            .sum()
    }

    /// Appends to `out` up to `limit` completed cells near `center` that are missing from
    /// `delivered`, nearest first. Returns how many were appended.
    pub fn collect_completed_in_range(
        &self,
        center: CellCoord,
        radius: i32,
        delivered: &KeySet,
        out: &mut Vec<CellCoord>,
        limit: usize,
    ) -> usize {
        if limit == 0 {
            return 0;
        }
        let area = ScanArea::new(center, radius);
        let buckets = self.read();
        let mut found: Vec<(i64, CellCoord)> = Vec::new();
        let mut cutoff = i64::MAX;
        delivered.with(|delivered| {
            for window in area.windows_by_distance() {
                if found.len() >= limit && window.min_dist_sq > cutoff {
                    break;
                }
                let completed = buckets.get(&window.key).map_or(0, |b| b.completed) & window.mask;
                if completed == 0 {
                    continue;
                }
                for cell in area.cells_nearest_first(&window, completed) {
                    if !delivered.contains(&cell.key()) {
                        found.push((cell.distance_sq(center), cell));
                    }
                }
                if found.len() >= limit {
                    found.sort_by_key(|&(d, c)| (d, c.z, c.x));
                    found.truncate(limit);
                    cutoff = found[limit - 1].0;
                }
            }
        });
        found.sort_by_key(|&(d, c)| (d, c.z, c.x));
        found.truncate(limit);
        let n = found.len();
        out.extend(found.into_iter().map(|(_, c)| c));
        n
    }
}
