//! Simulated host world: generation that completes a few ticks after it is requested,
//! a logging sink, and viewers wandering across the map.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use pregen_runtime::{
    CellCompletion, GenerationBackend, GenerationError, OutputSink, ViewerTracker,
};
use pregen_world::{CellCoord, CellKey, PartitionId, ViewerId};

/// What the simulated world produces per cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Terrain {
    pub height: i32,
}

impl Terrain {
    fn at(cell: CellCoord) -> Self {
        let h = (i64::from(cell.x) * 73_856_093) ^ (i64::from(cell.z) * 19_349_663);
        Self {
            height: 32 + h.rem_euclid(64) as i32,
        }
    }
}

struct Pending {
    due: u64,
    done: CellCompletion<Terrain>,
}

pub struct SimulatedWorld {
    delay_ticks: u64,
    fail_every: u64,
    now: AtomicU64,
    requests: AtomicU64,
    pending: Mutex<Vec<Pending>>,
    generated: Mutex<HashMap<(PartitionId, CellKey), Terrain>>,
    leases: Mutex<HashMap<(PartitionId, CellKey), u32>>,
}

impl SimulatedWorld {
    /// `fail_every` of 0 never fails.
    pub fn new(delay_ticks: u64, fail_every: u64) -> Self {
        Self {
            delay_ticks,
            fail_every,
            now: AtomicU64::new(0),
            requests: AtomicU64::new(0),
            pending: Mutex::new(Vec::new()),
            generated: Mutex::new(HashMap::new()),
            leases: Mutex::new(HashMap::new()),
        }
    }

    /// Advances the world clock one tick and finishes every request that came due.
    pub fn advance(&self) -> usize {
        let now = self.now.fetch_add(1, Ordering::AcqRel) + 1;
        let due: Vec<Pending> = {
            let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
            let (due, waiting) = pending.drain(..).partition(|p| p.due <= now);
            *pending = waiting;
            due
        };
        let n = due.len();
        for Pending { done, .. } in due {
            let partition = done.partition().clone();
            let cell = done.cell();
            let request = self.requests.fetch_add(1, Ordering::AcqRel) + 1;
            if self.fail_every > 0 && request % self.fail_every == 0 {
                done.fail(GenerationError::Failed(format!("simulated failure at {cell:?}")));
                continue;
            }
            let terrain = Terrain::at(cell);
            self.generated
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .insert((partition, cell.key()), terrain);
            done.succeed(terrain);
        }
        n
    }

    pub fn generated_count(&self) -> usize {
        self.generated
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    pub fn live_leases(&self) -> usize {
        self.leases.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

impl GenerationBackend for SimulatedWorld {
    type Artifact = Terrain;

    fn existing(&self, partition: &PartitionId, cell: CellCoord) -> Option<Terrain> {
        self.generated
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&(partition.clone(), cell.key()))
            .copied()
    }

    fn add_lease(&self, partition: &PartitionId, cell: CellCoord) {
        *self
            .leases
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry((partition.clone(), cell.key()))
            .or_insert(0) += 1;
    }

    fn remove_lease(&self, partition: &PartitionId, cell: CellCoord) {
        let mut leases = self.leases.lock().unwrap_or_else(|p| p.into_inner());
        let key = (partition.clone(), cell.key());
        match leases.get_mut(&key) {
            Some(n) if *n > 1 => *n -= 1,
            Some(_) => {
                leases.remove(&key);
            }
            None => log::warn!("lease on {:?} in {} released twice", cell, partition),
        }
    }

    fn settle(&self, partition: &PartitionId) {
        log::trace!("{} settled with {} live leases", partition, self.live_leases());
    }

    fn generate(&self, _: &PartitionId, _: CellCoord, done: CellCompletion<Terrain>) {
        let due = self.now.load(Ordering::Acquire) + self.delay_ticks;
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(Pending { due, done });
    }
}

#[derive(Default)]
pub struct LogSink {
    published: AtomicU64,
    delivered: AtomicU64,
}

impl LogSink {
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

impl OutputSink<Terrain> for LogSink {
    fn publish(&self, partition: &PartitionId, cell: CellCoord, artifact: &Terrain) {
        self.published.fetch_add(1, Ordering::Relaxed);
        log::trace!("{} {:?}: height {}", partition, cell, artifact.height);
    }

    fn deliver(&self, viewer: ViewerId, partition: &PartitionId, cell: CellCoord, _: &Terrain) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        log::trace!("sent {:?} in {} to {}", cell, partition, viewer);
    }
}

const HEADINGS: [(i32, i32); 4] = [(1, 0), (0, 1), (-1, 0), (0, -1)];

struct Walker {
    id: ViewerId,
    partition: usize,
    cell: CellCoord,
    heading: (i32, i32),
}

/// Viewers walking in straight lines, one cell per step. The first walker hops to the next
/// partition every `hop_every` steps.
pub struct Walkers {
    partitions: Vec<PartitionId>,
    walkers: Vec<Walker>,
    steps: u64,
    hop_every: u64,
}

impl Walkers {
    pub fn new(count: u64, partitions: Vec<PartitionId>, hop_every: u64) -> Self {
        let walkers = (0..count)
            .map(|i| {
                let spread = i32::try_from(i).unwrap_or(i32::MAX).saturating_mul(256);
                Walker {
                    id: ViewerId(i + 1),
                    partition: i as usize % partitions.len().max(1),
                    cell: CellCoord::new(spread, -spread),
                    heading: HEADINGS[i as usize % HEADINGS.len()],
                }
            })
            .collect();
        Self {
            partitions,
            walkers,
            steps: 0,
            hop_every,
        }
    }

    pub fn join_all(&self, tracker: &ViewerTracker) {
        for w in &self.walkers {
            tracker.join(w.id, self.partitions[w.partition].clone(), w.cell);
        }
    }

    pub fn step(&mut self, tracker: &ViewerTracker) {
        self.steps += 1;
        let hop = self.partitions.len() > 1
            && self.hop_every > 0
            && self.steps % self.hop_every == 0;
        for (i, w) in self.walkers.iter_mut().enumerate() {
            w.cell = w.cell.offset(w.heading.0, w.heading.1);
            if hop && i == 0 {
                w.partition = (w.partition + 1) % self.partitions.len();
                log::info!("{} moved to {}", w.id, self.partitions[w.partition]);
            }
            tracker.update(w.id, self.partitions[w.partition].clone(), w.cell);
        }
    }

    pub fn leave_all(&self, tracker: &ViewerTracker) {
        for w in &self.walkers {
            tracker.leave(w.id);
        }
    }
}
