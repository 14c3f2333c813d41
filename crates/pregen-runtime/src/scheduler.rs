use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{Sender, bounded};
use hashbrown::{HashMap, HashSet};
use pregen_io::{ConfigSource, RosterStore, SchedulerConfig};
use pregen_world::{CellCoord, PartitionId, ViewerId, ViewerPosition};
use thiserror::Error;

use crate::health::HostHealthMonitor;
use crate::host::{GenerationBackend, HostHandle};
use crate::stats::{GenerationStats, StatsSnapshot};
use crate::worker::{self, PauseHook, Shared};

/// Viewers closer than this (squared cells) to where the last rescan saw them don't
/// trigger another one.
const MOVE_RESCAN_DIST_SQ: i64 = 4;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler is already running")]
    AlreadyRunning,
    #[error("failed to spawn generation worker: {0}")]
    WorkerSpawn(#[from] std::io::Error),
}

struct WorkerHandle {
    shutdown_tx: Sender<()>,
    thread: JoinHandle<()>,
}

/// Mutation-thread bookkeeping between ticks.
#[derive(Default)]
struct TickState {
    last_seen: HashMap<ViewerId, (PartitionId, CellCoord)>,
    primary: Option<PartitionId>,
    last_checkpoint: Option<Instant>,
    ticks: u64,
}

/// Generates the world around viewers in the background.
///
/// The host calls [`start`](Self::start) once, [`tick`](Self::tick) from its mutation thread
/// every host tick, and [`shutdown`](Self::shutdown) on exit. A single worker thread picks
/// the next cells; all host world access happens inside `tick`.
pub struct GenerationScheduler<B: GenerationBackend> {
    config_source: Arc<dyn ConfigSource>,
    store: RosterStore,
    stats: Arc<GenerationStats>,
    health: Arc<HostHealthMonitor>,
    pause: Arc<PauseHook>,
    reload_requested: AtomicBool,
    shared: RwLock<Option<Arc<Shared<B>>>>,
    worker: Mutex<Option<WorkerHandle>>,
    tick_state: Mutex<TickState>,
}

impl<B: GenerationBackend> GenerationScheduler<B> {
    /// The configuration is not read until [`start`](Self::start).
    pub fn new(config_source: Arc<dyn ConfigSource>, store: RosterStore) -> Self {
        let cfg = SchedulerConfig::default();
        Self {
            config_source,
            store,
            stats: Arc::new(GenerationStats::new()),
            health: Arc::new(HostHealthMonitor::new(
                cfg.health_window,
                cfg.min_healthy_tps,
                cfg.target_tps,
            )),
            pause: Arc::new(PauseHook::default()),
            reload_requested: AtomicBool::new(false),
            shared: RwLock::new(None),
            worker: Mutex::new(None),
            tick_state: Mutex::new(TickState::default()),
        }
    }

    fn shared(&self) -> Option<Arc<Shared<B>>> {
        self.shared
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn tick_state(&self) -> std::sync::MutexGuard<'_, TickState> {
        self.tick_state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Reads the configuration, starts the worker thread and begins generating.
    pub fn start(&self, host: HostHandle<B>) -> Result<(), SchedulerError> {
        let mut worker = self.worker.lock().unwrap_or_else(|p| p.into_inner());
        if worker.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }
        let cfg = self.config_source.load();
        self.health
            .configure(cfg.health_window, cfg.min_healthy_tps, cfg.target_tps);
        self.health.reset();
        self.reload_requested.store(false, Ordering::Release);
        *self.tick_state() = TickState::default();

        let shared = Arc::new(Shared::new(
            host,
            cfg.clone(),
            Arc::clone(&self.stats),
            Arc::clone(&self.health),
            self.store.clone(),
            Arc::clone(&self.pause),
        ));
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let for_worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("pregen-worker".into())
            .spawn(move || worker::run(for_worker, shutdown_rx))?;

        let fast_threads = shared.fast_threads();
        *self.shared.write().unwrap_or_else(|p| p.into_inner()) = Some(shared);
        *worker = Some(WorkerHandle {
            shutdown_tx,
            thread,
        });
        log::info!(
            "generation scheduler started (radius {}, {} concurrent tasks, {} fast threads, enabled: {})",
            cfg.generation_radius,
            cfg.max_active_tasks,
            fast_threads,
            cfg.enabled
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared().is_some()
    }

    /// Stops the worker, waits for it, saves every loaded partition and resets all runtime
    /// state. Safe to call when never started.
    pub fn shutdown(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(WorkerHandle {
            shutdown_tx,
            thread,
        }) = worker
        {
            drop(shutdown_tx);
            if thread.join().is_err() {
                log::error!("generation worker exited with a panic");
            }
        }

        let shared = self
            .shared
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(shared) = shared {
            let dropped = shared.discard_main_tasks();
            if dropped > 0 {
                log::debug!("dropped {} queued tasks on shutdown", dropped);
            }
            shared.apply_leases();
            shared.persist_all();
            shared.partitions.clear();
            log::info!("generation scheduler stopped");
        }

        self.stats.reset();
        self.health.reset();
        *self.tick_state() = TickState::default();
        self.reload_requested.store(false, Ordering::Release);
    }

    /// Re-read the configuration at the start of the next tick.
    pub fn schedule_config_reload(&self) {
        self.reload_requested.store(true, Ordering::Release);
    }

    /// Generation pauses while `check` returns `true`.
    pub fn set_pause_check(&self, check: impl Fn() -> bool + Send + Sync + 'static) {
        self.pause.set(Box::new(check));
    }

    pub fn clear_pause_check(&self) {
        self.pause.clear();
    }

    /// Flags a generated cell as changed so the next flush republishes it.
    pub fn mark_dirty(&self, partition: &PartitionId, cell: CellCoord) {
        let Some(shared) = self.shared() else {
            return;
        };
        if let Some(state) = shared.partitions.get(partition) {
            if state.completed.contains(cell.key()) {
                state.dirty.insert(cell.key());
            }
        }
    }

    /// Host heartbeat. Must be called from the mutation thread; this is where leases are
    /// applied, generation is started and results are flushed.
    pub fn tick(&self) {
        self.tick_at(Instant::now());
    }

    pub fn tick_at(&self, now: Instant) {
        let Some(shared) = self.shared() else {
            return;
        };

        shared.apply_leases();
        shared.run_main_tasks();

        let mut forced_rescan = false;
        if self.reload_requested.swap(false, Ordering::AcqRel) {
            let cfg = self.config_source.load();
            let old = shared.book.throttle.capacity();
            self.health
                .configure(cfg.health_window, cfg.min_healthy_tps, cfg.target_tps);
            log::info!(
                "reloaded generation config: capacity {} -> {}, radius {}",
                old,
                cfg.max_active_tasks,
                cfg.generation_radius
            );
            shared.set_config(cfg);
            forced_rescan = true;
        }

        self.health.tick_at(now);
        self.stats.tick_at(now);

        let cfg = shared.config();
        let viewers = shared.host.viewers.snapshot();
        let mut state = self.tick_state();
        state.ticks += 1;
        if cfg.queue_update_interval > 0 && state.ticks % u64::from(cfg.queue_update_interval) == 0
        {
            forced_rescan = true;
        }

        let mut touched: HashSet<PartitionId> = HashSet::new();
        track_movement(&mut state.last_seen, &viewers, &mut touched);

        let primary = primary_partition(&viewers);
        if primary != state.primary {
            if let Some(old) = state.primary.take() {
                if let Some(outgoing) = shared.partitions.get(&old) {
                    log::info!("primary partition changed from {}; saving it", old);
                    outgoing.persist(&shared.store);
                }
            }
            state.primary = primary;
            forced_rescan = true;
        }

        if forced_rescan {
            shared.rescan(&viewers, None);
        } else if !touched.is_empty() {
            shared.rescan(&viewers, Some(&touched));
        }

        shared.flush_dirty(&viewers, now);

        if let Some(every) = cfg.checkpoint_interval() {
            match state.last_checkpoint {
                None => state.last_checkpoint = Some(now),
                Some(last) if now.saturating_duration_since(last) >= every => {
                    log::info!("checkpointing generation progress");
                    shared.persist_all();
                    state.last_checkpoint = Some(now);
                }
                Some(_) => {}
            }
        }
    }

    pub fn active_task_count(&self) -> usize {
        self.shared().map_or(0, |s| s.book.active_tasks())
    }

    /// Cells still missing around viewers, summed over partitions.
    pub fn remaining_in_radius(&self) -> u64 {
        self.shared().map_or(0, |s| {
            s.partitions
                .all()
                .iter()
                .map(|p| p.remaining_in_radius())
                .sum()
        })
    }

    pub fn remaining_in_partition(&self, partition: &PartitionId) -> u64 {
        self.shared()
            .and_then(|s| s.partitions.get(partition))
            .map_or(0, |p| p.remaining_in_radius())
    }

    pub fn completed_in_partition(&self, partition: &PartitionId) -> usize {
        self.shared()
            .and_then(|s| s.partitions.get(partition))
            .map_or(0, |p| p.completed.len())
    }

    /// Tasks waiting for the next tick.
    pub fn queued_for_tick(&self) -> usize {
        self.shared().map_or(0, |s| s.pending_main_tasks())
    }

    pub fn available_permits(&self) -> usize {
        self.shared().map_or(0, |s| s.book.throttle.available())
    }

    pub fn is_throttled(&self) -> bool {
        self.health.is_throttled()
    }

    pub fn average_tps(&self) -> Option<f32> {
        self.health.average_tps()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl<B: GenerationBackend> Drop for GenerationScheduler<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Updates `last_seen` from the current viewers and collects partitions whose viewers
/// appeared, left, switched partition or moved far enough.
fn track_movement(
    last_seen: &mut HashMap<ViewerId, (PartitionId, CellCoord)>,
    viewers: &[ViewerPosition],
    touched: &mut HashSet<PartitionId>,
) {
    for v in viewers {
        match last_seen.get_mut(&v.id) {
            Some((partition, cell)) if *partition != v.partition => {
                touched.insert(partition.clone());
                touched.insert(v.partition.clone());
                *partition = v.partition.clone();
                *cell = v.cell;
            }
            Some((_, cell)) => {
                if cell.distance_sq(v.cell) >= MOVE_RESCAN_DIST_SQ {
                    touched.insert(v.partition.clone());
                    *cell = v.cell;
                }
            }
            None => {
                touched.insert(v.partition.clone());
                last_seen.insert(v.id, (v.partition.clone(), v.cell));
            }
        }
    }
    let present: HashSet<ViewerId> = viewers.iter().map(|v| v.id).collect();
    last_seen.retain(|id, (partition, _)| {
        let keep = present.contains(id);
        if !keep {
            touched.insert(partition.clone());
        }
        keep
    });
}

/// Partition holding the most viewers; ties go to the smallest id.
fn primary_partition(viewers: &[ViewerPosition]) -> Option<PartitionId> {
    let mut counts: HashMap<&PartitionId, usize> = HashMap::new();
    for v in viewers {
        *counts.entry(&v.partition).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by(|(a, na), (b, nb)| na.cmp(nb).then_with(|| b.cmp(a)))
        .map(|(id, _)| id.clone())
}
