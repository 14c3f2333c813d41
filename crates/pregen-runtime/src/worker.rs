use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, unbounded};
use hashbrown::{HashMap, HashSet};
use pregen_index::Batch;
use pregen_io::{RosterStore, SchedulerConfig};
use pregen_world::{CellCoord, PartitionId, ViewerId, ViewerPosition};
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::health::HostHealthMonitor;
use crate::host::{GenerationBackend, GenerationError, HostHandle};
use crate::leases::LeaseChange;
use crate::partition::{PartitionMap, PartitionState};
use crate::resolve::{Bookkeeping, CellCompletion, CellTask, Outcome};
use crate::stats::GenerationStats;

const DISABLED_POLL: Duration = Duration::from_millis(100);
const PAUSED_POLL: Duration = Duration::from_millis(500);
const NO_VIEWERS_POLL: Duration = Duration::from_secs(1);
const IDLE_POLL: Duration = Duration::from_millis(100);
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Host-supplied predicate that pauses generation while it returns `true`.
#[derive(Default)]
pub(crate) struct PauseHook {
    check: RwLock<Option<Box<dyn Fn() -> bool + Send + Sync>>>,
}

impl PauseHook {
    pub fn set(&self, check: Box<dyn Fn() -> bool + Send + Sync>) {
        *self.check.write().unwrap_or_else(|p| p.into_inner()) = Some(check);
    }

    pub fn clear(&self) {
        *self.check.write().unwrap_or_else(|p| p.into_inner()) = None;
    }

    pub fn is_paused(&self) -> bool {
        self.check
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(|check| check())
    }
}

/// Work the worker hands to the mutation thread.
pub(crate) enum MainTask {
    Generate(CellTask),
    Deliver {
        viewer: ViewerId,
        state: Arc<PartitionState>,
        cells: Vec<CellCoord>,
    },
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Step {
    Busy,
    Idle(Duration),
    Stop,
}

/// State of one running scheduler, shared by the worker thread, the fast pool and the host
/// thread calling `tick`.
pub(crate) struct Shared<B: GenerationBackend> {
    pub host: HostHandle<B>,
    pub config: RwLock<SchedulerConfig>,
    pub book: Arc<Bookkeeping>,
    pub health: Arc<HostHealthMonitor>,
    pub partitions: PartitionMap,
    pub store: RosterStore,
    pub pause: Arc<PauseHook>,
    main_tx: Sender<MainTask>,
    main_rx: Receiver<MainTask>,
    fast_pool: Option<ThreadPool>,
}

impl<B: GenerationBackend> Shared<B> {
    pub fn new(
        host: HostHandle<B>,
        config: SchedulerConfig,
        stats: Arc<GenerationStats>,
        health: Arc<HostHealthMonitor>,
        store: RosterStore,
        pause: Arc<PauseHook>,
    ) -> Self {
        let (main_tx, main_rx) = unbounded();
        // sized from the machine; the throttle bounds how many cells run at once
        let fast_threads: usize = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let fast_pool = match ThreadPoolBuilder::new()
            .num_threads(fast_threads)
            .thread_name(|i| format!("pregen-fast-{i}"))
            .build()
        {
            Ok(pool) => Some(pool),
            Err(e) => {
                log::warn!("fast generation pool unavailable, using the mutation thread: {e}");
                None
            }
        };
        Self {
            host,
            book: Arc::new(Bookkeeping::new(stats, config.max_active_tasks)),
            config: RwLock::new(config),
            health,
            partitions: PartitionMap::default(),
            store,
            pause,
            main_tx,
            main_rx,
            fast_pool,
        }
    }

    pub fn config(&self) -> SchedulerConfig {
        self.config
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn set_config(&self, config: SchedulerConfig) {
        self.book.throttle.set_capacity(config.max_active_tasks);
        *self.config.write().unwrap_or_else(|p| p.into_inner()) = config;
    }

    pub fn partition(&self, id: &PartitionId) -> Arc<PartitionState> {
        self.partitions
            .get_or_load(id, &self.store, || self.host.fast.serves(id))
    }

    pub fn pending_main_tasks(&self) -> usize {
        self.main_rx.len()
    }

    /// Recomputes `remaining_in_radius` for the given partitions, or all of them. A partition
    /// holding several viewers reports the largest count among them.
    pub fn rescan(&self, viewers: &[ViewerPosition], only: Option<&HashSet<PartitionId>>) {
        let cfg = self.config();
        let wanted = |id: &PartitionId| only.is_none_or(|set| set.contains(id));
        let mut counts: HashMap<PartitionId, (Arc<PartitionState>, u64)> = HashMap::new();
        for v in viewers.iter().filter(|v| wanted(&v.partition)) {
            let state = self.partition(&v.partition);
            let n = state
                .index
                .count_missing_in_range(v.cell, cfg.radius_for(state.fast_mode));
            let entry = counts
                .entry(v.partition.clone())
                .or_insert_with(|| (state, 0));
            entry.1 = entry.1.max(n);
        }
        for state in self.partitions.all() {
            if !wanted(&state.id) {
                continue;
            }
            let n = counts.get(&state.id).map_or(0, |(_, n)| *n);
            state.set_remaining_in_radius(n);
        }
    }

    pub fn persist_all(&self) {
        for state in self.partitions.all() {
            state.persist(&self.store);
        }
    }

    /// One worker iteration.
    pub fn step(&self, shutdown: &Receiver<()>) -> Step {
        let cfg = self.config();
        if !cfg.enabled {
            return Step::Idle(DISABLED_POLL);
        }
        if self.health.is_throttled() || self.pause.is_paused() {
            return Step::Idle(PAUSED_POLL);
        }
        if self.main_rx.len() >= cfg.max_queue_size.max(1) {
            return Step::Idle(IDLE_POLL);
        }
        let viewers = self.host.viewers.snapshot();
        if viewers.is_empty() {
            return Step::Idle(NO_VIEWERS_POLL);
        }
        for v in &viewers {
            let state = self.partition(&v.partition);
            let radius = cfg.radius_for(state.fast_mode);
            if let Some(batch) = state.index.find_work(v.cell, radius, &state.batches) {
                if self.dispatch(&state, batch, &cfg, shutdown) {
                    return Step::Busy;
                }
                return Step::Stop;
            }
        }
        if self.catch_up(&viewers, &cfg) {
            return Step::Busy;
        }
        Step::Idle(IDLE_POLL)
    }

    /// Admits the cells of one claimed batch, nearest first. Returns `false` if shutdown
    /// interrupted it.
    pub fn dispatch(
        &self,
        state: &Arc<PartitionState>,
        batch: Batch,
        cfg: &SchedulerConfig,
        shutdown: &Receiver<()>,
    ) -> bool {
        let Batch { key, cells, ticket } = batch;
        let mut pending = Vec::with_capacity(cells.len());
        for cell in cells {
            let k = cell.key();
            if state.completed.contains(k) || state.tracked.contains(k) {
                self.book.skip(state, cell, &ticket);
            } else {
                pending.push(cell);
            }
        }

        let mut processed = 0;
        for &cell in &pending {
            if !self
                .book
                .throttle
                .acquire_timeout(cfg.acquire_timeout(), Some(shutdown))
            {
                break;
            }
            processed += 1;
            let Some(task) = self.book.admit(state, cell, &ticket) else {
                continue;
            };
            if state.fast_mode {
                self.spawn_fast(task);
            } else {
                let _ = self.main_tx.send(MainTask::Generate(task));
            }
        }

        if processed < pending.len() {
            state.batches.abandon(&ticket);
            log::trace!(
                "no permit within {:?}; released batch {:?} in {} after {}/{} cells",
                cfg.acquire_timeout(),
                key,
                state.id,
                processed,
                pending.len()
            );
            return !cancelled(shutdown);
        }
        true
    }

    fn spawn_fast(&self, task: CellTask) {
        let Some(pool) = &self.fast_pool else {
            let _ = self.main_tx.send(MainTask::Generate(task));
            return;
        };
        let fast = Arc::clone(&self.host.fast);
        let done = CellCompletion::new(
            task,
            Arc::clone(&self.host.sink),
            Arc::clone(&self.host.viewers),
        );
        pool.spawn(move || {
            let result =
                panic::catch_unwind(AssertUnwindSafe(|| fast.generate(done.partition(), done.cell())))
                    .unwrap_or(Err(GenerationError::Panicked));
            done.complete(result);
        });
    }

    /// Threads available to the fast backend, 0 when it runs on the mutation thread.
    pub fn fast_threads(&self) -> usize {
        self.fast_pool
            .as_ref()
            .map_or(0, |pool| pool.current_num_threads())
    }

    /// Queues completed cells a viewer has not been sent yet. They count as delivered while
    /// queued; cells the host no longer holds are unmarked again when the queue runs.
    pub fn catch_up(&self, viewers: &[ViewerPosition], cfg: &SchedulerConfig) -> bool {
        if cfg.catch_up_limit == 0 {
            return false;
        }
        for v in viewers {
            let Some(delivered) = self.host.viewers.delivered(v.id) else {
                continue;
            };
            let state = self.partition(&v.partition);
            let mut cells = Vec::new();
            state.index.collect_completed_in_range(
                v.cell,
                cfg.radius_for(state.fast_mode),
                &delivered,
                &mut cells,
                cfg.catch_up_limit,
            );
            if cells.is_empty() {
                continue;
            }
            delivered.extend(cells.iter().map(|c| c.key()));
            log::debug!(
                "catching up {} with {} cells in {}",
                v.id,
                cells.len(),
                state.id
            );
            let _ = self.main_tx.send(MainTask::Deliver {
                viewer: v.id,
                state,
                cells,
            });
            return true;
        }
        false
    }

    /// Applies queued lease changes, settling each touched partition once.
    pub fn apply_leases(&self) {
        let backend = &self.host.backend;
        for (partition, ops) in self.book.leases.drain_grouped() {
            for op in ops {
                match op.change {
                    LeaseChange::Add => backend.add_lease(&partition, op.cell),
                    LeaseChange::Remove => backend.remove_lease(&partition, op.cell),
                }
            }
            backend.settle(&partition);
        }
    }

    /// Runs the tasks queued for the mutation thread so far. Returns how many ran.
    pub fn run_main_tasks(&self) -> usize {
        let queued = self.main_rx.len();
        let mut to_generate = Vec::new();
        for task in self.main_rx.try_iter().take(queued) {
            match task {
                MainTask::Generate(mut task) => {
                    match self.host.backend.existing(task.partition(), task.cell()) {
                        Some(artifact) => {
                            self.host.publish(task.partition(), task.cell(), &artifact);
                            task.resolve(Outcome::Generated);
                        }
                        None => {
                            task.lease();
                            to_generate.push(task);
                        }
                    }
                }
                MainTask::Deliver {
                    viewer,
                    state,
                    cells,
                } => {
                    for cell in cells {
                        match self.host.backend.existing(&state.id, cell) {
                            Some(artifact) => {
                                self.host.sink.deliver(viewer, &state.id, cell, &artifact)
                            }
                            None => {
                                self.host.viewers.unmark_delivered(viewer, &state.id, cell);
                            }
                        }
                    }
                }
            }
        }
        if !to_generate.is_empty() {
            self.apply_leases();
            for task in to_generate {
                let partition = task.partition().clone();
                let cell = task.cell();
                let done = CellCompletion::new(
                    task,
                    Arc::clone(&self.host.sink),
                    Arc::clone(&self.host.viewers),
                );
                self.host.backend.generate(&partition, cell, done);
            }
        }
        queued
    }

    /// Republishes changed cells, at most once per flush interval per partition, for
    /// partitions somebody is viewing.
    pub fn flush_dirty(&self, viewers: &[ViewerPosition], now: Instant) {
        let interval = self.config().dirty_flush_interval();
        let viewed: HashSet<&PartitionId> = viewers.iter().map(|v| &v.partition).collect();
        for state in self.partitions.all() {
            if state.dirty.is_empty() || !viewed.contains(&state.id) {
                continue;
            }
            if !state.flush_due(now, interval) {
                continue;
            }
            let mut sent = 0usize;
            for key in state.dirty.drain() {
                let cell = key.coord();
                if let Some(artifact) = self.host.backend.existing(&state.id, cell) {
                    self.host.sink.publish(&state.id, cell, &artifact);
                    sent += 1;
                }
            }
            log::debug!("flushed {} changed cells in {}", sent, state.id);
        }
    }

    /// Drops whatever is still queued for the mutation thread; unstarted cells resolve as
    /// failures.
    pub fn discard_main_tasks(&self) -> usize {
        self.main_rx.try_iter().count()
    }
}

fn cancelled(shutdown: &Receiver<()>) -> bool {
    matches!(
        shutdown.try_recv(),
        Ok(()) | Err(TryRecvError::Disconnected)
    )
}

/// Sleeps for `pause` unless shutdown arrives first. Returns `false` on shutdown.
fn idle(shutdown: &Receiver<()>, pause: Duration) -> bool {
    matches!(shutdown.recv_timeout(pause), Err(RecvTimeoutError::Timeout))
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Worker thread body. Runs until `shutdown` yields or disconnects.
pub(crate) fn run<B: GenerationBackend>(shared: Arc<Shared<B>>, shutdown: Receiver<()>) {
    log::info!("generation worker started");
    loop {
        if cancelled(&shutdown) {
            break;
        }
        let pause = match panic::catch_unwind(AssertUnwindSafe(|| shared.step(&shutdown))) {
            Ok(Step::Busy) => continue,
            Ok(Step::Idle(pause)) => pause,
            Ok(Step::Stop) => break,
            Err(payload) => {
                log::error!(
                    "generation worker iteration panicked: {}",
                    panic_message(&*payload)
                );
                ERROR_BACKOFF
            }
        };
        if !idle(&shutdown, pause) {
            break;
        }
    }
    log::info!("generation worker stopped");
}
