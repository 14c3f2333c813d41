use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hashbrown::HashSet;
use pregen_io::{RosterStore, SchedulerConfig, StaticConfig, TomlConfigFile};
use pregen_runtime::{
    CellCompletion, GenerationBackend, GenerationScheduler, HostHandle, OutputSink,
    SchedulerError, ViewerTracker,
};
use pregen_world::{CellCoord, KeySet, PartitionId, ViewerId};

#[derive(Default)]
struct TestWorld {
    present: Mutex<HashSet<CellCoord>>,
    hold: AtomicBool,
    held: Mutex<Vec<CellCompletion<u32>>>,
    generate_calls: AtomicUsize,
    live_leases: Mutex<HashSet<CellCoord>>,
}

impl TestWorld {
    fn release_held(&self) -> usize {
        let held: Vec<_> = self.held.lock().unwrap().drain(..).collect();
        let n = held.len();
        for done in held {
            let cell = done.cell();
            self.present.lock().unwrap().insert(cell);
            done.succeed(1);
        }
        n
    }
}

impl GenerationBackend for TestWorld {
    type Artifact = u32;

    fn existing(&self, _: &PartitionId, cell: CellCoord) -> Option<u32> {
        self.present.lock().unwrap().contains(&cell).then_some(0)
    }

    fn add_lease(&self, _: &PartitionId, cell: CellCoord) {
        assert!(self.live_leases.lock().unwrap().insert(cell), "double lease");
    }

    fn remove_lease(&self, _: &PartitionId, cell: CellCoord) {
        assert!(self.live_leases.lock().unwrap().remove(&cell), "unknown lease");
    }

    fn settle(&self, _: &PartitionId) {}

    fn generate(&self, _: &PartitionId, cell: CellCoord, done: CellCompletion<u32>) {
        self.generate_calls.fetch_add(1, Ordering::Relaxed);
        if self.hold.load(Ordering::Acquire) {
            self.held.lock().unwrap().push(done);
            return;
        }
        self.present.lock().unwrap().insert(cell);
        done.succeed(1);
    }
}

#[derive(Default)]
struct Sink {
    published: Mutex<Vec<CellCoord>>,
    delivered: Mutex<Vec<(ViewerId, CellCoord)>>,
}

impl OutputSink<u32> for Sink {
    fn publish(&self, _: &PartitionId, cell: CellCoord, _: &u32) {
        self.published.lock().unwrap().push(cell);
    }

    fn deliver(&self, viewer: ViewerId, _: &PartitionId, cell: CellCoord, _: &u32) {
        self.delivered.lock().unwrap().push((viewer, cell));
    }
}

struct Harness {
    scheduler: GenerationScheduler<TestWorld>,
    config: Arc<StaticConfig>,
    world: Arc<TestWorld>,
    sink: Arc<Sink>,
    viewers: Arc<ViewerTracker>,
    store: RosterStore,
}

impl Harness {
    fn new(dir: &std::path::Path, config: SchedulerConfig) -> Self {
        let config = Arc::new(StaticConfig::new(config));
        let store = RosterStore::new(dir);
        Self {
            scheduler: GenerationScheduler::new(config.clone(), store.clone()),
            config,
            world: Arc::new(TestWorld::default()),
            sink: Arc::new(Sink::default()),
            viewers: Arc::new(ViewerTracker::new()),
            store,
        }
    }

    fn start(&self) {
        let host = HostHandle::new(Arc::clone(&self.world), Arc::clone(&self.viewers))
            .with_sink(self.sink.clone());
        self.scheduler.start(host).unwrap();
    }

    /// Ticks like a host would until `cond` holds or five seconds pass.
    fn tick_until(&self, mut cond: impl FnMut(&Self) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            self.scheduler.tick();
            if cond(self) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    fn tick_for(&self, period: Duration, mut each: impl FnMut(&Self)) {
        let deadline = Instant::now() + period;
        while Instant::now() < deadline {
            self.scheduler.tick();
            each(self);
            std::thread::sleep(Duration::from_millis(2));
        }
    }
}

fn config(radius: i32, tasks: usize) -> SchedulerConfig {
    SchedulerConfig {
        generation_radius: radius,
        max_active_tasks: tasks,
        ..SchedulerConfig::default()
    }
}

fn overworld() -> PartitionId {
    PartitionId::new("overworld")
}

#[test]
fn generates_everything_around_a_viewer_once() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path(), config(2, 4));
    h.viewers.join(ViewerId(1), overworld(), CellCoord::new(0, 0));
    h.start();

    assert!(h.tick_until(|h| h.scheduler.stats().completed == 25));
    assert!(h.tick_until(|h| h.scheduler.remaining_in_radius() == 0));
    assert_eq!(h.scheduler.completed_in_partition(&overworld()), 25);
    assert_eq!(h.world.generate_calls.load(Ordering::Relaxed), 25);

    let published = h.sink.published.lock().unwrap().clone();
    let unique: HashSet<_> = published.iter().copied().collect();
    assert_eq!(published.len(), 25);
    assert_eq!(unique.len(), 25);
    assert!(unique.iter().all(|c| c.x.abs() <= 2 && c.z.abs() <= 2));

    assert!(h.tick_until(|h| h.scheduler.active_task_count() == 0));
    // releases queued by the last completions land on the next tick
    h.scheduler.tick();
    assert!(h.world.live_leases.lock().unwrap().is_empty());
    h.scheduler.shutdown();
}

#[test]
fn shutdown_without_start_is_harmless() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path(), config(2, 1));
    h.scheduler.shutdown();
    h.scheduler.shutdown();
    h.scheduler.tick();
    assert!(!h.scheduler.is_running());
    assert_eq!(h.scheduler.active_task_count(), 0);
    assert_eq!(h.scheduler.remaining_in_radius(), 0);
}

#[test]
fn config_file_is_only_read_on_start() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pregen.toml");
    let scheduler: GenerationScheduler<TestWorld> = GenerationScheduler::new(
        Arc::new(TomlConfigFile::new(&path)),
        RosterStore::new(dir.path().join("rosters")),
    );
    assert!(!path.exists());

    let host = HostHandle::new(Arc::new(TestWorld::default()), Arc::new(ViewerTracker::new()));
    scheduler.start(host).unwrap();
    assert!(path.exists());
    scheduler.shutdown();
}

#[test]
fn starting_twice_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path(), config(1, 1));
    h.start();
    let host = HostHandle::new(Arc::clone(&h.world), Arc::clone(&h.viewers));
    assert!(matches!(
        h.scheduler.start(host),
        Err(SchedulerError::AlreadyRunning)
    ));
    h.scheduler.shutdown();
    assert!(!h.scheduler.is_running());
    h.start();
    assert!(h.scheduler.is_running());
}

#[test]
fn progress_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let h = Harness::new(dir.path(), config(1, 2));
        h.viewers.join(ViewerId(1), overworld(), CellCoord::new(10, 10));
        h.start();
        assert!(h.tick_until(|h| h.scheduler.stats().completed == 9));
        h.scheduler.shutdown();
        assert_eq!(h.scheduler.stats().completed, 0);
        assert!(h.store.path_for(&overworld()).exists());
    }

    let h = Harness::new(dir.path(), config(1, 2));
    h.viewers.join(ViewerId(1), overworld(), CellCoord::new(10, 10));
    h.start();
    assert!(h.tick_until(|h| h.scheduler.completed_in_partition(&overworld()) == 9));
    h.tick_for(Duration::from_millis(200), |_| {});
    assert_eq!(h.world.generate_calls.load(Ordering::Relaxed), 0);
    assert_eq!(h.scheduler.remaining_in_radius(), 0);
}

#[test]
fn lowering_the_limit_bounds_new_admissions() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path(), config(8, 4));
    h.world.hold.store(true, Ordering::Release);
    h.viewers.join(ViewerId(1), overworld(), CellCoord::new(0, 0));
    h.start();

    assert!(h.tick_until(|h| h.world.held.lock().unwrap().len() == 4));
    assert_eq!(h.scheduler.active_task_count(), 4);

    h.config.set(config(8, 1));
    h.scheduler.schedule_config_reload();
    h.scheduler.tick();
    assert_eq!(h.world.release_held(), 4);

    let mut peak = 0;
    h.tick_for(Duration::from_millis(300), |h| {
        peak = peak.max(h.scheduler.active_task_count());
        h.world.release_held();
    });
    assert!(peak <= 1, "peak {peak}");
    assert!(h.scheduler.stats().completed > 4);
    h.scheduler.shutdown();
}

#[test]
fn unresolved_cells_never_exceed_the_limit() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path(), config(8, 3));
    h.world.hold.store(true, Ordering::Release);
    h.viewers.join(ViewerId(1), overworld(), CellCoord::new(0, 0));
    h.start();

    let mut peak = 0;
    h.tick_for(Duration::from_millis(300), |h| {
        peak = peak.max(h.scheduler.active_task_count());
    });
    assert_eq!(peak, 3);
    assert_eq!(h.scheduler.available_permits(), 0);
    assert_eq!(h.world.held.lock().unwrap().len(), 3);

    h.scheduler.shutdown();
    // the roster holds only what actually finished
    let saved = KeySet::new();
    assert_eq!(h.store.load(&overworld(), &saved), 0);
}

#[test]
fn pause_check_holds_generation() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path(), config(1, 2));
    let paused = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&paused);
    h.scheduler.set_pause_check(move || flag.load(Ordering::Acquire));
    h.viewers.join(ViewerId(1), overworld(), CellCoord::new(0, 0));
    h.start();

    h.tick_for(Duration::from_millis(300), |_| {});
    assert_eq!(h.scheduler.stats().queued, 0);

    paused.store(false, Ordering::Release);
    assert!(h.tick_until(|h| h.scheduler.stats().completed == 9));
}

#[test]
fn slow_host_is_throttled() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path(), config(1, 2));
    h.start();
    let mut now = Instant::now();
    for _ in 0..45 {
        now += Duration::from_millis(200);
        h.scheduler.tick_at(now);
    }
    assert!(h.scheduler.is_throttled());

    h.viewers.join(ViewerId(1), overworld(), CellCoord::new(0, 0));
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(h.scheduler.stats().queued, 0);
}

#[test]
fn catch_up_resends_restored_cells() {
    let dir = tempfile::tempdir().unwrap();
    let store = RosterStore::new(dir.path());
    let done: KeySet = [CellCoord::new(0, 0), CellCoord::new(0, 1)]
        .into_iter()
        .map(|c| c.key())
        .collect();
    store.save(&overworld(), &done).unwrap();

    let h = Harness::new(dir.path(), config(0, 1));
    h.world.present.lock().unwrap().extend([CellCoord::new(0, 0), CellCoord::new(0, 1)]);
    h.viewers.join(ViewerId(7), overworld(), CellCoord::new(0, 1));
    h.start();

    assert!(h.tick_until(|h| !h.sink.delivered.lock().unwrap().is_empty()));
    assert_eq!(
        *h.sink.delivered.lock().unwrap(),
        vec![(ViewerId(7), CellCoord::new(0, 1))]
    );
    assert_eq!(h.world.generate_calls.load(Ordering::Relaxed), 0);
}

#[test]
fn dirty_cells_are_republished() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(
        dir.path(),
        SchedulerConfig {
            dirty_flush_interval_ms: 0,
            ..config(0, 1)
        },
    );
    h.viewers.join(ViewerId(1), overworld(), CellCoord::new(3, 3));
    h.start();
    assert!(h.tick_until(|h| h.scheduler.stats().completed == 1));
    assert_eq!(h.sink.published.lock().unwrap().len(), 1);

    h.scheduler.mark_dirty(&overworld(), CellCoord::new(3, 3));
    // never generated, ignored
    h.scheduler.mark_dirty(&overworld(), CellCoord::new(50, 50));
    h.scheduler.tick();
    assert_eq!(
        *h.sink.published.lock().unwrap(),
        vec![CellCoord::new(3, 3), CellCoord::new(3, 3)]
    );
}
