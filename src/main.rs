//! Runs the generation scheduler against a simulated host world.

mod sim;

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};
use std::time::{Duration, Instant};

use clap::Parser;
use pregen_io::{RosterStore, TomlConfigFile};
use pregen_runtime::{GenerationScheduler, HostHandle, ViewerTracker};
use pregen_world::PartitionId;

use crate::sim::{LogSink, SimulatedWorld, Walkers};

#[derive(Parser, Debug)]
#[command(name = "pregen", about = "Generate the world around simulated viewers in the background")]
struct Cli {
    /// Scheduler config; created with machine-scaled defaults if missing
    #[arg(long, default_value = "pregen.toml")]
    config: PathBuf,
    /// Where completion rosters are kept
    #[arg(long, default_value = "pregen-data")]
    data_dir: PathBuf,
    /// Host ticks to simulate
    #[arg(long, default_value_t = 1200)]
    ticks: u64,
    #[arg(long, default_value_t = 2)]
    viewers: u64,
    /// Host tick rate
    #[arg(long, default_value_t = 20.0)]
    tps: f32,
    /// Partition to place viewers in; repeat for several
    #[arg(long = "partition", default_value = "overworld")]
    partitions: Vec<String>,
    /// Ticks between a generation request and its result
    #[arg(long, default_value_t = 2)]
    generation_delay: u64,
    /// Fail every Nth generation (0 = never)
    #[arg(long, default_value_t = 0)]
    fail_every: u64,
    /// Ticks between viewer steps
    #[arg(long, default_value_t = 20)]
    walk_every: u64,
    /// Viewer steps between partition hops of the first viewer
    #[arg(long, default_value_t = 30)]
    hop_every: u64,
    /// Don't reload the config when the file changes
    #[arg(long)]
    no_watch: bool,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        log::error!("{e}");
        std::process::exit(1);
    }
}

fn watch_config(path: &Path) -> Option<(notify::RecommendedWatcher, Receiver<()>)> {
    use notify::{EventKind, RecursiveMode, Watcher};

    let (tx, rx) = mpsc::channel::<()>();
    let mut watcher =
        match notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
            if let Ok(event) = res {
                match event.kind {
                    EventKind::Modify(_) | EventKind::Create(_) | EventKind::Any => {
                        let _ = tx.send(());
                    }
                    _ => {}
                }
            }
        }) {
            Ok(w) => w,
            Err(e) => {
                log::warn!("config watcher unavailable: {e}");
                return None;
            }
        };
    if let Err(e) = watcher.watch(path, RecursiveMode::NonRecursive) {
        log::warn!("cannot watch {:?}: {}", path, e);
        return None;
    }
    Some((watcher, rx))
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let config = Arc::new(TomlConfigFile::new(&cli.config));
    let scheduler = GenerationScheduler::new(config, RosterStore::new(&cli.data_dir));

    let world = Arc::new(SimulatedWorld::new(cli.generation_delay, cli.fail_every));
    let sink = Arc::new(LogSink::default());
    let viewers = Arc::new(ViewerTracker::new());
    let partitions: Vec<PartitionId> = cli.partitions.iter().map(PartitionId::new).collect();
    let mut walkers = Walkers::new(cli.viewers, partitions, cli.hop_every);
    walkers.join_all(&viewers);

    scheduler.start(
        HostHandle::new(Arc::clone(&world), Arc::clone(&viewers)).with_sink(sink.clone()),
    )?;
    // start wrote the config file if it was missing; watch it for edits
    let watch = if cli.no_watch {
        None
    } else {
        watch_config(&cli.config)
    };

    let period = Duration::from_secs_f32(1.0 / cli.tps.max(1.0));
    let status_every = (cli.tps.max(1.0) as u64) * 5;
    let started = Instant::now();
    for tick in 1..=cli.ticks {
        let tick_start = Instant::now();
        if let Some((_, rx)) = &watch {
            if rx.try_iter().count() > 0 {
                log::info!("{:?} changed; reloading on next tick", cli.config);
                scheduler.schedule_config_reload();
            }
        }

        world.advance();
        scheduler.tick();

        if cli.walk_every > 0 && tick % cli.walk_every == 0 {
            walkers.step(&viewers);
        }
        if tick % status_every == 0 {
            let s = scheduler.stats();
            log::info!(
                "tick {}: generated {} ({:.1}/s), failed {}, skipped {}, active {}, remaining {}{}",
                tick,
                s.completed,
                s.per_second,
                s.failed,
                s.skipped,
                scheduler.active_task_count(),
                scheduler.remaining_in_radius(),
                if scheduler.is_throttled() { ", throttled" } else { "" }
            );
        }

        std::thread::sleep(period.saturating_sub(tick_start.elapsed()));
    }

    let s = scheduler.stats();
    walkers.leave_all(&viewers);
    scheduler.shutdown();
    log::info!(
        "done after {:.1?}: {} generated, {} failed, {} published, {} caught up, {} cells held by the world, {} leases left",
        started.elapsed(),
        s.completed,
        s.failed,
        sink.published(),
        sink.delivered(),
        world.generated_count(),
        world.live_leases()
    );
    Ok(())
}
