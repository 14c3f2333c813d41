use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const HISTORY_SECONDS: usize = 10;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StatsSnapshot {
    pub queued: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    /// Completions per second averaged over the rolling history.
    pub per_second: f64,
}

#[derive(Debug)]
struct Rolling {
    history: [u64; HISTORY_SECONDS],
    filled: usize,
    cursor: usize,
    last_total: u64,
    last_sample: Option<Instant>,
}

impl Rolling {
    fn new() -> Self {
        Self {
            history: [0; HISTORY_SECONDS],
            filled: 0,
            cursor: 0,
            last_total: 0,
            last_sample: None,
        }
    }

    fn push(&mut self, delta: u64) {
        self.history[self.cursor] = delta;
        self.cursor = (self.cursor + 1) % HISTORY_SECONDS;
        self.filled = (self.filled + 1).min(HISTORY_SECONDS);
    }

    fn average(&self) -> f64 {
        if self.filled == 0 {
            return 0.0;
        }
        let sum: u64 = self.history.iter().take(self.filled).sum();
        sum as f64 / self.filled as f64
    }
}

/// Monotonic generation counters plus a per-second completion rate.
#[derive(Debug)]
pub struct GenerationStats {
    queued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    rolling: Mutex<Rolling>,
}

impl Default for GenerationStats {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerationStats {
    pub fn new() -> Self {
        Self {
            queued: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            rolling: Mutex::new(Rolling::new()),
        }
    }

    pub fn record_queued(&self) {
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick(&self) {
        self.tick_at(Instant::now());
    }

    /// Samples the completion counter once per elapsed second, crediting any gap to the
    /// newest slot.
    pub fn tick_at(&self, now: Instant) {
        let total = self.completed.load(Ordering::Relaxed);
        let mut r = self.rolling.lock().unwrap_or_else(|p| p.into_inner());
        match r.last_sample {
            None => {
                r.last_sample = Some(now);
                r.last_total = total;
            }
            Some(last) if now.saturating_duration_since(last) >= Duration::from_secs(1) => {
                let elapsed = now.saturating_duration_since(last).as_secs();
                let delta = total.saturating_sub(r.last_total);
                for _ in 1..elapsed.min(HISTORY_SECONDS as u64) {
                    r.push(0);
                }
                r.push(delta);
                r.last_total = total;
                r.last_sample = Some(last + Duration::from_secs(elapsed));
            }
            Some(_) => {}
        }
    }

    pub fn per_second(&self) -> f64 {
        self.rolling
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .average()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            queued: self.queued.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            per_second: self.per_second(),
        }
    }

    pub fn reset(&self) {
        self.queued.store(0, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.skipped.store(0, Ordering::Relaxed);
        *self.rolling.lock().unwrap_or_else(|p| p.into_inner()) = Rolling::new();
    }
}
