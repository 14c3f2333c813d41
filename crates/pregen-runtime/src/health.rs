use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Fewer samples than this never throttle, so a single slow startup tick is ignored.
const MIN_SAMPLES: usize = 5;

#[derive(Debug)]
struct TickWindow {
    intervals: VecDeque<Duration>,
    last_tick: Option<Instant>,
    window: usize,
    min_tps: f32,
    target_tps: f32,
}

impl TickWindow {
    fn average_tps(&self) -> Option<f32> {
        if self.intervals.is_empty() {
            return None;
        }
        let total: Duration = self.intervals.iter().sum();
        let avg = total.as_secs_f32() / self.intervals.len() as f32;
        // capped at the target rate
        let floor = 1.0 / self.target_tps;
        Some(1.0 / avg.max(floor))
    }
}

/// Tracks host tick cadence and raises a throttled flag when the host runs too slow.
#[derive(Debug)]
pub struct HostHealthMonitor {
    window: Mutex<TickWindow>,
    throttled: AtomicBool,
}

impl HostHealthMonitor {
    pub fn new(window: usize, min_tps: f32, target_tps: f32) -> Self {
        Self {
            window: Mutex::new(TickWindow {
                intervals: VecDeque::with_capacity(window),
                last_tick: None,
                window: window.max(1),
                min_tps,
                target_tps,
            }),
            throttled: AtomicBool::new(false),
        }
    }

    /// Applies new thresholds; collected samples are kept, trimmed to the new window.
    pub fn configure(&self, window: usize, min_tps: f32, target_tps: f32) {
        let mut w = self.window.lock().unwrap_or_else(|p| p.into_inner());
        w.window = window.max(1);
        w.min_tps = min_tps;
        w.target_tps = target_tps;
        while w.intervals.len() > w.window {
            w.intervals.pop_front();
        }
        self.update(&w);
    }

    pub fn tick(&self) {
        self.tick_at(Instant::now());
    }

    /// Records a host tick that happened at `now`.
    pub fn tick_at(&self, now: Instant) {
        let mut w = self.window.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(last) = w.last_tick.replace(now) {
            let interval = now.saturating_duration_since(last);
            if w.intervals.len() == w.window {
                w.intervals.pop_front();
            }
            w.intervals.push_back(interval);
        }
        self.update(&w);
    }

    fn update(&self, w: &TickWindow) {
        let throttled = w.intervals.len() >= MIN_SAMPLES.min(w.window)
            && w.average_tps().is_some_and(|tps| tps < w.min_tps);
        let was = self.throttled.swap(throttled, Ordering::AcqRel);
        if was != throttled {
            if throttled {
                log::info!(
                    "host running at {:.1} TPS; pausing background generation",
                    w.average_tps().unwrap_or(0.0)
                );
            } else {
                log::info!("host recovered; resuming background generation");
            }
        }
    }

    pub fn is_throttled(&self) -> bool {
        self.throttled.load(Ordering::Acquire)
    }

    pub fn average_tps(&self) -> Option<f32> {
        self.window
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .average_tps()
    }

    pub fn reset(&self) {
        let mut w = self.window.lock().unwrap_or_else(|p| p.into_inner());
        w.intervals.clear();
        w.last_tick = None;
        self.throttled.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(monitor: &HostHealthMonitor, start: Instant, ticks: u32, every: Duration) -> Instant {
        let mut now = start;
        for _ in 0..ticks {
            now += every;
            monitor.tick_at(now);
        }
        now
    }

    #[test]
    fn healthy_host_is_not_throttled() {
        let m = HostHealthMonitor::new(20, 15.0, 20.0);
        run(&m, Instant::now(), 30, Duration::from_millis(50));
        assert!(!m.is_throttled());
        let tps = m.average_tps().unwrap();
        assert!((tps - 20.0).abs() < 0.5, "tps {tps}");
    }

    #[test]
    fn slow_host_throttles_then_recovers() {
        let m = HostHealthMonitor::new(10, 15.0, 20.0);
        let t = run(&m, Instant::now(), 12, Duration::from_millis(100));
        assert!(m.is_throttled());
        run(&m, t, 12, Duration::from_millis(50));
        assert!(!m.is_throttled());
    }

    #[test]
    fn few_samples_never_throttle() {
        let m = HostHealthMonitor::new(40, 15.0, 20.0);
        run(&m, Instant::now(), 3, Duration::from_secs(1));
        assert!(!m.is_throttled());
    }

    #[test]
    fn reset_clears_state() {
        let m = HostHealthMonitor::new(10, 15.0, 20.0);
        run(&m, Instant::now(), 12, Duration::from_millis(200));
        assert!(m.is_throttled());
        m.reset();
        assert!(!m.is_throttled());
        assert!(m.average_tps().is_none());
    }
}
