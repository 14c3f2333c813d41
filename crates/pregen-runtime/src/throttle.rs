use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, select, unbounded};

/// Counting semaphore bounding how many cells are generating at once.
///
/// Permits are tokens travelling through a channel. Raising the capacity issues new tokens
/// right away; lowering it retires tokens as they come back, so in-flight work is never
/// revoked but nothing new is admitted until the held count drops below the new limit.
pub struct Throttle {
    tokens_tx: Sender<()>,
    tokens_rx: Receiver<()>,
    capacity: AtomicUsize,
    issued: AtomicUsize,
    held: AtomicUsize,
}

impl Throttle {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = unbounded();
        for _ in 0..capacity {
            let _ = tx.send(());
        }
        Self {
            tokens_tx: tx,
            tokens_rx: rx,
            capacity: AtomicUsize::new(capacity),
            issued: AtomicUsize::new(capacity),
            held: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Permits that could be handed out right now without waiting.
    pub fn available(&self) -> usize {
        self.tokens_rx.len()
    }

    pub fn held(&self) -> usize {
        self.held.load(Ordering::Acquire)
    }

    /// Waits up to `timeout` for a permit. Returns `false` on timeout, or as soon as `cancel`
    /// yields a message or disconnects.
    pub fn acquire_timeout(&self, timeout: Duration, cancel: Option<&Receiver<()>>) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let got = match cancel {
                Some(cancel) => select! {
                    recv(self.tokens_rx) -> token => token.is_ok(),
                    recv(cancel) -> _ => return false,
                    default(remaining) => false,
                },
                None => self.tokens_rx.recv_timeout(remaining).is_ok(),
            };
            if !got {
                return false;
            }
            if self.held.fetch_add(1, Ordering::AcqRel) < self.capacity() {
                return true;
            }
            // over a lowered limit
            self.held.fetch_sub(1, Ordering::AcqRel);
            self.issued.fetch_sub(1, Ordering::AcqRel);
            if Instant::now() >= deadline {
                return false;
            }
        }
    }

    pub fn try_acquire(&self) -> bool {
        self.acquire_timeout(Duration::ZERO, None)
    }

    /// Returns one held permit. Extra calls with nothing held are ignored.
    pub fn release(&self) {
        let was_held = self
            .held
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if !was_held {
            log::warn!("throttle permit released without being held");
            return;
        }
        let cap = self.capacity();
        let retired = self
            .issued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n > cap).then(|| n - 1)
            })
            .is_ok();
        if !retired {
            let _ = self.tokens_tx.send(());
        }
    }

    /// Changes the limit. Growth takes effect immediately, shrinking as permits return.
    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::Release);
        if let Ok(prev) = self
            .issued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < capacity).then_some(capacity)
            })
        {
            for _ in prev..capacity {
                let _ = self.tokens_tx.send(());
            }
        }
    }
}
