use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use pregen_index::BatchTicket;
use pregen_world::{CellCoord, PartitionId};

use crate::host::{GenerationError, GenerationResult, OutputSink, publish_to};
use crate::leases::{LeaseChange, LeaseQueue};
use crate::partition::PartitionState;
use crate::stats::GenerationStats;
use crate::throttle::Throttle;
use crate::viewers::ViewerTracker;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    Generated,
    Failed,
}

/// Counters shared by every admitted cell of one scheduler run.
pub(crate) struct Bookkeeping {
    pub stats: Arc<GenerationStats>,
    pub throttle: Throttle,
    pub active_tasks: AtomicUsize,
    pub leases: LeaseQueue,
}

impl Bookkeeping {
    pub fn new(stats: Arc<GenerationStats>, capacity: usize) -> Self {
        Self {
            stats,
            throttle: Throttle::new(capacity),
            active_tasks: AtomicUsize::new(0),
            leases: LeaseQueue::new(),
        }
    }

    pub fn active_tasks(&self) -> usize {
        self.active_tasks.load(Ordering::Acquire)
    }

    /// Settles a batch member that needs no generation: already completed, or already in
    /// flight under an earlier claim.
    pub fn skip(&self, state: &PartitionState, cell: CellCoord, ticket: &Arc<BatchTicket>) {
        if state.completed.contains(cell.key()) {
            state.index.mark_completed(cell);
        }
        self.stats.record_skipped();
        state.batches.settle_one(ticket);
    }

    /// Turns a held throttle permit into a tracked task. Gives the permit back and skips the
    /// cell if it is already tracked.
    pub fn admit(
        self: &Arc<Self>,
        state: &Arc<PartitionState>,
        cell: CellCoord,
        ticket: &Arc<BatchTicket>,
    ) -> Option<CellTask> {
        if !state.track(cell) {
            self.throttle.release();
            self.skip(state, cell, ticket);
            return None;
        }
        self.active_tasks.fetch_add(1, Ordering::AcqRel);
        self.stats.record_queued();
        Some(CellTask {
            book: Arc::clone(self),
            state: Arc::clone(state),
            cell,
            ticket: Arc::clone(ticket),
            leased: false,
            resolved: false,
        })
    }

    fn resolve(
        &self,
        state: &PartitionState,
        cell: CellCoord,
        ticket: &Arc<BatchTicket>,
        outcome: Outcome,
    ) {
        match outcome {
            Outcome::Generated => {
                if state.complete(cell) {
                    self.stats.record_completed();
                    state.decrement_remaining();
                } else {
                    self.stats.record_skipped();
                }
            }
            Outcome::Failed => {
                self.stats.record_failed();
                state.decrement_remaining();
            }
        }
        state.batches.settle_one(ticket);
        if state.untrack(cell) {
            self.active_tasks.fetch_sub(1, Ordering::AcqRel);
            self.throttle.release();
        }
    }
}

/// One admitted cell. Resolves exactly once: explicitly, or as a failure when dropped.
pub(crate) struct CellTask {
    book: Arc<Bookkeeping>,
    state: Arc<PartitionState>,
    cell: CellCoord,
    ticket: Arc<BatchTicket>,
    leased: bool,
    resolved: bool,
}

impl CellTask {
    pub fn partition(&self) -> &PartitionId {
        &self.state.id
    }

    pub fn cell(&self) -> CellCoord {
        self.cell
    }

    /// Queues a lease on the cell; the matching release is queued on resolve.
    pub fn lease(&mut self) {
        if !self.leased {
            self.book
                .leases
                .push(self.state.id.clone(), self.cell, LeaseChange::Add);
            self.leased = true;
        }
    }

    pub fn resolve(mut self, outcome: Outcome) {
        self.finish(outcome);
    }

    fn finish(&mut self, outcome: Outcome) {
        if self.resolved {
            return;
        }
        self.resolved = true;
        if self.leased {
            self.book
                .leases
                .push(self.state.id.clone(), self.cell, LeaseChange::Remove);
        }
        self.book
            .resolve(&self.state, self.cell, &self.ticket, outcome);
    }
}

impl Drop for CellTask {
    fn drop(&mut self) {
        if !self.resolved {
            log::debug!(
                "{:?} in {} dropped without a result",
                self.cell,
                self.state.id
            );
            self.finish(Outcome::Failed);
        }
    }
}

/// Handed to the host with each generation request. Call [`complete`](Self::complete) once
/// generation finishes, from any thread.
pub struct CellCompletion<A> {
    task: CellTask,
    sink: Arc<dyn OutputSink<A>>,
    viewers: Arc<ViewerTracker>,
}

impl<A> CellCompletion<A> {
    pub(crate) fn new(
        task: CellTask,
        sink: Arc<dyn OutputSink<A>>,
        viewers: Arc<ViewerTracker>,
    ) -> Self {
        Self {
            task,
            sink,
            viewers,
        }
    }

    pub fn partition(&self) -> &PartitionId {
        self.task.partition()
    }

    pub fn cell(&self) -> CellCoord {
        self.task.cell()
    }

    /// `Ok(Some(_))` is published to the sink, `Ok(None)` counts as generated with nothing
    /// to publish.
    pub fn complete(self, result: GenerationResult<A>) {
        let Self {
            task,
            sink,
            viewers,
        } = self;
        match result {
            Ok(artifact) => {
                if let Some(artifact) = artifact.as_ref() {
                    publish_to(&*sink, &viewers, task.partition(), task.cell(), artifact);
                }
                task.resolve(Outcome::Generated);
            }
            Err(e) => {
                log::debug!(
                    "generation of {:?} in {} failed: {}",
                    task.cell(),
                    task.partition(),
                    e
                );
                task.resolve(Outcome::Failed);
            }
        }
    }

    pub fn succeed(self, artifact: A) {
        self.complete(Ok(Some(artifact)));
    }

    pub fn fail(self, error: GenerationError) {
        self.complete(Err(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pregen_index::BatchLedger;

    fn setup(capacity: usize) -> (Arc<Bookkeeping>, Arc<PartitionState>) {
        let book = Arc::new(Bookkeeping::new(Arc::new(GenerationStats::new()), capacity));
        let state = Arc::new(PartitionState::new(PartitionId::new("p"), false));
        (book, state)
    }

    fn claim(state: &PartitionState, size: usize) -> Arc<BatchTicket> {
        state
            .batches
            .claim(CellCoord::new(0, 0).batch(), size)
            .unwrap()
    }

    #[test]
    fn resolve_releases_everything_once() {
        let (book, state) = setup(2);
        let ticket = claim(&state, 1);
        state.set_remaining_in_radius(5);
        assert!(book.throttle.try_acquire());
        let cell = CellCoord::new(1, 1);
        let mut task = book.admit(&state, cell, &ticket).unwrap();
        task.lease();
        assert_eq!(book.active_tasks(), 1);
        task.resolve(Outcome::Generated);

        assert_eq!(book.active_tasks(), 0);
        assert_eq!(book.throttle.available(), 2);
        assert!(state.completed.contains(cell.key()));
        assert!(state.index.is_completed(cell));
        assert!(!state.batches.is_open(ticket.key()));
        assert_eq!(state.remaining_in_radius(), 4);
        let changes: Vec<_> = book
            .leases
            .drain_grouped()
            .into_iter()
            .flat_map(|(_, ops)| ops)
            .map(|op| op.change)
            .collect();
        assert_eq!(changes, vec![LeaseChange::Add, LeaseChange::Remove]);
        let snap = book.stats.snapshot();
        assert_eq!((snap.queued, snap.completed), (1, 1));
    }

    #[test]
    fn dropped_task_counts_as_failure() {
        let (book, state) = setup(1);
        let ticket = claim(&state, 1);
        assert!(book.throttle.try_acquire());
        let task = book.admit(&state, CellCoord::new(0, 0), &ticket).unwrap();
        drop(task);
        assert_eq!(book.stats.snapshot().failed, 1);
        assert_eq!(book.active_tasks(), 0);
        assert_eq!(book.throttle.available(), 1);
        assert!(state.tracked.is_empty());
        assert!(state.completed.is_empty());
    }

    #[test]
    fn duplicate_completion_is_skipped() {
        let (book, state) = setup(1);
        let ticket = claim(&state, 1);
        let cell = CellCoord::new(2, 2);
        state.complete(cell);
        assert!(book.throttle.try_acquire());
        let task = book.admit(&state, cell, &ticket).unwrap();
        task.resolve(Outcome::Generated);
        let snap = book.stats.snapshot();
        assert_eq!((snap.completed, snap.skipped), (0, 1));
        assert_eq!(book.throttle.available(), 1);
    }

    #[test]
    fn admitting_a_tracked_cell_returns_the_permit() {
        let (book, state) = setup(2);
        let ticket = claim(&state, 2);
        let cell = CellCoord::new(3, 3);
        assert!(book.throttle.try_acquire());
        let _first = book.admit(&state, cell, &ticket).unwrap();
        assert!(book.throttle.try_acquire());
        assert!(book.admit(&state, cell, &ticket).is_none());
        assert_eq!(book.throttle.available(), 1);
        assert_eq!(book.active_tasks(), 1);
        assert_eq!(ticket.remaining(), 1);
    }

    #[test]
    fn completion_publishes_before_resolving() {
        use std::sync::Mutex;

        struct Recorder(Mutex<Vec<(CellCoord, u32)>>);
        impl OutputSink<u32> for Recorder {
            fn publish(&self, _: &PartitionId, cell: CellCoord, artifact: &u32) {
                self.0.lock().unwrap().push((cell, *artifact));
            }
            fn deliver(&self, _: pregen_world::ViewerId, _: &PartitionId, _: CellCoord, _: &u32) {}
        }

        let (book, state) = setup(1);
        let ticket = claim(&state, 1);
        let sink = Arc::new(Recorder(Mutex::new(Vec::new())));
        let viewers = Arc::new(ViewerTracker::new());
        viewers.join(pregen_world::ViewerId(1), state.id.clone(), CellCoord::new(0, 0));
        assert!(book.throttle.try_acquire());
        let cell = CellCoord::new(0, 1);
        let task = book.admit(&state, cell, &ticket).unwrap();
        let done = CellCompletion::new(task, sink.clone(), Arc::clone(&viewers));
        done.succeed(42);
        assert_eq!(*sink.0.lock().unwrap(), vec![(cell, 42)]);
        let delivered = viewers.delivered(pregen_world::ViewerId(1)).unwrap();
        assert!(delivered.contains(cell.key()));
        assert_eq!(book.stats.snapshot().completed, 1);
    }
}
