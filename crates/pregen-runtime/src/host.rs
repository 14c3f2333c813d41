use std::sync::Arc;

use pregen_world::{CellCoord, PartitionId, ViewerId};
use thiserror::Error;

use crate::resolve::CellCompletion;
use crate::viewers::ViewerTracker;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generation failed: {0}")]
    Failed(String),
    #[error("completion dropped without a result")]
    Dropped,
    #[error("generation panicked")]
    Panicked,
}

pub type GenerationResult<A> = Result<Option<A>, GenerationError>;

/// The host world. Every method is called on the host's mutation thread, from inside
/// [`GenerationScheduler::tick`](crate::GenerationScheduler::tick).
pub trait GenerationBackend: Send + Sync + 'static {
    /// What a generated cell hands to the output sink.
    type Artifact: Send + 'static;

    /// The cell's artifact if it is already generated and resident.
    fn existing(&self, partition: &PartitionId, cell: CellCoord) -> Option<Self::Artifact>;

    /// Keeps the cell resident while it generates.
    fn add_lease(&self, partition: &PartitionId, cell: CellCoord);

    fn remove_lease(&self, partition: &PartitionId, cell: CellCoord);

    /// Called once after a run of lease changes in `partition` has been applied.
    fn settle(&self, partition: &PartitionId);

    /// Starts generating `cell`. `done` may be completed later from any thread; dropping it
    /// unresolved counts as a failure.
    fn generate(&self, partition: &PartitionId, cell: CellCoord, done: CellCompletion<Self::Artifact>);
}

/// Consumer of finished cells.
pub trait OutputSink<A>: Send + Sync {
    /// A cell finished generating, or changed after it was generated.
    fn publish(&self, partition: &PartitionId, cell: CellCoord, artifact: &A);

    /// Resends an earlier result to one viewer that has not seen it yet.
    fn deliver(&self, viewer: ViewerId, partition: &PartitionId, cell: CellCoord, artifact: &A);
}

/// Alternative generator that runs off the mutation thread, for partitions it serves.
pub trait FastGeneration<A>: Send + Sync {
    fn serves(&self, partition: &PartitionId) -> bool;

    fn generate(&self, partition: &PartitionId, cell: CellCoord) -> GenerationResult<A>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl<A> OutputSink<A> for NullSink {
    fn publish(&self, _: &PartitionId, _: CellCoord, _: &A) {}

    fn deliver(&self, _: ViewerId, _: &PartitionId, _: CellCoord, _: &A) {}
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoFastGeneration;

impl<A> FastGeneration<A> for NoFastGeneration {
    fn serves(&self, _: &PartitionId) -> bool {
        false
    }

    fn generate(&self, partition: &PartitionId, _: CellCoord) -> GenerationResult<A> {
        Err(GenerationError::Failed(format!(
            "no fast generator for {partition}"
        )))
    }
}

/// Everything the scheduler needs from the host.
pub struct HostHandle<B: GenerationBackend> {
    pub backend: Arc<B>,
    pub sink: Arc<dyn OutputSink<B::Artifact>>,
    pub fast: Arc<dyn FastGeneration<B::Artifact>>,
    pub viewers: Arc<ViewerTracker>,
}

impl<B: GenerationBackend> HostHandle<B> {
    pub fn new(backend: Arc<B>, viewers: Arc<ViewerTracker>) -> Self {
        Self {
            backend,
            sink: Arc::new(NullSink),
            fast: Arc::new(NoFastGeneration),
            viewers,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn OutputSink<B::Artifact>>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_fast(mut self, fast: Arc<dyn FastGeneration<B::Artifact>>) -> Self {
        self.fast = fast;
        self
    }

    /// Sends a finished cell to the sink and records it as seen by every viewer in its
    /// partition.
    pub(crate) fn publish(&self, partition: &PartitionId, cell: CellCoord, artifact: &B::Artifact) {
        publish_to(&*self.sink, &self.viewers, partition, cell, artifact);
    }
}

impl<B: GenerationBackend> Clone for HostHandle<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            sink: Arc::clone(&self.sink),
            fast: Arc::clone(&self.fast),
            viewers: Arc::clone(&self.viewers),
        }
    }
}

pub(crate) fn publish_to<A>(
    sink: &dyn OutputSink<A>,
    viewers: &ViewerTracker,
    partition: &PartitionId,
    cell: CellCoord,
    artifact: &A,
) {
    sink.publish(partition, cell, artifact);
    viewers.mark_delivered_in(partition, cell);
}
