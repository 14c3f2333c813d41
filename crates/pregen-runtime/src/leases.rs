use crossbeam_channel::{Receiver, Sender, unbounded};
use pregen_world::{CellCoord, PartitionId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LeaseChange {
    Add,
    Remove,
}

#[derive(Clone, Debug)]
pub(crate) struct LeaseOp {
    pub partition: PartitionId,
    pub cell: CellCoord,
    pub change: LeaseChange,
}

/// Lease changes requested from any thread, applied in bulk on the mutation thread.
pub(crate) struct LeaseQueue {
    tx: Sender<LeaseOp>,
    rx: Receiver<LeaseOp>,
}

impl LeaseQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    pub fn push(&self, partition: PartitionId, cell: CellCoord, change: LeaseChange) {
        let _ = self.tx.send(LeaseOp {
            partition,
            cell,
            change,
        });
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Takes everything queued so far, grouped by partition in first-seen order. Within a
    /// partition the request order is kept.
    pub fn drain_grouped(&self) -> Vec<(PartitionId, Vec<LeaseOp>)> {
        let mut groups: Vec<(PartitionId, Vec<LeaseOp>)> = Vec::new();
        for op in self.rx.try_iter() {
            match groups.iter_mut().find(|(p, _)| *p == op.partition) {
                Some((_, ops)) => ops.push(op),
                None => groups.push((op.partition.clone(), vec![op])),
            }
        }
        groups
    }
}
