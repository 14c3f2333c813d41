//! Cell addressing, partitions, viewers, and shared key sets.
#![forbid(unsafe_code)]

pub mod cell;
pub mod key_set;
pub mod partition;

pub use cell::{BATCH_SPAN, BatchKey, CellCoord, CellKey};
pub use key_set::KeySet;
pub use partition::{PartitionId, ViewerId, ViewerPosition};
