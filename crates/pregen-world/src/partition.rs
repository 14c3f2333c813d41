use std::fmt;
use std::sync::Arc;

use crate::cell::CellCoord;

/// Identifier of one independently generated world, e.g. `minecraft:the_nether`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionId(Arc<str>);

impl PartitionId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe form of the id: anything outside `[A-Za-z0-9._-]` becomes `_`.
    pub fn file_stem(&self) -> String {
        let stem: String = self
            .0
            .trim()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        match stem.as_str() {
            "" | "." | ".." => format!("_{stem}"),
            _ => stem,
        }
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewerId(pub u64);

impl fmt::Display for ViewerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "viewer#{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ViewerPosition {
    pub id: ViewerId,
    pub partition: PartitionId,
    pub cell: CellCoord,
}
