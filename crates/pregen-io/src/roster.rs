use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use pregen_world::{CellKey, KeySet, PartitionId};
use thiserror::Error;

const MAGIC: [u8; 4] = *b"PGRS";
const VERSION: u16 = 1;

#[derive(Debug, Error)]
pub enum RosterError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("roster truncated: expected {expected} keys, found {found}")]
    Truncated { expected: usize, found: usize },
    #[error("roster has negative key count {0}")]
    BadCount(i32),
    #[error("unsupported roster version {0}")]
    UnsupportedVersion(u16),
}

/// Writes `[magic][u16 version][i32 count][i64 key]*count`, big-endian.
pub fn write_roster<W: Write>(mut w: W, keys: &[CellKey]) -> io::Result<()> {
    let count = i32::try_from(keys.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "too many keys for roster"))?;
    w.write_all(&MAGIC)?;
    w.write_all(&VERSION.to_be_bytes())?;
    w.write_all(&count.to_be_bytes())?;
    for key in keys {
        w.write_all(&key.raw().to_be_bytes())?;
    }
    w.flush()
}

/// Reads a versioned roster, or a legacy one without the magic/version header.
pub fn read_roster<R: Read>(mut r: R) -> Result<Vec<CellKey>, RosterError> {
    let mut bytes = Vec::new();
    r.read_to_end(&mut bytes)?;
    let mut body: &[u8] = &bytes;
    let versioned = body.starts_with(&MAGIC);
    if versioned {
        body = &body[MAGIC.len()..];
        let Some((ver, rest)) = body.split_first_chunk::<2>() else {
            return Err(RosterError::Truncated { expected: 0, found: 0 });
        };
        let version = u16::from_be_bytes(*ver);
        if version != VERSION {
            return Err(RosterError::UnsupportedVersion(version));
        }
        body = rest;
    }
    // an empty legacy file is an empty roster; a versioned one always has a count
    if body.is_empty() && !versioned {
        return Ok(Vec::new());
    }
    let Some((count, keys)) = body.split_first_chunk::<4>() else {
        return Err(RosterError::Truncated { expected: 0, found: 0 });
    };
    let count = i32::from_be_bytes(*count);
    if count < 0 {
        return Err(RosterError::BadCount(count));
    }
    let expected = count as usize;
    let found = keys.len() / 8;
    if found < expected {
        return Err(RosterError::Truncated { expected, found });
    }
    Ok(keys
        .chunks_exact(8)
        .take(expected)
        .map(|raw| {
            let mut b = [0u8; 8];
            b.copy_from_slice(raw);
            CellKey::from_raw(i64::from_be_bytes(b))
        })
        .collect())
}

/// One roster file per partition under a world directory.
#[derive(Clone, Debug)]
pub struct RosterStore {
    root: PathBuf,
}

impl RosterStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, partition: &PartitionId) -> PathBuf {
        self.root
            .join(format!("pregen_{}.bin", partition.file_stem()))
    }

    /// Persists `completed` for `partition`. The previous roster stays in place unless the
    /// new one was fully written and synced.
    pub fn save(&self, partition: &PartitionId, completed: &KeySet) -> Result<usize, RosterError> {
        let mut keys = completed.snapshot();
        keys.sort_unstable();
        let path = self.path_for(partition);
        match self.write_atomically(&path, &keys) {
            Ok(()) => {
                log::debug!("saved {} completed cells for {} to {:?}", keys.len(), partition, path);
                Ok(keys.len())
            }
            Err(e) => {
                log::error!(
                    "failed to save generation roster for {} ({:?}); progress is not durable: {}",
                    partition,
                    path,
                    e
                );
                Err(e.into())
            }
        }
    }

    fn write_atomically(&self, path: &Path, keys: &[CellKey]) -> io::Result<()> {
        fs::create_dir_all(&self.root)?;
        let tmp = path.with_extension("bin.tmp");
        let written = (|| {
            let mut out = BufWriter::new(File::create(&tmp)?);
            write_roster(&mut out, keys)?;
            let file = out.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
            fs::rename(&tmp, path)
        })();
        if written.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        written
    }

    /// Reads the roster for `partition`; `Ok(None)` when none was saved yet.
    pub fn try_load(&self, partition: &PartitionId) -> Result<Option<Vec<CellKey>>, RosterError> {
        let path = self.path_for(partition);
        match File::open(&path) {
            Ok(file) => read_roster(io::BufReader::new(file)).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replaces the content of `completed` with the saved roster. Any failure leaves it empty.
    pub fn load(&self, partition: &PartitionId, completed: &KeySet) -> usize {
        completed.clear();
        match self.try_load(partition) {
            Ok(Some(keys)) => {
                completed.replace(keys);
                let n = completed.len();
                log::info!("loaded {} completed cells for {}", n, partition);
                n
            }
            Ok(None) => 0,
            Err(e) => {
                log::warn!(
                    "failed to load generation roster for {} ({:?}): {}",
                    partition,
                    self.path_for(partition),
                    e
                );
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_headerless_roster_is_accepted() {
        let mut legacy = Vec::new();
        legacy.extend_from_slice(&2i32.to_be_bytes());
        legacy.extend_from_slice(&CellKey::new(-1, 4).raw().to_be_bytes());
        legacy.extend_from_slice(&CellKey::new(9, -9).raw().to_be_bytes());
        let keys = read_roster(legacy.as_slice()).unwrap();
        assert_eq!(keys, vec![CellKey::new(-1, 4), CellKey::new(9, -9)]);
    }

    #[test]
    fn truncated_roster_is_rejected() {
        let mut bytes = Vec::new();
        write_roster(&mut bytes, &[CellKey::new(1, 1), CellKey::new(2, 2)]).unwrap();
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(
            read_roster(bytes.as_slice()),
            Err(RosterError::Truncated { expected: 2, found: 1 })
        ));
    }

    #[test]
    fn header_without_count_is_truncated() {
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&VERSION.to_be_bytes());
        assert!(matches!(
            read_roster(bytes.as_slice()),
            Err(RosterError::Truncated { .. })
        ));
        assert!(read_roster(io::empty()).unwrap().is_empty());
    }

    #[test]
    fn future_version_is_rejected() {
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&7u16.to_be_bytes());
        bytes.extend_from_slice(&0i32.to_be_bytes());
        assert!(matches!(
            read_roster(bytes.as_slice()),
            Err(RosterError::UnsupportedVersion(7))
        ));
    }
}
