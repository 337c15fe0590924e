//! Checkpoint data model: per-vbucket resume state and the persisted
//! checkpoint document.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of vbuckets a bucket is partitioned into. Protocol constant.
pub const NUM_VBUCKETS: usize = 1024;

/// The most recent stream-provided atomic range covering the current seqno.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotWindow {
    pub start_seqno: u64,
    pub end_seqno: u64,
}

/// Everything needed to resume one vbucket's stream: the history branch it
/// was on, how far it got, and the snapshot window around that seqno.
///
/// Invariant: `snapshot_start_seqno <= seqno <= snapshot_end_seqno`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub vbuuid: u64,
    pub seqno: u64,
    pub snapshot_start_seqno: u64,
    pub snapshot_end_seqno: u64,
}

/// Per-vbucket start state built at driver start.
#[derive(Clone, Copy, Debug, Default)]
pub struct Vbts {
    pub checkpoint: Checkpoint,
    pub end_seqno: u64,
    /// Set when the resumed seqno already reached the end seqno in
    /// seqno-bounded mode; the vbucket completes without opening a stream.
    pub no_need_to_start_stream: bool,
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to read checkpoint file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to parse checkpoint file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("checkpoint file {path} has {got} vbucket entries, expected {expected}")]
    WrongEntryCount {
        path: PathBuf,
        got: usize,
        expected: usize,
    },

    #[error("failed to write checkpoint file {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("failed to serialize checkpoint document: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// The persisted mapping vbucket -> checkpoint. A document is only valid
/// with exactly one entry per vbucket.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CheckpointDoc {
    pub checkpoints: BTreeMap<u16, Checkpoint>,
}

impl CheckpointDoc {
    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        let bytes = fs::read(path).map_err(|source| CheckpointError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let doc: CheckpointDoc =
            serde_json::from_slice(&bytes).map_err(|source| CheckpointError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        if doc.checkpoints.len() != NUM_VBUCKETS {
            return Err(CheckpointError::WrongEntryCount {
                path: path.to_path_buf(),
                got: doc.checkpoints.len(),
                expected: NUM_VBUCKETS,
            });
        }
        Ok(doc)
    }

    /// Serialize and atomically replace the file at `path` via a temporary
    /// sibling and rename.
    pub fn save(&self, path: &Path) -> Result<(), CheckpointError> {
        let bytes = serde_json::to_vec(self)?;
        let tmp = path.with_extension("tmp");
        let write_err = |source| CheckpointError::Write {
            path: path.to_path_buf(),
            source,
        };
        fs::write(&tmp, &bytes).map_err(write_err)?;
        fs::rename(&tmp, path).map_err(write_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_doc() -> CheckpointDoc {
        let mut doc = CheckpointDoc::default();
        for vbno in 0..NUM_VBUCKETS as u16 {
            doc.checkpoints.insert(
                vbno,
                Checkpoint {
                    vbuuid: 0xabc0 + vbno as u64,
                    seqno: vbno as u64 * 3 + 1,
                    snapshot_start_seqno: vbno as u64 * 3,
                    snapshot_end_seqno: vbno as u64 * 3 + 2,
                },
            );
        }
        doc
    }

    #[test]
    fn doc_roundtrips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("source_ckpt");
        let doc = full_doc();
        doc.save(&path).unwrap();

        let loaded = CheckpointDoc::load(&path).unwrap();
        assert_eq!(loaded.checkpoints.len(), NUM_VBUCKETS);
        assert_eq!(loaded.checkpoints[&5], doc.checkpoints[&5]);
    }

    #[test]
    fn save_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("source_ckpt");
        let mut doc = full_doc();
        doc.save(&path).unwrap();
        doc.checkpoints.get_mut(&0).unwrap().seqno = 999;
        doc.save(&path).unwrap();
        assert_eq!(CheckpointDoc::load(&path).unwrap().checkpoints[&0].seqno, 999);
    }

    #[test]
    fn doc_with_wrong_entry_count_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short_ckpt");

        let mut doc = full_doc();
        doc.checkpoints.remove(&7);
        let bytes = serde_json::to_vec(&doc).unwrap();
        fs::write(&path, bytes).unwrap();

        let err = CheckpointDoc::load(&path).unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::WrongEntryCount { got, expected, .. }
                if got == NUM_VBUCKETS - 1 && expected == NUM_VBUCKETS
        ));
    }

    #[test]
    fn unparseable_doc_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage");
        fs::write(&path, b"not json").unwrap();
        assert!(matches!(
            CheckpointDoc::load(&path).unwrap_err(),
            CheckpointError::Parse { .. }
        ));
    }
}
