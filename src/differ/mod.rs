//! Stages 2 and 3: the offline file differ and the live mutation differ,
//! plus the diff-key artifact they share.

pub mod file_differ;
pub mod mutation_differ;

pub use file_differ::FileDiffer;
pub use mutation_differ::{MutationDiffReport, MutationDiffer};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::cluster::ClusterError;
use crate::core::mutation::RecordError;

pub const DIFF_KEYS_FILE_NAME: &str = "diff-keys";
pub const MUTATION_DIFF_FILE_NAME: &str = "mutation-diff";

#[derive(Debug, Error)]
pub enum DifferError {
    #[error("io on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to serialize {what}: {source}")]
    Serialize {
        what: &'static str,
        source: serde_json::Error,
    },

    #[error("corrupt bin file {path}: {source}")]
    CorruptBin { path: PathBuf, source: RecordError },

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// Render a key for the diff artifacts. Store keys are UTF-8 in practice;
/// anything else is logged and emitted lossily.
pub(crate) fn key_to_string(key: &[u8]) -> String {
    match std::str::from_utf8(key) {
        Ok(s) => s.to_string(),
        Err(_) => {
            let lossy = String::from_utf8_lossy(key).into_owned();
            tracing::warn!(key = %lossy, "non-utf8 key in diff output, emitted lossily");
            lossy
        }
    }
}

pub fn diff_keys_path(dir: &Path) -> PathBuf {
    dir.join(DIFF_KEYS_FILE_NAME)
}

pub fn load_diff_keys(dir: &Path) -> Result<Vec<String>, DifferError> {
    let path = diff_keys_path(dir);
    let bytes = fs::read(&path).map_err(|source| DifferError::Io {
        path: path.clone(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| DifferError::Parse { path, source })
}

pub fn write_diff_keys(dir: &Path, keys: &[String]) -> Result<(), DifferError> {
    let path = diff_keys_path(dir);
    let bytes = serde_json::to_vec(keys).map_err(|source| DifferError::Serialize {
        what: "diff key list",
        source,
    })?;
    fs::write(&path, bytes).map_err(|source| DifferError::Io { path, source })
}
