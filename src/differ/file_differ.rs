//! Stage 2: offline join of the two clusters' bin files.
//!
//! Work unit is one (vbucket, bin) pair; the same key always lands in the
//! same pair on both sides because the bin hash is stable. Within a pair the
//! latest record per key wins, then the two sides are compared field by
//! field.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::config::DiffConfig;
use crate::core::checkpoint::NUM_VBUCKETS;
use crate::core::mutation::BinnedRecord;
use crate::differ::{DifferError, key_to_string, write_diff_keys};
use crate::utils::bin_file_path;

pub struct FileDiffer {
    source_dir: PathBuf,
    target_dir: PathBuf,
    output_dir: PathBuf,
    num_workers: usize,
    num_bins: usize,
}

impl FileDiffer {
    pub fn new(config: &DiffConfig) -> Self {
        Self {
            source_dir: config.source_file_dir.clone(),
            target_dir: config.target_file_dir.clone(),
            output_dir: config.file_differ_dir.clone(),
            num_workers: config.file_differ_workers.max(1),
            num_bins: config.num_bins.max(1),
        }
    }

    /// Diff every (vbucket, bin) pair and write the merged, sorted diff-key
    /// list. A corrupt pair is logged and skipped; the other pairs proceed.
    pub fn run(&self) -> Result<Vec<String>, DifferError> {
        let pairs: Vec<(u16, usize)> = (0..NUM_VBUCKETS as u16)
            .flat_map(|vbno| (0..self.num_bins).map(move |bin| (vbno, bin)))
            .collect();

        let merged = Mutex::new(BTreeSet::<String>::new());
        std::thread::scope(|scope| {
            for worker in 0..self.num_workers {
                let pairs = &pairs;
                let merged = &merged;
                scope.spawn(move || {
                    let mut local = Vec::new();
                    for (vbno, bin) in pairs.iter().skip(worker).step_by(self.num_workers) {
                        match self.diff_pair(*vbno, *bin) {
                            Ok(keys) => local.extend(keys),
                            Err(err) => tracing::warn!(
                                vbno = *vbno,
                                bin = *bin,
                                "skipping corrupt bin pair: {err}"
                            ),
                        }
                    }
                    merged.lock().expect("diff set lock poisoned").extend(local);
                });
            }
        });

        let keys: Vec<String> = merged
            .into_inner()
            .expect("diff set lock poisoned")
            .into_iter()
            .collect();
        write_diff_keys(&self.output_dir, &keys)?;
        tracing::info!(diff_keys = keys.len(), "file differ completed");
        Ok(keys)
    }

    fn diff_pair(&self, vbno: u16, bin: usize) -> Result<Vec<String>, DifferError> {
        let source = load_latest_records(&bin_file_path(&self.source_dir, vbno, bin))?;
        let target = load_latest_records(&bin_file_path(&self.target_dir, vbno, bin))?;
        Ok(diff_latest_records(&source, &target))
    }
}

/// Read a bin file into key -> winning record. A missing file is an empty
/// side; a trailing partial record poisons the pair.
fn load_latest_records(path: &Path) -> Result<HashMap<Vec<u8>, BinnedRecord>, DifferError> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(source) => {
            return Err(DifferError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let mut latest: HashMap<Vec<u8>, BinnedRecord> = HashMap::new();
    let mut offset = 0;
    while offset < data.len() {
        let (record, next) =
            BinnedRecord::decode(&data, offset).map_err(|source| DifferError::CorruptBin {
                path: path.to_path_buf(),
                source,
            })?;
        match latest.get(&record.key) {
            Some(existing) if !record.supersedes(existing) => {}
            _ => {
                latest.insert(record.key.clone(), record);
            }
        }
        offset = next;
    }
    Ok(latest)
}

fn diff_latest_records(
    source: &HashMap<Vec<u8>, BinnedRecord>,
    target: &HashMap<Vec<u8>, BinnedRecord>,
) -> Vec<String> {
    let mut diff_keys = Vec::new();
    for (key, source_record) in source {
        match target.get(key) {
            Some(target_record) => {
                if !source_record.meta_matches(target_record) {
                    diff_keys.push(key_to_string(key));
                }
            }
            None => diff_keys.push(key_to_string(key)),
        }
    }
    for key in target.keys() {
        if !source.contains_key(key) {
            diff_keys.push(key_to_string(key));
        }
    }
    diff_keys
}
