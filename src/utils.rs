//! Small shared helpers: retry with backoff, worker load distribution, and
//! the stable key-to-bin mapping.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Exponential backoff parameters shared by the stats fetch and the
/// metadata send-batch paths.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    pub initial: Duration,
    /// Total number of attempts, including the first.
    pub max_attempts: u32,
    pub factor: u32,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub fn new(initial: Duration, max_attempts: u32, factor: u32, max_delay: Duration) -> Self {
        Self {
            initial,
            max_attempts: max_attempts.max(1),
            factor: factor.max(1),
            max_delay,
        }
    }

    /// Delay to sleep after the given zero-based failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let mut delay = self.initial;
        for _ in 0..attempt {
            delay = delay.saturating_mul(self.factor);
            if delay >= self.max_delay {
                return self.max_delay;
            }
        }
        delay.min(self.max_delay)
    }
}

/// Run `op` until it succeeds or the policy's attempts are exhausted,
/// sleeping an exponentially growing (capped) interval between attempts.
/// The final error is returned unchanged.
pub fn retry_with_backoff<T, E: std::fmt::Display>(
    op_name: &str,
    policy: &BackoffPolicy,
    mut op: impl FnMut() -> Result<T, E>,
) -> Result<T, E> {
    let mut attempt = 0u32;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    return Err(err);
                }
                let delay = policy.delay_for(attempt - 1);
                tracing::warn!(
                    op = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "operation failed, retrying: {err}"
                );
                std::thread::sleep(delay);
            }
        }
    }
}

/// Split `items` across `workers` as equal-size contiguous chunks; the last
/// worker absorbs the remainder. Returns half-open (low, high) index ranges;
/// a worker whose range is empty has no load.
pub fn balanced_chunks(workers: usize, items: usize) -> Vec<(usize, usize)> {
    let workers = workers.max(1);
    let base = items / workers;
    let mut chunks = Vec::with_capacity(workers);
    for i in 0..workers {
        let low = i * base;
        let high = if i == workers - 1 { items } else { low + base };
        chunks.push((low, high));
    }
    chunks
}

/// Bin assignment for a key. Must be identical on source and target for the
/// same key bytes, so the same key always lands in the same (vbucket, bin)
/// file pair.
pub fn bin_index(key: &[u8], num_bins: usize) -> usize {
    crc32c::crc32c(key) as usize % num_bins.max(1)
}

/// Deterministic bin file name under `dir` for a (vbucket, bin) pair.
pub fn bin_file_path(dir: &Path, vbno: u16, bin: usize) -> PathBuf {
    dir.join(format!("{vbno}_{bin}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_delay_grows_and_caps() {
        let policy = BackoffPolicy::new(Duration::from_millis(10), 5, 2, Duration::from_millis(35));
        assert_eq!(policy.delay_for(0), Duration::from_millis(10));
        assert_eq!(policy.delay_for(1), Duration::from_millis(20));
        assert_eq!(policy.delay_for(2), Duration::from_millis(35));
        assert_eq!(policy.delay_for(10), Duration::from_millis(35));
    }

    #[test]
    fn retry_stops_after_max_attempts() {
        let policy = BackoffPolicy::new(Duration::from_millis(1), 3, 2, Duration::from_millis(2));
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = retry_with_backoff("always-fails", &policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("nope".to_string())
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn retry_returns_first_success() {
        let policy = BackoffPolicy::new(Duration::from_millis(1), 5, 2, Duration::from_millis(2));
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry_with_backoff("flaky", &policy, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 { Err("not yet".into()) } else { Ok(n) }
        });
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn balanced_chunks_last_worker_absorbs_remainder() {
        assert_eq!(balanced_chunks(3, 10), vec![(0, 3), (3, 6), (6, 10)]);
        assert_eq!(balanced_chunks(4, 4), vec![(0, 1), (1, 2), (2, 3), (3, 4)]);
        assert_eq!(balanced_chunks(3, 2), vec![(0, 0), (0, 0), (0, 2)]);
        assert_eq!(balanced_chunks(2, 0), vec![(0, 0), (0, 0)]);
    }

    #[test]
    fn bin_index_is_stable_and_in_range() {
        for key in [&b"alpha"[..], b"beta", b"_sys:gamma", b""] {
            let idx = bin_index(key, 10);
            assert!(idx < 10);
            assert_eq!(idx, bin_index(key, 10));
        }
    }
}
