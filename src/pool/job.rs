//! Keyspace job parameters and mutable run state.

use crate::error::{KeypoolError, Result};
use std::time::{Duration, Instant};

/// Immutable description of one search run.
#[derive(Debug, Clone)]
pub struct Job {
    /// Size of the keyspace `[0, work_size)`.
    pub work_size: u64,
    /// Length of each chunk handed to a worker.
    pub chunk_size: u64,
    /// Candidates a worker searches between checkpoints.
    pub checkpoint_interval: u64,
    /// Maximum silence before a worker is presumed dead.
    pub timeout: Duration,
    /// Digest the workers are trying to match.
    pub target: Vec<u8>,
    /// Label recorded alongside found values.
    pub label: String,
    /// Session table capacity.
    pub max_workers: usize,
}

impl Job {
    /// Reject parameters the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.work_size == 0 {
            return Err(KeypoolError::InvalidJob("work size must be non-zero".into()));
        }
        if self.chunk_size == 0 {
            return Err(KeypoolError::InvalidJob("chunk size must be non-zero".into()));
        }
        if self.checkpoint_interval == 0 {
            return Err(KeypoolError::InvalidJob(
                "checkpoint interval must be non-zero".into(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(KeypoolError::InvalidJob("timeout must be non-zero".into()));
        }
        if self.target.is_empty() {
            return Err(KeypoolError::InvalidJob("target must not be empty".into()));
        }
        if self.max_workers == 0 {
            return Err(KeypoolError::InvalidJob(
                "max workers must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Mutable state of a run, owned by the coordinator.
#[derive(Debug)]
pub struct RunState {
    found: bool,
    result: Option<Vec<u8>>,
    worker_time: Duration,
    started_at: Instant,
}

impl RunState {
    pub fn new(started_at: Instant) -> Self {
        Self {
            found: false,
            result: None,
            worker_time: Duration::ZERO,
            started_at,
        }
    }

    /// Record a match. Only the first call has any effect.
    pub fn record_found(&mut self, value: Vec<u8>) -> bool {
        if self.found {
            return false;
        }
        self.found = true;
        self.result = Some(value);
        true
    }

    /// Add time a worker spent connected. The total never decreases.
    pub fn add_worker_time(&mut self, spent: Duration) {
        self.worker_time = self.worker_time.saturating_add(spent);
    }

    pub fn found(&self) -> bool {
        self.found
    }

    pub fn result(&self) -> Option<&[u8]> {
        self.result.as_deref()
    }

    pub fn worker_time(&self) -> Duration {
        self.worker_time
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A small valid job for tests.
    pub(crate) fn test_job(work_size: u64, chunk_size: u64) -> Job {
        Job {
            work_size,
            chunk_size,
            checkpoint_interval: 5,
            timeout: Duration::from_secs(10),
            target: vec![0xab; 32],
            label: "test".to_string(),
            max_workers: 8,
        }
    }

    #[test]
    fn test_valid_job() {
        assert!(test_job(100, 25).validate().is_ok());
    }

    #[test]
    fn test_invalid_jobs() {
        let mut job = test_job(100, 0);
        assert!(matches!(job.validate(), Err(KeypoolError::InvalidJob(_))));

        job = test_job(0, 10);
        assert!(job.validate().is_err());

        job = test_job(100, 10);
        job.target.clear();
        assert!(job.validate().is_err());

        job = test_job(100, 10);
        job.timeout = Duration::ZERO;
        assert!(job.validate().is_err());

        job = test_job(100, 10);
        job.max_workers = 0;
        assert!(job.validate().is_err());
    }

    #[test]
    fn test_found_is_set_once() {
        let mut run = RunState::new(Instant::now());
        assert!(run.record_found(b"first".to_vec()));
        assert!(!run.record_found(b"second".to_vec()));
        assert!(run.found());
        assert_eq!(run.result(), Some(&b"first"[..]));
    }

    #[test]
    fn test_worker_time_accumulates() {
        let mut run = RunState::new(Instant::now());
        run.add_worker_time(Duration::from_secs(3));
        run.add_worker_time(Duration::ZERO);
        run.add_worker_time(Duration::from_millis(500));
        assert_eq!(run.worker_time(), Duration::from_millis(3500));
    }
}
