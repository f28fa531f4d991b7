//! Concurrent Batch Processing
//!
//! Applies an operation to every record of a persisted collection that
//! matches a filter, streaming the collection in fixed-size batches.
//!
//! Each dispatched record carries a [`Done`] signal. The operation decides
//! when the record is finished by consuming it, so operations with their own
//! asynchronous sub-steps are counted correctly. Completion fires once every
//! record has signalled.
//!
//! # Modes
//!
//! - `Concurrent`: records are fanned out to the blocking worker pool, at
//!   most `concurrency` in flight. The store is not safe for concurrent
//!   writers, so operations that write must synchronize those writes
//!   themselves (for example by staging them behind a lock).
//! - `Serial`: one record at a time, in enumeration order; the next record
//!   starts only after the previous one signalled.

mod done;
mod processor;
mod store;

pub use done::*;
pub use processor::*;
pub use store::*;

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Options
// ─────────────────────────────────────────────────────────────────────────────

/// How records are dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    #[default]
    Concurrent,
    Serial,
}

/// Tuning for one batch run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOptions {
    #[serde(default)]
    pub mode: BatchMode,

    /// Records fetched from the store per enumeration step
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum records in flight in concurrent mode
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Log and publish progress every this many completions
    #[serde(default = "default_progress_every")]
    pub progress_every: usize,
}

fn default_batch_size() -> usize {
    256
}

/// Fallback worker count when available parallelism can't be detected
const FALLBACK_CONCURRENCY: usize = 4;

pub(crate) fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(FALLBACK_CONCURRENCY)
}

fn default_progress_every() -> usize {
    100
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            mode: BatchMode::default(),
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            progress_every: default_progress_every(),
        }
    }
}

impl BatchOptions {
    /// Concurrent mode with default tuning
    pub fn concurrent() -> Self {
        Self::default()
    }

    /// Serial mode with default tuning
    pub fn serial() -> Self {
        Self {
            mode: BatchMode::Serial,
            ..Default::default()
        }
    }

    /// Set batch size
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set concurrency limit
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set progress interval
    pub fn with_progress_every(mut self, every: usize) -> Self {
        self.progress_every = every;
        self
    }

    /// Records allowed in flight at once
    pub(crate) fn in_flight_limit(&self) -> usize {
        match self.mode {
            BatchMode::Serial => 1,
            BatchMode::Concurrent => self.concurrency.max(1),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Progress and Report
// ─────────────────────────────────────────────────────────────────────────────

/// Progress snapshot published while a batch runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchProgress {
    pub total: usize,
    /// Records finished so far, successful or not
    pub completed: usize,
    pub failed: usize,
}

/// Final accounting for a batch run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// Records matching the filter when the run started
    pub total: usize,
    pub succeeded: usize,
    /// Records whose operation failed, or that could not be enumerated
    pub failed: usize,
    /// Records never dispatched because the run was cancelled
    pub skipped: usize,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl BatchReport {
    /// Records accounted for
    pub fn completed(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.skipped == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight_limit() {
        assert_eq!(BatchOptions::serial().with_concurrency(8).in_flight_limit(), 1);
        assert_eq!(BatchOptions::concurrent().with_concurrency(8).in_flight_limit(), 8);
        assert_eq!(BatchOptions::concurrent().with_concurrency(0).in_flight_limit(), 1);
    }

    #[test]
    fn test_options_deserialize_with_defaults() {
        let options: BatchOptions = serde_json::from_str(r#"{ "mode": "serial", "batch_size": 10 }"#).unwrap();

        assert_eq!(options.mode, BatchMode::Serial);
        assert_eq!(options.batch_size, 10);
        assert_eq!(options.progress_every, 100);
        assert!(options.concurrency >= 1);
    }
}
