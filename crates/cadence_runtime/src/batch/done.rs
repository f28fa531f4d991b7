//! Per-record completion signal

use std::fmt;

use tokio::sync::OwnedSemaphorePermit;
use tokio::sync::mpsc;

/// What a record reported back to the collector
#[derive(Debug)]
pub(crate) enum Signal {
    Succeeded,
    Failed(String),
    /// Records that were never dispatched
    Unreached { count: usize, skipped: bool, reason: String },
}

#[derive(Debug)]
pub(crate) struct Completion {
    pub record: String,
    pub signal: Signal,
}

/// Completion signal for one dispatched record
///
/// Consume it with [`Done::succeed`], [`Done::fail`] or [`Done::finish`] once
/// the record's work is finished. Dropping it unsignalled counts the record
/// as failed, so a panicking or forgetful operation never stalls the batch.
/// The record's concurrency slot is released when the signal is sent.
pub struct Done {
    record: String,
    tx: Option<mpsc::UnboundedSender<Completion>>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Done {
    pub(crate) fn new(
        record: String,
        tx: mpsc::UnboundedSender<Completion>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            record,
            tx: Some(tx),
            _permit: permit,
        }
    }

    /// Debug rendering of the record's key
    pub fn record(&self) -> &str {
        &self.record
    }

    /// The record finished successfully
    pub fn succeed(mut self) {
        self.send(Signal::Succeeded);
    }

    /// The record failed; the error is logged by the processor
    pub fn fail(mut self, error: impl fmt::Display) {
        self.send(Signal::Failed(error.to_string()));
    }

    /// Signal from a result
    pub fn finish<E: fmt::Display>(self, result: Result<(), E>) {
        match result {
            Ok(()) => self.succeed(),
            Err(e) => self.fail(e),
        }
    }

    fn send(&mut self, signal: Signal) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Completion {
                record: std::mem::take(&mut self.record),
                signal,
            });
        }
    }
}

impl Drop for Done {
    fn drop(&mut self) {
        if self.tx.is_some() {
            self.send(Signal::Failed(
                "dropped without signalling completion".to_string(),
            ));
        }
    }
}

impl fmt::Debug for Done {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Done")
            .field("record", &self.record)
            .field("signalled", &self.tx.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_done_signals_exactly_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();

        Done::new("a".into(), tx.clone(), None).succeed();
        Done::new("b".into(), tx.clone(), None).fail("bad tag");
        drop(Done::new("c".into(), tx, None));

        let a = rx.try_recv().unwrap();
        assert_eq!(a.record, "a");
        assert!(matches!(a.signal, Signal::Succeeded));

        let b = rx.try_recv().unwrap();
        assert!(matches!(b.signal, Signal::Failed(ref e) if e == "bad tag"));

        let c = rx.try_recv().unwrap();
        assert!(matches!(c.signal, Signal::Failed(ref e) if e.contains("dropped")));

        assert!(rx.try_recv().is_err());
    }
}
