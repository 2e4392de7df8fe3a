//! Busy-poll loop over a queue pair.
//!
//! Completions only become visible when a queue pair is polled, so waiting
//! for I/O means spinning on [`NvmeQpair::process_completions`] until the
//! caller's condition holds. [`PollLimit`] bounds the spin so a stalled
//! transport turns into [`Error::PollTimeout`] instead of a hang.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use nvme_io::{PollLimit, poller::poll_until};
//!
//! # fn example(qpair: &nvme_io::nvme::NvmeQpair) -> nvme_io::Result<()> {
//! let limit = PollLimit::unbounded().with_timeout(Duration::from_secs(5));
//! let stats = poll_until(qpair, &limit, || qpair.outstanding() == 0)?;
//! println!("{} completions in {} polls", stats.completions, stats.iterations);
//! # Ok(())
//! # }
//! ```

use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::nvme::NvmeQpair;

/// Bounds for a busy-poll loop.
///
/// The default is unbounded: poll until the condition holds, however long
/// that takes.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollLimit {
    /// Give up after this many calls to `process_completions`
    pub max_iterations: Option<u64>,
    /// Give up once this much wall-clock time has passed
    #[serde(with = "millis", rename = "timeout_ms")]
    pub timeout: Option<Duration>,
    /// Completions reaped per call (0 = unlimited)
    pub max_completions: u32,
}

impl PollLimit {
    /// Poll until done, no matter how long.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Give up after `max_iterations` polls.
    pub fn iterations(max_iterations: u64) -> Self {
        Self {
            max_iterations: Some(max_iterations),
            ..Self::default()
        }
    }

    /// Give up after `timeout`.
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    /// Also bound by iteration count.
    pub fn with_max_iterations(mut self, max_iterations: u64) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    /// Also bound by wall-clock time.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Reap at most `max_completions` per poll.
    pub fn with_max_completions(mut self, max_completions: u32) -> Self {
        self.max_completions = max_completions;
        self
    }

    /// Whether a loop that has polled `iterations` times since `start` must
    /// stop.
    pub fn is_exhausted(&self, iterations: u64, start: Instant) -> bool {
        if self.max_iterations.is_some_and(|max| iterations >= max) {
            return true;
        }
        self.timeout.is_some_and(|timeout| start.elapsed() >= timeout)
    }
}

/// What a poll loop did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollStats {
    /// Calls to `process_completions`
    pub iterations: u64,
    /// Completions reaped
    pub completions: u64,
    /// Calls that reported a transport error
    pub errors: u64,
}

/// Poll `qpair` until `done` returns true.
///
/// `done` is checked before every poll, so a condition that already holds
/// returns without polling. Transport errors are logged and counted, never
/// fatal.
///
/// # Errors
///
/// [`Error::PollTimeout`] when `limit` runs out first.
pub fn poll_until<F>(qpair: &NvmeQpair, limit: &PollLimit, mut done: F) -> Result<PollStats>
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    let mut stats = PollStats::default();

    while !done() {
        if limit.is_exhausted(stats.iterations, start) {
            tracing::warn!(
                iterations = stats.iterations,
                outstanding = qpair.outstanding(),
                "giving up on queue pair completions"
            );
            return Err(Error::PollTimeout {
                iterations: stats.iterations,
            });
        }

        stats.iterations += 1;
        match qpair.process_completions(limit.max_completions) {
            Ok(n) => stats.completions += n as u64,
            Err(err) => {
                stats.errors += 1;
                tracing::warn!(%err, "Error occurred in processing queue pairs");
            }
        }
    }

    Ok(stats)
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits() {
        let start = Instant::now();
        assert!(!PollLimit::unbounded().is_exhausted(u64::MAX - 1, start));
        assert!(!PollLimit::iterations(3).is_exhausted(2, start));
        assert!(PollLimit::iterations(3).is_exhausted(3, start));
        assert!(PollLimit::timeout(Duration::ZERO).is_exhausted(0, start));
        assert!(
            !PollLimit::timeout(Duration::from_secs(3600))
                .with_max_completions(8)
                .is_exhausted(1000, start)
        );
    }

    #[test]
    fn test_deserialize() {
        let limit: PollLimit =
            serde_json::from_str(r#"{ "max_iterations": 10, "timeout_ms": 250 }"#).unwrap();
        assert_eq!(limit.max_iterations, Some(10));
        assert_eq!(limit.timeout, Some(Duration::from_millis(250)));
        assert_eq!(limit.max_completions, 0);

        let limit: PollLimit = serde_json::from_str("{}").unwrap();
        assert_eq!(limit, PollLimit::unbounded());
    }
}
