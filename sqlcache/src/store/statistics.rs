use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::trace;

pub const METRIC_GET: &str = "sqlcache.get";
pub const METRIC_PUT: &str = "sqlcache.put";
pub const METRIC_HIT: &str = "sqlcache.hit";
pub const METRIC_MISS: &str = "sqlcache.miss";
pub const METRIC_ERROR: &str = "sqlcache.error";

/// Where store operations report counters and timings.
///
/// Wire this to whatever metrics backend the application uses.
pub trait MetricsSink: Send + Sync {
    /// Adds one to a counter.
    fn increment(&self, name: &'static str);

    /// Records how long an operation took.
    fn record(&self, name: &'static str, elapsed: Duration);
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _name: &'static str) {}

    fn record(&self, _name: &'static str, _elapsed: Duration) {}
}

/// Writes every metric as a `trace!` line.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogMetrics;

impl MetricsSink for LogMetrics {
    fn increment(&self, name: &'static str) {
        trace!("{name} +1");
    }

    fn record(&self, name: &'static str, elapsed: Duration) {
        trace!("{name} took {elapsed:?}");
    }
}

impl<T: MetricsSink + ?Sized> MetricsSink for Arc<T> {
    fn increment(&self, name: &'static str) {
        (**self).increment(name)
    }

    fn record(&self, name: &'static str, elapsed: Duration) {
        (**self).record(name, elapsed)
    }
}

/// Records the elapsed time into the sink when dropped, so every exit path
/// of the timed operation is covered.
pub(crate) struct Timer<'a> {
    sink: &'a dyn MetricsSink,
    name: &'static str,
    start: Instant,
}

impl<'a> Timer<'a> {
    pub(crate) fn start(sink: &'a dyn MetricsSink, name: &'static str) -> Self {
        Timer {
            sink,
            name,
            start: Instant::now(),
        }
    }
}

impl Drop for Timer<'_> {
    fn drop(&mut self) {
        self.sink.record(self.name, self.start.elapsed());
    }
}

#[derive(Default)]
pub(crate) struct Statistics {
    hit: AtomicUsize,
    miss: AtomicUsize,
    put: AtomicUsize,
    skipped: AtomicUsize,
    error: AtomicUsize,
}

impl Statistics {
    pub(crate) fn increase_hit(&self, increase: usize) {
        self.hit.fetch_add(increase, Ordering::Relaxed);
    }

    pub(crate) fn increase_miss(&self, increase: usize) {
        self.miss.fetch_add(increase, Ordering::Relaxed);
    }

    pub(crate) fn increase_put(&self, increase: usize) {
        self.put.fetch_add(increase, Ordering::Relaxed);
    }

    pub(crate) fn increase_skipped(&self, increase: usize) {
        self.skipped.fetch_add(increase, Ordering::Relaxed);
    }

    pub(crate) fn increase_error(&self, increase: usize) {
        self.error.fetch_add(increase, Ordering::Relaxed);
    }
}

/// A point-in-time copy of the store counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStatistics {
    /// Reads that found a usable value.
    pub hit: usize,
    /// Reads that found nothing, or a value that could not be decoded.
    pub miss: usize,
    /// Values written to the store.
    pub put: usize,
    /// Writes not sent because the TTL said not to cache.
    pub skipped: usize,
    /// Store or codec failures that were swallowed.
    pub error: usize,
}

impl From<&Statistics> for CacheStatistics {
    fn from(stats: &Statistics) -> Self {
        CacheStatistics {
            hit: stats.hit.load(Ordering::Relaxed),
            miss: stats.miss.load(Ordering::Relaxed),
            put: stats.put.load(Ordering::Relaxed),
            skipped: stats.skipped.load(Ordering::Relaxed),
            error: stats.error.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Display for CacheStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hit={} miss={} put={} skipped={} error={}",
            self.hit, self.miss, self.put, self.skipped, self.error
        )
    }
}
