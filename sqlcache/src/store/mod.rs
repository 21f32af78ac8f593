//! Pooled access to the Redis instance holding cached results.
//!
//! Raw [`CacheStore::get`]/[`CacheStore::put`] report failures; the typed
//! [`CacheStore::fetch`]/[`CacheStore::store`] pair swallow them, because a
//! cache problem must never fail the query being cached.

mod statistics;

pub use statistics::{
    CacheStatistics, LogMetrics, MetricsSink, NoopMetrics, METRIC_ERROR, METRIC_GET, METRIC_HIT,
    METRIC_MISS, METRIC_PUT,
};

use std::fmt;
use std::sync::Arc;

use log::{trace, warn};
use r2d2::{ManageConnection, Pool, PooledConnection};
use redis::ConnectionLike;

use crate::codec::ResultCodec;
use crate::config::PoolConfig;
use crate::errors::CacheResult;
use crate::rules::Ttl;
use crate::types::ResultSet;
use statistics::{Statistics, Timer};

/// Get/put access to cached results, keyed by fully built store keys.
pub struct CacheStore<M>
where
    M: ManageConnection,
{
    pool: Pool<M>,
    metrics: Arc<dyn MetricsSink>,
    statistics: Arc<Statistics>,
}

impl<M: ManageConnection> Clone for CacheStore<M> {
    fn clone(&self) -> Self {
        CacheStore {
            pool: self.pool.clone(),
            metrics: self.metrics.clone(),
            statistics: self.statistics.clone(),
        }
    }
}

impl<M: ManageConnection> fmt::Debug for CacheStore<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStore")
            .field("pool", &self.pool.state())
            .field("statistics", &CacheStatistics::from(&*self.statistics))
            .finish()
    }
}

/// Builds a connection pool. Connections are opened lazily, so an
/// unreachable store does not prevent construction.
pub fn build_pool<M: ManageConnection>(manager: M, config: &PoolConfig) -> Pool<M> {
    Pool::builder()
        .max_size(config.max_size)
        .min_idle(config.min_idle)
        .connection_timeout(config.connection_timeout)
        .idle_timeout(config.idle_timeout)
        // Broken connections are caught on return through `has_broken`;
        // a PING per checkout would double every round trip.
        .test_on_check_out(false)
        .build_unchecked(manager)
}

impl<M> CacheStore<M>
where
    M: ManageConnection,
    M::Connection: ConnectionLike,
{
    /// Creates a store with its own pool.
    pub fn new(manager: M, config: &PoolConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        CacheStore::from_pool(build_pool(manager, config), metrics)
    }

    /// Creates a store over an existing pool.
    pub fn from_pool(pool: Pool<M>, metrics: Arc<dyn MetricsSink>) -> Self {
        CacheStore {
            pool,
            metrics,
            statistics: Arc::new(Statistics::default()),
        }
    }

    pub fn pool(&self) -> &Pool<M> {
        &self.pool
    }

    /// Counters since this store was created.
    pub fn statistics(&self) -> CacheStatistics {
        CacheStatistics::from(&*self.statistics)
    }

    /// Borrows a connection, failing with
    /// [`ErrorKind::ConnectionUnavailable`](crate::ErrorKind::ConnectionUnavailable)
    /// once the pool's wait timeout passes.
    pub fn connection(&self) -> CacheResult<PooledConnection<M>> {
        Ok(self.pool.get()?)
    }

    /// Checks that the store answers.
    pub fn ping(&self) -> CacheResult<()> {
        let mut con = self.connection()?;
        redis::cmd("PING").query::<()>(&mut *con)?;
        Ok(())
    }

    /// Reads the raw bytes stored under `key`, counting a hit or a miss.
    pub fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let value = self.get_raw(key)?;
        if value.is_some() {
            self.hit(key);
        } else {
            self.miss(key);
        }
        Ok(value)
    }

    /// Stores `value` under `key`. [`Ttl::NoCache`] sends nothing,
    /// [`Ttl::Forever`] stores without expiry.
    pub fn put(&self, key: &str, ttl: Ttl, value: &[u8]) -> CacheResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        match ttl {
            Ttl::NoCache => {
                self.statistics.increase_skipped(1);
                return Ok(());
            }
            Ttl::Forever => {}
            Ttl::Expire(secs) => {
                cmd.arg("EX").arg(secs.get());
            }
        }

        let _timer = Timer::start(&*self.metrics, METRIC_PUT);
        let mut con = self.connection()?;
        cmd.query::<()>(&mut *con)?;
        self.statistics.increase_put(1);
        Ok(())
    }

    /// Reads and decodes a cached result. Store failures and undecodable
    /// entries are logged and reported as a miss.
    pub fn fetch(&self, key: &str, codec: &ResultCodec) -> Option<ResultSet> {
        let bytes = match self.get_raw(key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                self.miss(key);
                return None;
            }
            Err(err) => {
                warn!("Cache read of {key} failed, running uncached: {err}");
                self.error();
                self.miss(key);
                return None;
            }
        };

        match codec.decode(&bytes) {
            Ok(result) => {
                self.hit(key);
                Some(result)
            }
            Err(err) => {
                warn!("Ignoring undecodable cache entry {key}: {err}");
                self.error();
                self.miss(key);
                None
            }
        }
    }

    /// Encodes and stores a result. Returns whether anything was written;
    /// failures are logged and swallowed.
    pub fn store(&self, key: &str, ttl: Ttl, codec: &ResultCodec, result: &ResultSet) -> bool {
        if !ttl.should_cache() {
            self.statistics.increase_skipped(1);
            return false;
        }
        let bytes = match codec.encode(result) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("Not caching result for {key}: {err}");
                self.error();
                return false;
            }
        };
        match self.put(key, ttl, &bytes) {
            Ok(()) => true,
            Err(err) => {
                warn!("Cache write of {key} failed: {err}");
                self.error();
                false
            }
        }
    }

    fn get_raw(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let _timer = Timer::start(&*self.metrics, METRIC_GET);
        let mut con = self.connection()?;
        let value: Option<Vec<u8>> = redis::cmd("GET").arg(key).query(&mut *con)?;
        Ok(value)
    }

    fn hit(&self, key: &str) {
        trace!("Cache hit for {key}");
        self.statistics.increase_hit(1);
        self.metrics.increment(METRIC_HIT);
    }

    fn miss(&self, key: &str) {
        trace!("Cache miss for {key}");
        self.statistics.increase_miss(1);
        self.metrics.increment(METRIC_MISS);
    }

    fn error(&self) {
        self.statistics.increase_error(1);
        self.metrics.increment(METRIC_ERROR);
    }
}
