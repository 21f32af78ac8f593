#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::sleep;
use std::time::{Duration, Instant};

use sqlcache::types::type_code;
use sqlcache::{
    CacheConfig, CacheStore, CellValue, ColumnDescriptor, MetricsSink, NoopMetrics, Nullability,
    PoolConfig, QueryCache, ResultSet, Rule, SyncMode,
};
use sqlcache_test::{FakeConnectionManager, FakeRedis};

pub const NAMESPACE: &str = "test";

pub fn pool_config() -> PoolConfig {
    PoolConfig::new()
        .set_max_size(2)
        .set_min_idle(Some(0))
        .set_connection_timeout(Duration::from_millis(200))
}

pub fn config(mode: SyncMode) -> CacheConfig {
    CacheConfig::new()
        .set_namespace(NAMESPACE)
        .set_pool(pool_config())
        .set_sync_mode(mode)
}

pub fn poll_mode() -> SyncMode {
    SyncMode::Poll {
        interval: Duration::from_millis(20),
    }
}

pub fn stream_mode() -> SyncMode {
    SyncMode::Stream {
        block: Duration::from_millis(20),
    }
}

/// A fake store plus a cache wired to it.
pub struct TestContext {
    pub redis: FakeRedis,
    pub cache: QueryCache<FakeConnectionManager>,
}

impl TestContext {
    pub fn new(rules: Vec<Rule>) -> TestContext {
        TestContext::with_config(rules, config(poll_mode()))
    }

    pub fn with_config(rules: Vec<Rule>, config: CacheConfig) -> TestContext {
        let redis = FakeRedis::new();
        let cache = QueryCache::new(redis.manager(), &config, rules);
        TestContext { redis, cache }
    }

    /// Another process sharing the same store.
    pub fn peer(&self, rules: Vec<Rule>, config: CacheConfig) -> QueryCache<FakeConnectionManager> {
        QueryCache::new(self.redis.manager(), &config, rules)
    }
}

pub fn store(redis: &FakeRedis) -> CacheStore<FakeConnectionManager> {
    CacheStore::new(redis.manager(), &pool_config(), Arc::new(NoopMetrics))
}

pub fn store_with_metrics(
    redis: &FakeRedis,
    metrics: Arc<RecordingMetrics>,
) -> CacheStore<FakeConnectionManager> {
    CacheStore::new(redis.manager(), &pool_config(), metrics)
}

/// Keeps the names of every counter bump and timing it receives, in order.
#[derive(Default)]
pub struct RecordingMetrics {
    increments: Mutex<Vec<&'static str>>,
    timings: Mutex<Vec<&'static str>>,
}

impl RecordingMetrics {
    pub fn increments(&self) -> Vec<&'static str> {
        self.increments.lock().unwrap().clone()
    }

    pub fn timings(&self) -> Vec<&'static str> {
        self.timings.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.increments.lock().unwrap().clear();
        self.timings.lock().unwrap().clear();
    }
}

impl MetricsSink for RecordingMetrics {
    fn increment(&self, name: &'static str) {
        self.increments.lock().unwrap().push(name);
    }

    fn record(&self, name: &'static str, _elapsed: Duration) {
        self.timings.lock().unwrap().push(name);
    }
}

pub fn orders_result() -> ResultSet {
    ResultSet::with_rows(
        vec![
            ColumnDescriptor::new("id", type_code::BIGINT, "BIGINT")
                .with_table("orders")
                .with_nullable(Nullability::NoNulls),
            ColumnDescriptor::new("customer", type_code::VARCHAR, "VARCHAR").with_table("orders"),
            ColumnDescriptor::new("paid", type_code::BOOLEAN, "BOOLEAN").with_table("orders"),
        ],
        vec![
            vec![
                CellValue::BigInt(1),
                CellValue::Text("acme".to_string()),
                CellValue::Boolean(true),
            ],
            vec![CellValue::BigInt(2), CellValue::Null, CellValue::Boolean(false)],
        ],
    )
}

/// Counts how often the "database" is asked to run a statement.
#[derive(Clone, Default)]
pub struct Backend {
    executions: Arc<AtomicUsize>,
}

impl Backend {
    pub fn run(&self) -> Result<ResultSet, std::io::Error> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        Ok(orders_result())
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

/// Polls `condition` until it holds or two seconds pass.
pub fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(5));
    }
    condition()
}
