use std::fmt;
use std::sync::Arc;

use log::{trace, warn};
use r2d2::ManageConnection;
use redis::ConnectionLike;

use crate::codec::ResultCodec;
use crate::config::CacheConfig;
use crate::errors::CacheResult;
use crate::keys::KeyBuilder;
use crate::registry::{Query, QueryId, QueryRegistry, SimpleTableExtractor, TableExtractor};
use crate::rules::{Action, Rule, RuleSet};
use crate::store::{build_pool, CacheStore, LogMetrics, MetricsSink};
use crate::sync::ConfigSync;
use crate::types::{CellValue, ResultSet};

/// Key part under the namespace for cached results.
pub const CACHE_KEY: &str = "cache";

/// Everything a caller needs to cache query results, owned in one place and
/// shared by reference.
///
/// The flow for one statement is: look the SQL up in the registry, evaluate
/// the rules, and if they say to cache, try the store before running the
/// query against the database; on a miss the fresh result is stored with
/// the TTL the rules picked.
pub struct QueryCache<M>
where
    M: ManageConnection,
{
    registry: QueryRegistry,
    rules: Arc<RuleSet>,
    store: CacheStore<M>,
    sync: ConfigSync<M>,
    codec: ResultCodec,
    keys: KeyBuilder,
}

impl<M: ManageConnection> fmt::Debug for QueryCache<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("registry", &self.registry)
            .field("rules", &self.rules)
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

impl QueryCache<redis::Client> {
    /// Connects to the Redis instance at `url`. No connection is made until
    /// the cache is first used.
    pub fn open(url: &str, config: &CacheConfig, rules: Vec<Rule>) -> CacheResult<Self> {
        let client = redis::Client::open(url)?;
        Ok(QueryCache::new(client, config, rules))
    }
}

impl<M> QueryCache<M>
where
    M: ManageConnection,
    M::Connection: ConnectionLike,
{
    /// Creates a cache with the default table extractor and log-backed
    /// metrics.
    pub fn new(manager: M, config: &CacheConfig, rules: Vec<Rule>) -> Self {
        QueryCache::with_parts(
            manager,
            config,
            rules,
            SimpleTableExtractor::new(),
            Arc::new(LogMetrics),
        )
    }

    /// Creates a cache with a custom table extractor and metrics sink.
    pub fn with_parts<E>(
        manager: M,
        config: &CacheConfig,
        rules: Vec<Rule>,
        extractor: E,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self
    where
        E: TableExtractor + 'static,
    {
        let pool = build_pool(manager, config.pool());
        let root = KeyBuilder::new(config.namespace(), config.separator());
        let rules = Arc::new(RuleSet::new(rules));

        QueryCache {
            registry: QueryRegistry::new(config.registry_size(), extractor),
            sync: ConfigSync::new(pool.clone(), rules.clone(), &root, config.sync_mode()),
            store: CacheStore::from_pool(pool, metrics),
            rules,
            codec: ResultCodec::new(config.max_buffer_size()),
            keys: root.sub(CACHE_KEY),
        }
    }

    /// Resolves `sql` and decides whether and how long to cache it.
    pub fn evaluate(&self, sql: &str) -> (Arc<Query>, Action) {
        let query = self.registry.get_or_create(sql);
        let action = self.rules.evaluate(&query);
        (query, action)
    }

    /// The store key for a query and its bound parameters. Parameterless
    /// statements use the query id alone.
    pub fn cache_key(&self, query: &Query, params: &[CellValue]) -> CacheResult<String> {
        if params.is_empty() {
            return Ok(self.keys.key(query.id()));
        }
        let encoded = self.codec.encode_params(params)?;
        let params_hash = QueryId(crc32fast::hash(&encoded));
        Ok(self.keys.build(&[&query.id(), &params_hash]))
    }

    /// Runs a statement through the cache. `execute` runs it against the
    /// database and is only called on a miss or when caching does not apply.
    /// Cache failures of any kind fall back to `execute`; only its own
    /// errors are returned.
    pub fn query<F, E>(&self, sql: &str, params: &[CellValue], execute: F) -> Result<ResultSet, E>
    where
        F: FnOnce() -> Result<ResultSet, E>,
    {
        let (query, action) = self.evaluate(sql);
        if !action.should_cache() {
            trace!("Query {} is not cacheable", query.id());
            return execute();
        }

        let key = match self.cache_key(&query, params) {
            Ok(key) => key,
            Err(err) => {
                warn!("Running query {} uncached: {err}", query.id());
                return execute();
            }
        };

        if let Some(cached) = self.store.fetch(&key, &self.codec) {
            return Ok(cached);
        }

        let result = execute()?;
        self.store.store(&key, action.ttl, &self.codec, &result);
        Ok(result)
    }

    /// Starts propagating rule changes through the store.
    pub fn start_sync(&self) -> CacheResult<()> {
        self.sync.start()
    }

    /// Stops rule propagation.
    pub fn stop_sync(&self) {
        self.sync.stop()
    }

    pub fn rules(&self) -> &Arc<RuleSet> {
        &self.rules
    }

    pub fn registry(&self) -> &QueryRegistry {
        &self.registry
    }

    pub fn store(&self) -> &CacheStore<M> {
        &self.store
    }

    pub fn sync(&self) -> &ConfigSync<M> {
        &self.sync
    }

    pub fn codec(&self) -> &ResultCodec {
        &self.codec
    }

    /// Builder for result keys, `{namespace}{sep}cache`.
    pub fn keys(&self) -> &KeyBuilder {
        &self.keys
    }
}
