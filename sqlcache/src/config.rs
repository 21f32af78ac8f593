use std::num::NonZeroUsize;
use std::time::Duration;

use crate::codec::DEFAULT_MAX_BUFFER_SIZE;
use crate::keys::DEFAULT_SEPARATOR;
use crate::registry::DEFAULT_REGISTRY_SIZE;

/// Default key namespace.
pub const DEFAULT_NAMESPACE: &str = "sqlcache";

/// Sizing and timeouts for the store connection pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    pub(crate) max_size: u32,
    pub(crate) min_idle: Option<u32>,
    pub(crate) connection_timeout: Duration,
    pub(crate) idle_timeout: Option<Duration>,
}

impl PoolConfig {
    /// Creates a PoolConfig with default values (8 connections, 1 kept idle,
    /// 2 seconds wait timeout, idle connections closed after 5 minutes).
    pub fn new() -> Self {
        PoolConfig {
            max_size: 8,
            min_idle: Some(1),
            connection_timeout: Duration::from_secs(2),
            idle_timeout: Some(Duration::from_secs(5 * 60)),
        }
    }

    /// Sets the maximum number of open connections. Zero is raised to one.
    ///
    /// A running config sync keeps one of these for itself, so use at least
    /// two when sync is started.
    pub fn set_max_size(mut self, max_size: u32) -> Self {
        self.max_size = max_size.max(1);
        self
    }

    /// Sets how many idle connections the pool tries to keep open.
    pub fn set_min_idle(mut self, min_idle: Option<u32>) -> Self {
        self.min_idle = min_idle;
        self
    }

    /// Sets how long a caller waits for a free connection before the store
    /// reports itself unavailable.
    pub fn set_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Sets after how long an idle connection is closed.
    pub fn set_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn max_size(&self) -> u32 {
        self.max_size
    }

    pub fn connection_timeout(&self) -> Duration {
        self.connection_timeout
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig::new()
    }
}

/// How rule updates travel between processes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncMode {
    /// The config key holds one JSON document, re-read every `interval`.
    Poll { interval: Duration },
    /// The config key is a stream; each entry is a complete rule list. The
    /// reader blocks for at most `block` per read so it can notice shutdown.
    Stream { block: Duration },
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::Poll {
            interval: Duration::from_secs(30),
        }
    }
}

/// Configuration for the query cache.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub(crate) namespace: String,
    pub(crate) separator: String,
    pub(crate) max_buffer_size: usize,
    pub(crate) registry_size: NonZeroUsize,
    pub(crate) pool: PoolConfig,
    pub(crate) sync_mode: SyncMode,
}

impl CacheConfig {
    /// Creates new CacheConfig with default values (namespace `sqlcache`,
    /// separator `:`, 10 MiB buffers, 10_000 remembered statements).
    pub fn new() -> Self {
        CacheConfig {
            namespace: DEFAULT_NAMESPACE.to_string(),
            separator: DEFAULT_SEPARATOR.to_string(),
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            registry_size: NonZeroUsize::new(DEFAULT_REGISTRY_SIZE).unwrap_or(NonZeroUsize::MIN),
            pool: PoolConfig::new(),
            sync_mode: SyncMode::default(),
        }
    }

    /// Sets the prefix of every key this cache writes.
    pub fn set_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Sets the separator placed between key parts.
    pub fn set_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    /// Sets the largest encoded result that will be cached.
    pub fn set_max_buffer_size(mut self, size: usize) -> Self {
        self.max_buffer_size = size;
        self
    }

    /// Sets how many distinct statements are remembered.
    pub fn set_registry_size(mut self, size: NonZeroUsize) -> Self {
        self.registry_size = size;
        self
    }

    /// Sets the connection pool configuration.
    pub fn set_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Sets how rule updates are propagated.
    pub fn set_sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    pub fn max_buffer_size(&self) -> usize {
        self.max_buffer_size
    }

    pub fn registry_size(&self) -> NonZeroUsize {
        self.registry_size
    }

    pub fn pool(&self) -> &PoolConfig {
        &self.pool
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.sync_mode
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig::new()
    }
}
