//! sqlcache is a rule-driven cache for SQL query results, stored in Redis.
//!
//! It sits between a database client and the database. For every statement
//! it decides, from a live rule set, whether the result should be cached and
//! for how long; cached results are kept in Redis as compact binary blobs.
//!
//! # Basic Operation
//!
//! ```rust,no_run
//! use sqlcache::{CacheConfig, QueryCache, Rule, ResultSet, Ttl};
//!
//! fn run_query(sql: &str) -> Result<ResultSet, std::io::Error> {
//!     /* talk to the database */
//! #   Ok(ResultSet::default())
//! }
//!
//! fn main() -> sqlcache::CacheResult<()> {
//!     let rules = vec![
//!         Rule::tables(["orders"], Ttl::secs(60)),
//!         Rule::regex("(?i)select .* from audit_log.*", Ttl::NoCache)?,
//!     ];
//!     let cache = QueryCache::open("redis://127.0.0.1/", &CacheConfig::new(), rules)?;
//!     cache.start_sync()?;
//!
//!     let sql = "SELECT * FROM orders";
//!     let result = cache.query(sql, &[], || run_query(sql));
//!     # let _ = result;
//!     Ok(())
//! }
//! ```
//!
//! # Rules
//!
//! Rules are evaluated in order and **the last matching rule wins**. A
//! catch-all [`Rule::passthrough`] placed last therefore overrides every
//! other rule; place it first to make it a default instead.
//!
//! TTLs are in seconds: `0` never caches, `-1` caches without expiry.
//!
//! # Failure handling
//!
//! Caching is strictly best-effort. Store outages, pool exhaustion, results
//! too large for the buffer, unsupported column types and undecodable cache
//! entries all degrade to running the query uncached.
//!
//! # Keys
//!
//! Results live under `{namespace}{sep}cache{sep}{query id}`, with
//! `{sep}{parameter hash}` appended for parameterized statements. Query ids
//! are CRC32 checksums of the SQL text, so distinct statements can collide.
//! Shared rules live under `{namespace}{sep}config`.

#![deny(non_camel_case_types)]
#![warn(missing_debug_implementations)]

mod macros;

pub mod codec;
pub mod config;
mod context;
mod errors;
pub mod keys;
pub mod registry;
pub mod rules;
pub mod store;
pub mod sync;
pub mod types;

pub use crate::codec::ResultCodec;
pub use crate::config::{CacheConfig, PoolConfig, SyncMode};
pub use crate::context::{QueryCache, CACHE_KEY};
pub use crate::errors::{CacheError, CacheResult, ErrorKind};
pub use crate::keys::KeyBuilder;
pub use crate::registry::{Query, QueryId, QueryRegistry, SimpleTableExtractor, TableExtractor};
pub use crate::rules::{Action, Predicate, Rule, RuleChange, RuleSet, SubscriptionId, Ttl};
pub use crate::store::{CacheStatistics, CacheStore, LogMetrics, MetricsSink, NoopMetrics};
pub use crate::sync::ConfigSync;
pub use crate::types::{CellValue, ColumnDescriptor, Nullability, ResultSet};
