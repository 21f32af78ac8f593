use std::collections::BTreeSet;
use std::error::Error;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;
use lru::LruCache;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::rules::normalize_tables;

/// Default number of statements the registry remembers.
pub const DEFAULT_REGISTRY_SIZE: usize = 10_000;

/// Stable id of a SQL text: the CRC32 of its UTF-8 bytes.
///
/// Good enough to partition the cache, but two different statements can
/// share an id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryId(pub u32);

impl QueryId {
    pub fn of(sql: &str) -> QueryId {
        QueryId(crc32fast::hash(sql.as_bytes()))
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The memoized identity of a SQL statement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Query {
    id: QueryId,
    sql: String,
    tables: BTreeSet<String>,
}

impl Query {
    /// Creates a query. Table names are expected lower-cased.
    pub fn new(sql: impl Into<String>, tables: BTreeSet<String>) -> Self {
        let sql = sql.into();
        Query {
            id: QueryId::of(&sql),
            sql,
            tables,
        }
    }

    pub fn id(&self) -> QueryId {
        self.id
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Referenced tables; empty if none or if the SQL could not be parsed.
    pub fn tables(&self) -> &BTreeSet<String> {
        &self.tables
    }
}

/// Error type table extractors may return.
pub type ExtractError = Box<dyn Error + Send + Sync>;

/// Finds the tables a SQL statement references.
///
/// Failures are never fatal: the registry turns them into an empty table set.
pub trait TableExtractor: Send + Sync {
    fn extract(&self, sql: &str) -> Result<BTreeSet<String>, ExtractError>;
}

impl<F> TableExtractor for F
where
    F: Fn(&str) -> Result<BTreeSet<String>, ExtractError> + Send + Sync,
{
    fn extract(&self, sql: &str) -> Result<BTreeSet<String>, ExtractError> {
        self(sql)
    }
}

/// Picks up the table following `FROM`, `JOIN`, `UPDATE` and `INTO`, plus
/// comma-separated tables directly after `FROM`.
///
/// Not a SQL parser; plug in a real one through [`TableExtractor`] where the
/// statements warrant it.
#[derive(Clone, Debug)]
pub struct SimpleTableExtractor {
    keyword: Regex,
    list_tail: Regex,
}

impl Default for SimpleTableExtractor {
    fn default() -> Self {
        SimpleTableExtractor::new()
    }
}

const IDENT: &str = r#"[A-Za-z_"`\[][\w$"`\]]*(?:\.[A-Za-z_"`\[][\w$"`\]]*)*"#;

impl SimpleTableExtractor {
    pub fn new() -> Self {
        // Both patterns are constant and known to compile.
        let keyword = Regex::new(&format!(r"(?i)\b(from|join|update|into)\s+({IDENT})"))
            .unwrap_or_else(|err| unreachable!("table pattern: {err}"));
        let list_tail = Regex::new(&format!(r"^(?:\s+(?:as\s+)?\w+)?\s*,\s*({IDENT})"))
            .unwrap_or_else(|err| unreachable!("list pattern: {err}"));
        SimpleTableExtractor { keyword, list_tail }
    }
}

fn unquote(ident: &str) -> String {
    ident
        .chars()
        .filter(|c| !matches!(c, '"' | '`' | '[' | ']'))
        .collect()
}

impl TableExtractor for SimpleTableExtractor {
    fn extract(&self, sql: &str) -> Result<BTreeSet<String>, ExtractError> {
        let mut tables = Vec::new();
        for caps in self.keyword.captures_iter(sql) {
            let table = &caps[2];
            if table.eq_ignore_ascii_case("select") {
                continue;
            }
            tables.push(unquote(table));

            if caps[1].eq_ignore_ascii_case("from") {
                let mut rest = &sql[caps.get(2).map_or(sql.len(), |m| m.end())..];
                while let Some(more) = self.list_tail.captures(rest) {
                    tables.push(unquote(&more[1]));
                    rest = &rest[more.get(0).map_or(rest.len(), |m| m.end())..];
                }
            }
        }
        Ok(normalize_tables(tables))
    }
}

/// Bounded, least-recently-used map from SQL text to its [`Query`].
pub struct QueryRegistry {
    queries: Mutex<LruCache<String, Arc<Query>>>,
    extractor: Box<dyn TableExtractor>,
}

impl fmt::Debug for QueryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryRegistry")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl QueryRegistry {
    pub fn new<E>(capacity: NonZeroUsize, extractor: E) -> Self
    where
        E: TableExtractor + 'static,
    {
        QueryRegistry {
            queries: Mutex::new(LruCache::new(capacity)),
            extractor: Box::new(extractor),
        }
    }

    /// Returns the memoized query for `sql`, creating it on first sight.
    pub fn get_or_create(&self, sql: &str) -> Arc<Query> {
        if let Some(query) = self.get(sql) {
            return query;
        }

        // Extraction can be slow, so it runs without the lock held.
        let tables = match self.extractor.extract(sql) {
            Ok(tables) => normalize_tables(tables),
            Err(err) => {
                debug!("Could not extract tables, caching rules on tables won't apply: {err}");
                BTreeSet::new()
            }
        };
        let query = Arc::new(Query::new(sql, tables));

        let mut queries = self.lock();
        if let Some(existing) = queries.get(sql) {
            return existing.clone();
        }
        queries.put(sql.to_string(), query.clone());
        query
    }

    /// Looks up a query and marks it as recently used.
    pub fn get(&self, sql: &str) -> Option<Arc<Query>> {
        self.lock().get(sql).cloned()
    }

    /// Checks for a query without touching its recency.
    pub fn contains(&self, sql: &str) -> bool {
        self.lock().contains(sql)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lock().cap().get()
    }

    /// Lock poisoning is recovered from; the map is never left half-updated.
    fn lock(&self) -> MutexGuard<'_, LruCache<String, Arc<Query>>> {
        self.queries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tables(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|t| t.to_string()).collect()
    }

    fn registry(capacity: usize) -> QueryRegistry {
        QueryRegistry::new(
            NonZeroUsize::new(capacity).unwrap(),
            SimpleTableExtractor::new(),
        )
    }

    #[test]
    fn query_id_is_crc32_of_text() {
        assert_eq!(QueryId::of("SELECT 1"), QueryId::of("SELECT 1"));
        assert_ne!(QueryId::of("SELECT 1"), QueryId::of("SELECT 2"));
        // Well-known CRC32 check value.
        assert_eq!(QueryId::of("123456789"), QueryId(0xCBF4_3926));
    }

    #[test]
    fn simple_extractor_finds_tables() {
        let e = SimpleTableExtractor::new();
        assert_eq!(
            e.extract("SELECT * FROM Orders o JOIN customers c ON o.cid = c.id")
                .unwrap(),
            tables(&["orders", "customers"])
        );
        assert_eq!(
            e.extract("select a.x from a, b as bb, public.c where 1=1")
                .unwrap(),
            tables(&["a", "b", "public.c"])
        );
        assert_eq!(
            e.extract("UPDATE \"items\" SET n = 1").unwrap(),
            tables(&["items"])
        );
        assert_eq!(
            e.extract("INSERT INTO log (m) VALUES (1)").unwrap(),
            tables(&["log"])
        );
        assert!(e.extract("SELECT 1").unwrap().is_empty());
    }

    #[test]
    fn extractor_failure_degrades_to_no_tables() {
        let registry = QueryRegistry::new(
            NonZeroUsize::new(4).unwrap(),
            |_: &str| -> Result<BTreeSet<String>, ExtractError> { Err("cannot parse".into()) },
        );
        let query = registry.get_or_create("SELEKT ???");
        assert!(query.tables().is_empty());
        assert_eq!(query.id(), QueryId::of("SELEKT ???"));
    }

    #[test]
    fn repeated_sql_is_memoized() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let registry = QueryRegistry::new(
            NonZeroUsize::new(4).unwrap(),
            move |_: &str| -> Result<BTreeSet<String>, ExtractError> {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(tables(&["t"]))
            },
        );
        let first = registry.get_or_create("select * from t");
        let second = registry.get_or_create("select * from t");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn evicts_least_recently_used() {
        let registry = registry(3);
        for n in 0..5 {
            registry.get_or_create(&format!("select {n}"));
        }
        assert_eq!(registry.len(), 3);
        assert!(!registry.contains("select 0"));
        assert!(!registry.contains("select 1"));
        assert!(registry.contains("select 2"));
        assert!(registry.contains("select 4"));
    }

    #[test]
    fn get_protects_from_eviction_but_contains_does_not() {
        let registry = registry(2);
        registry.get_or_create("select a");
        registry.get_or_create("select b");

        assert!(registry.get("select a").is_some());
        registry.get_or_create("select c");
        assert!(registry.contains("select a"));
        assert!(!registry.contains("select b"));

        // `contains` leaves "select a" as the oldest entry.
        assert!(registry.contains("select a"));
        registry.get_or_create("select d");
        assert!(!registry.contains("select a"));
        assert!(registry.contains("select c"));
    }
}
