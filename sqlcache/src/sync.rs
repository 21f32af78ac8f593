//! Propagation of rule changes between processes through the store.
//!
//! Every process shares one record at `{namespace}{sep}config`. In
//! [`SyncMode::Poll`] it is a JSON document that is re-read on an interval;
//! in [`SyncMode::Stream`] it is a Redis stream whose entries each carry a
//! complete rule list under the `rules` field, tailed with a bounded
//! blocking read. Either way a received rule list atomically replaces the
//! live [`RuleSet`]. Updates are best-effort and eventually consistent.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, error, warn};
use r2d2::{ManageConnection, Pool, PooledConnection};
use redis::streams::{StreamRangeReply, StreamReadReply};
use redis::{ConnectionLike, Value};

use crate::config::SyncMode;
use crate::errors::CacheResult;
use crate::keys::KeyBuilder;
use crate::rules::{rules_from_json, rules_to_json, Rule, RuleSet};

/// Stream entry field holding the rule list.
pub const RULES_FIELD: &str = "rules";

/// Key part under the namespace for the shared record.
pub const CONFIG_KEY: &str = "config";

struct Worker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Keeps a [`RuleSet`] in step with the shared config record.
pub struct ConfigSync<M>
where
    M: ManageConnection,
{
    pool: Pool<M>,
    rules: Arc<RuleSet>,
    key: String,
    mode: SyncMode,
    worker: Mutex<Option<Worker>>,
}

impl<M: ManageConnection> fmt::Debug for ConfigSync<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigSync")
            .field("key", &self.key)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl<M> ConfigSync<M>
where
    M: ManageConnection,
    M::Connection: ConnectionLike,
{
    /// Creates a sync for `rules` using the `config` key under `keys`.
    pub fn new(pool: Pool<M>, rules: Arc<RuleSet>, keys: &KeyBuilder, mode: SyncMode) -> Self {
        ConfigSync {
            pool,
            rules,
            key: keys.key(CONFIG_KEY),
            mode,
            worker: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The rule set being kept in sync.
    pub fn rule_set(&self) -> &Arc<RuleSet> {
        &self.rules
    }

    /// A snapshot of the current rules.
    pub fn get(&self) -> Arc<Vec<Rule>> {
        self.rules.rules()
    }

    pub fn is_running(&self) -> bool {
        self.lock_worker().is_some()
    }

    /// Publishes the local rules if no shared record exists yet, otherwise
    /// adopts the shared ones, then starts the background reader. Calling it
    /// again while running does nothing.
    ///
    /// The reader keeps one connection from the pool for as long as it runs.
    pub fn start(&self) -> CacheResult<()> {
        let mut worker = self.lock_worker();
        if worker.is_some() {
            return Ok(());
        }

        if self.pool.max_size() < 2 {
            warn!(
                "Config sync holds one of {} pooled connections, cache access will wait",
                self.pool.max_size()
            );
        }

        let mut con = self.pool.get()?;
        let reader = match self.mode {
            SyncMode::Poll { interval } => {
                self.bootstrap_document(&mut con)?;
                Reader::Poll { interval }
            }
            SyncMode::Stream { block } => Reader::Tail {
                block,
                cursor: self.bootstrap_stream(&mut con)?,
            },
        };

        let (stop, stop_rx) = bounded(1);
        let state = SyncState {
            pool: self.pool.clone(),
            rules: self.rules.clone(),
            key: self.key.clone(),
            con: Some(con),
            stop: stop_rx,
        };
        let handle = thread::Builder::new()
            .name("sqlcache-config-sync".to_string())
            .spawn(move || match reader {
                Reader::Poll { interval } => state.poll(interval),
                Reader::Tail { block, cursor } => state.tail(block, cursor),
            })?;

        debug!("Started config sync on {}", self.key);
        *worker = Some(Worker { stop, handle });
        Ok(())
    }

    /// Stops the background reader and releases its connection. Safe to call
    /// at any time, including after a failed [`ConfigSync::start`].
    pub fn stop(&self) {
        let Some(worker) = self.lock_worker().take() else {
            return;
        };
        let _ = worker.stop.send(());
        if worker.handle.join().is_err() {
            error!("Config sync thread for {} panicked", self.key);
        }
        debug!("Stopped config sync on {}", self.key);
    }

    /// Replaces the local rules and writes them to the shared record so
    /// other processes pick them up.
    pub fn publish(&self, rules: Vec<Rule>) -> CacheResult<()> {
        let json = rules_to_json(&rules)?;
        let mut con = self.pool.get()?;
        match self.mode {
            SyncMode::Poll { .. } => {
                redis::cmd("SET")
                    .arg(&self.key)
                    .arg(&json)
                    .query::<()>(&mut *con)?;
            }
            SyncMode::Stream { .. } => {
                redis::cmd("XADD")
                    .arg(&self.key)
                    .arg("*")
                    .arg(RULES_FIELD)
                    .arg(&json)
                    .query::<()>(&mut *con)?;
            }
        }
        self.rules.replace(rules);
        Ok(())
    }

    fn bootstrap_document(&self, con: &mut PooledConnection<M>) -> CacheResult<()> {
        let json = rules_to_json(&self.rules.rules())?;
        let created: Value = redis::cmd("SET")
            .arg(&self.key)
            .arg(&json)
            .arg("NX")
            .query(&mut **con)?;
        if created != Value::Nil {
            debug!("Created shared config at {}", self.key);
            return Ok(());
        }

        let existing: Option<String> = redis::cmd("GET").arg(&self.key).query(&mut **con)?;
        if let Some(existing) = existing {
            merge(&self.rules, &existing);
        }
        Ok(())
    }

    /// Adopts the newest entry, or appends the local rules to an empty
    /// stream. Returns the id to tail from.
    ///
    /// The emptiness check and the append are separate commands, so two
    /// processes starting against an empty stream can both append. Each then
    /// tails from its own entry and sees the later one, so both end up on
    /// the rules appended last.
    fn bootstrap_stream(&self, con: &mut PooledConnection<M>) -> CacheResult<String> {
        let latest: StreamRangeReply = redis::cmd("XREVRANGE")
            .arg(&self.key)
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(1)
            .query(&mut **con)?;

        if let Some(entry) = latest.ids.first() {
            match entry.get::<String>(RULES_FIELD) {
                Some(json) => merge(&self.rules, &json),
                None => warn!("Config entry {} has no {RULES_FIELD} field", entry.id),
            }
            return Ok(entry.id.clone());
        }

        let json = rules_to_json(&self.rules.rules())?;
        let id: String = redis::cmd("XADD")
            .arg(&self.key)
            .arg("*")
            .arg(RULES_FIELD)
            .arg(&json)
            .query(&mut **con)?;
        debug!("Created shared config stream at {}", self.key);
        Ok(id)
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<M: ManageConnection> Drop for ConfigSync<M> {
    fn drop(&mut self) {
        let worker = self
            .worker
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(worker) = worker {
            let _ = worker.stop.send(());
            let _ = worker.handle.join();
        }
    }
}

enum Reader {
    Poll { interval: Duration },
    Tail { block: Duration, cursor: String },
}

/// Applies a serialized rule list. Malformed input leaves the current rules
/// untouched.
fn merge(rules: &RuleSet, json: &str) {
    match rules_from_json(json) {
        Ok(new) => {
            if *rules.rules() != new {
                rules.replace(new);
            }
        }
        Err(err) => warn!("Ignoring rule update: {err}"),
    }
}

/// Everything the background thread owns.
struct SyncState<M: ManageConnection> {
    pool: Pool<M>,
    rules: Arc<RuleSet>,
    key: String,
    con: Option<PooledConnection<M>>,
    stop: Receiver<()>,
}

impl<M> SyncState<M>
where
    M: ManageConnection,
    M::Connection: ConnectionLike,
{
    fn poll(mut self, interval: Duration) {
        loop {
            match self.stop.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            }
            let Some(con) = connection(&self.pool, &mut self.con) else {
                continue;
            };
            match redis::cmd("GET")
                .arg(&self.key)
                .query::<Option<String>>(&mut **con)
            {
                Ok(Some(json)) => merge(&self.rules, &json),
                Ok(None) => {}
                Err(err) => self.drop_connection(err),
            }
        }
    }

    fn tail(mut self, block: Duration, mut cursor: String) {
        let block_ms = u64::try_from(block.as_millis()).unwrap_or(u64::MAX).max(1);
        loop {
            match self.stop.try_recv() {
                Err(TryRecvError::Empty) => {}
                Ok(()) | Err(TryRecvError::Disconnected) => return,
            }
            let Some(con) = connection(&self.pool, &mut self.con) else {
                if self.wait(block) {
                    return;
                }
                continue;
            };

            let reply = redis::cmd("XREAD")
                .arg("BLOCK")
                .arg(block_ms)
                .arg("STREAMS")
                .arg(&self.key)
                .arg(&cursor)
                .query::<Option<StreamReadReply>>(&mut **con);
            match reply {
                Ok(Some(reply)) => {
                    for entry in reply.keys.iter().flat_map(|k| k.ids.iter()) {
                        cursor.clone_from(&entry.id);
                        match entry.get::<String>(RULES_FIELD) {
                            Some(json) => merge(&self.rules, &json),
                            None => warn!("Config entry {} has no {RULES_FIELD} field", entry.id),
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    self.drop_connection(err);
                    if self.wait(block) {
                        return;
                    }
                }
            }
        }
    }

    /// Returns true if stop was requested while waiting.
    fn wait(&self, timeout: Duration) -> bool {
        !matches!(
            self.stop.recv_timeout(timeout),
            Err(RecvTimeoutError::Timeout)
        )
    }

    fn drop_connection(&mut self, err: redis::RedisError) {
        warn!("Config sync read of {} failed: {err}", self.key);
        self.con = None;
    }
}

/// The held connection, re-acquired from the pool if it was dropped.
///
/// Takes the two fields rather than the whole state so callers can keep
/// reading the key while the connection is borrowed.
fn connection<'a, M: ManageConnection>(
    pool: &Pool<M>,
    con: &'a mut Option<PooledConnection<M>>,
) -> Option<&'a mut PooledConnection<M>> {
    if con.is_none() {
        match pool.get() {
            Ok(fresh) => *con = Some(fresh),
            Err(err) => {
                warn!("Config sync could not obtain a connection: {err}");
                return None;
            }
        }
    }
    con.as_mut()
}
