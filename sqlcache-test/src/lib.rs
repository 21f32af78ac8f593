//! Testing support
//!
//! This crate provides [`FakeRedis`], an in-memory stand-in for the handful
//! of Redis commands sqlcache issues. Connections to it implement
//! `redis::ConnectionLike`, and [`FakeConnectionManager`] hands them out
//! through an `r2d2` pool, so the real store and sync code paths run
//! unchanged without a server.
//!
//! # Example
//!
//! ```rust
//! use redis::ConnectionLike;
//! use sqlcache_test::FakeRedis;
//!
//! let redis = FakeRedis::new();
//! let mut con = redis.connection();
//! let _: () = redis::cmd("SET").arg("k").arg("v").arg("EX").arg(60).query(&mut con).unwrap();
//! let value: Option<String> = redis::cmd("GET").arg("k").query(&mut con).unwrap();
//!
//! assert_eq!(value.as_deref(), Some("v"));
//! assert_eq!(redis.calls("SET"), 1);
//! assert!(con.is_open());
//! ```

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use redis::{ConnectionLike, RedisError, RedisResult, Value};

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

type StreamEntry = (u64, Vec<(Vec<u8>, Vec<u8>)>);

#[derive(Default)]
struct State {
    strings: HashMap<Vec<u8>, Entry>,
    streams: HashMap<Vec<u8>, Vec<StreamEntry>>,
    last_stream_seq: u64,
    calls: HashMap<String, usize>,
    down: bool,
}

struct Shared {
    state: Mutex<State>,
    appended: Condvar,
}

/// An in-memory Redis double shared by every connection made from it.
#[derive(Clone)]
pub struct FakeRedis {
    shared: Arc<Shared>,
}

impl Default for FakeRedis {
    fn default() -> Self {
        FakeRedis::new()
    }
}

impl FakeRedis {
    pub fn new() -> Self {
        FakeRedis {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                appended: Condvar::new(),
            }),
        }
    }

    /// Opens a connection.
    pub fn connection(&self) -> FakeConnection {
        FakeConnection {
            redis: self.clone(),
            open: true,
        }
    }

    /// An `r2d2` manager that connects to this instance.
    pub fn manager(&self) -> FakeConnectionManager {
        FakeConnectionManager {
            redis: self.clone(),
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// How many times a command (case-insensitive) was received.
    pub fn calls(&self, command: &str) -> usize {
        self.lock()
            .calls
            .get(&command.to_ascii_uppercase())
            .copied()
            .unwrap_or(0)
    }

    /// How many commands were received in total.
    pub fn total_calls(&self) -> usize {
        self.lock().calls.values().sum()
    }

    /// Simulates an outage: new connections are refused and every command
    /// fails with an I/O error.
    pub fn set_down(&self, down: bool) {
        self.lock().down = down;
    }

    /// Expires every key that has a TTL, as if the TTLs had run out.
    pub fn expire_all(&self) {
        self.lock()
            .strings
            .retain(|_, entry| entry.expires_at.is_none());
    }

    /// The raw value under `key`, if live.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        self.lock()
            .strings
            .get(key.as_bytes())
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone())
    }

    /// Writes a value without expiry, bypassing the call counters.
    pub fn set(&self, key: &str, value: impl Into<Vec<u8>>) {
        self.lock().strings.insert(
            key.as_bytes().to_vec(),
            Entry {
                value: value.into(),
                expires_at: None,
            },
        );
    }

    /// `None` if the key is missing, `Some(None)` if it has no expiry,
    /// otherwise the remaining time to live.
    pub fn ttl(&self, key: &str) -> Option<Option<Duration>> {
        let now = Instant::now();
        self.lock()
            .strings
            .get(key.as_bytes())
            .filter(|e| e.is_live(now))
            .map(|e| e.expires_at.map(|at| at.saturating_duration_since(now)))
    }

    /// Every live string key, sorted.
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .lock()
            .strings
            .iter()
            .filter(|(_, e)| e.is_live(now))
            .map(|(k, _)| String::from_utf8_lossy(k).into_owned())
            .collect();
        keys.sort();
        keys
    }

    /// Number of entries in a stream.
    pub fn stream_len(&self, key: &str) -> usize {
        self.lock()
            .streams
            .get(key.as_bytes())
            .map_or(0, Vec::len)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn execute(&self, args: Vec<Vec<u8>>) -> RedisResult<Value> {
        let mut args = args.into_iter();
        let name = args
            .next()
            .map(|n| String::from_utf8_lossy(&n).to_ascii_uppercase())
            .ok_or_else(|| protocol_error("empty command"))?;
        let args: Vec<Vec<u8>> = args.collect();

        let mut state = self.lock();
        *state.calls.entry(name.clone()).or_default() += 1;
        if state.down {
            return Err(RedisError::from(io::Error::from(
                io::ErrorKind::ConnectionReset,
            )));
        }

        match name.as_str() {
            "PING" => Ok(Value::SimpleString("PONG".to_string())),
            "GET" => {
                let key = arg(&args, 0)?;
                let now = Instant::now();
                Ok(state
                    .strings
                    .get(key)
                    .filter(|e| e.is_live(now))
                    .map_or(Value::Nil, |e| Value::BulkString(e.value.clone())))
            }
            "SET" => set(&mut state, &args),
            "DEL" => {
                let removed = args
                    .iter()
                    .filter(|k| {
                        state.strings.remove(*k).is_some() || state.streams.remove(*k).is_some()
                    })
                    .count();
                Ok(Value::Int(removed as i64))
            }
            "XADD" => {
                let value = xadd(&mut state, &args)?;
                self.shared.appended.notify_all();
                Ok(value)
            }
            "XREVRANGE" => xrevrange(&state, &args),
            "XREAD" => {
                let (block, key, after) = parse_xread(&args, &state)?;
                let deadline = Instant::now() + block;
                loop {
                    let entries = entries_after(&state, &key, after);
                    if !entries.is_empty() {
                        return Ok(Value::Array(vec![Value::Array(vec![
                            Value::BulkString(key),
                            Value::Array(entries),
                        ])]));
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(Value::Nil);
                    }
                    state = self
                        .shared
                        .appended
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0;
                }
            }
            other => Err(protocol_error(&format!("unknown command {other}"))),
        }
    }
}

fn protocol_error(detail: &str) -> RedisError {
    RedisError::from(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("ERR {detail}"),
    ))
}

fn arg(args: &[Vec<u8>], idx: usize) -> RedisResult<&[u8]> {
    args.get(idx)
        .map(Vec::as_slice)
        .ok_or_else(|| protocol_error("wrong number of arguments"))
}

fn arg_str(args: &[Vec<u8>], idx: usize) -> RedisResult<String> {
    Ok(String::from_utf8_lossy(arg(args, idx)?).to_ascii_uppercase())
}

fn arg_u64(args: &[Vec<u8>], idx: usize) -> RedisResult<u64> {
    String::from_utf8_lossy(arg(args, idx)?)
        .parse()
        .map_err(|_| protocol_error("value is not an integer"))
}

fn set(state: &mut State, args: &[Vec<u8>]) -> RedisResult<Value> {
    let key = arg(args, 0)?.to_vec();
    let value = arg(args, 1)?.to_vec();
    let mut expires_at = None;
    let mut nx = false;

    let mut idx = 2;
    while idx < args.len() {
        match arg_str(args, idx)?.as_str() {
            "EX" => {
                idx += 1;
                expires_at = Some(Instant::now() + Duration::from_secs(arg_u64(args, idx)?));
            }
            "PX" => {
                idx += 1;
                expires_at = Some(Instant::now() + Duration::from_millis(arg_u64(args, idx)?));
            }
            "NX" => nx = true,
            other => return Err(protocol_error(&format!("unsupported SET option {other}"))),
        }
        idx += 1;
    }

    let now = Instant::now();
    if nx && state.strings.get(&key).is_some_and(|e| e.is_live(now)) {
        return Ok(Value::Nil);
    }
    state.strings.insert(key, Entry { value, expires_at });
    Ok(Value::Okay)
}

fn stream_id(seq: u64) -> String {
    format!("{seq}-0")
}

fn parse_stream_id(id: &[u8]) -> RedisResult<u64> {
    let id = String::from_utf8_lossy(id);
    id.split('-')
        .next()
        .and_then(|ms| ms.parse().ok())
        .ok_or_else(|| protocol_error("invalid stream ID"))
}

fn entry_value(seq: u64, fields: &[(Vec<u8>, Vec<u8>)]) -> Value {
    let mut flat = Vec::with_capacity(fields.len() * 2);
    for (field, value) in fields {
        flat.push(Value::BulkString(field.clone()));
        flat.push(Value::BulkString(value.clone()));
    }
    Value::Array(vec![
        Value::BulkString(stream_id(seq).into_bytes()),
        Value::Array(flat),
    ])
}

fn xadd(state: &mut State, args: &[Vec<u8>]) -> RedisResult<Value> {
    let key = arg(args, 0)?.to_vec();
    if arg(args, 1)? != b"*" {
        return Err(protocol_error("only auto-generated IDs are supported"));
    }
    let fields = &args[2..];
    if fields.is_empty() || fields.len() % 2 != 0 {
        return Err(protocol_error("wrong number of arguments for XADD"));
    }
    let fields = fields
        .chunks(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect();

    state.last_stream_seq += 1;
    let seq = state.last_stream_seq;
    state.streams.entry(key).or_default().push((seq, fields));
    Ok(Value::BulkString(stream_id(seq).into_bytes()))
}

fn xrevrange(state: &State, args: &[Vec<u8>]) -> RedisResult<Value> {
    let key = arg(args, 0)?;
    let count = if args.len() >= 5 && arg_str(args, 3)? == "COUNT" {
        arg_u64(args, 4)? as usize
    } else {
        usize::MAX
    };
    let entries = state
        .streams
        .get(key)
        .map(|entries| {
            entries
                .iter()
                .rev()
                .take(count)
                .map(|(seq, fields)| entry_value(*seq, fields))
                .collect()
        })
        .unwrap_or_default();
    Ok(Value::Array(entries))
}

fn parse_xread(args: &[Vec<u8>], state: &State) -> RedisResult<(Duration, Vec<u8>, u64)> {
    let mut block = Duration::ZERO;
    let mut idx = 0;
    if arg_str(args, idx)? == "BLOCK" {
        block = Duration::from_millis(arg_u64(args, idx + 1)?);
        idx += 2;
    }
    if arg_str(args, idx)? != "STREAMS" {
        return Err(protocol_error("only BLOCK and STREAMS are supported"));
    }
    let key = arg(args, idx + 1)?.to_vec();
    let id = arg(args, idx + 2)?;
    let after = if id == b"$" {
        state
            .streams
            .get(&key)
            .and_then(|e| e.last())
            .map_or(0, |(seq, _)| *seq)
    } else {
        parse_stream_id(id)?
    };
    Ok((block, key, after))
}

fn entries_after(state: &State, key: &[u8], after: u64) -> Vec<Value> {
    state
        .streams
        .get(key)
        .map(|entries| {
            entries
                .iter()
                .filter(|(seq, _)| *seq > after)
                .map(|(seq, fields)| entry_value(*seq, fields))
                .collect()
        })
        .unwrap_or_default()
}

/// A connection to a [`FakeRedis`].
pub struct FakeConnection {
    redis: FakeRedis,
    open: bool,
}

impl FakeConnection {
    /// Marks the connection as broken so a pool discards it on return.
    pub fn close(&mut self) {
        self.open = false;
    }
}

impl ConnectionLike for FakeConnection {
    fn req_packed_command(&mut self, cmd: &[u8]) -> RedisResult<Value> {
        let args = match redis::parse_redis_value(cmd)? {
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::BulkString(bytes) => Ok(bytes),
                    _ => Err(protocol_error("expected bulk string arguments")),
                })
                .collect::<RedisResult<Vec<_>>>()?,
            _ => return Err(protocol_error("expected a command array")),
        };
        let result = self.redis.execute(args);
        if result.as_ref().is_err_and(|err| err.is_io_error()) && self.redis.lock().down {
            self.open = false;
        }
        result
    }

    fn req_packed_commands(
        &mut self,
        _cmd: &[u8],
        _offset: usize,
        _count: usize,
    ) -> RedisResult<Vec<Value>> {
        Err(protocol_error("pipelines are not supported"))
    }

    fn get_db(&self) -> i64 {
        0
    }

    fn check_connection(&mut self) -> bool {
        self.open && !self.redis.lock().down
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

/// Hands out [`FakeConnection`]s to an `r2d2` pool, counting connects.
#[derive(Clone)]
pub struct FakeConnectionManager {
    redis: FakeRedis,
    connects: Arc<AtomicUsize>,
}

impl FakeConnectionManager {
    /// How many connections the pool has opened.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::Relaxed)
    }
}

impl r2d2::ManageConnection for FakeConnectionManager {
    type Connection = FakeConnection;
    type Error = RedisError;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        if self.redis.lock().down {
            return Err(RedisError::from(io::Error::from(
                io::ErrorKind::ConnectionRefused,
            )));
        }
        self.connects.fetch_add(1, Ordering::Relaxed);
        Ok(self.redis.connection())
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        if conn.check_connection() {
            Ok(())
        } else {
            Err(RedisError::from(io::Error::from(io::ErrorKind::BrokenPipe)))
        }
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        !conn.is_open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_with_nx_only_writes_once() {
        let redis = FakeRedis::new();
        let mut con = redis.connection();
        let mut set_nx = |value: &str| -> Value {
            redis::cmd("SET")
                .arg("k")
                .arg(value)
                .arg("NX")
                .query(&mut con)
                .unwrap()
        };
        let first = set_nx("a");
        let second = set_nx("b");
        assert_eq!(first, Value::Okay);
        assert_eq!(second, Value::Nil);
        assert_eq!(redis.get("k"), Some(b"a".to_vec()));
    }

    #[test]
    fn expire_all_drops_only_expiring_keys() {
        let redis = FakeRedis::new();
        let mut con = redis.connection();
        let _: () = redis::cmd("SET")
            .arg("t")
            .arg("1")
            .arg("EX")
            .arg(60)
            .query(&mut con)
            .unwrap();
        let _: () = redis::cmd("SET").arg("p").arg("1").query(&mut con).unwrap();
        assert!(redis.ttl("t").unwrap().is_some());
        assert_eq!(redis.ttl("p"), Some(None));

        redis.expire_all();
        assert_eq!(redis.keys(), vec!["p".to_string()]);
    }

    #[test]
    fn xread_returns_new_entries_or_times_out() {
        let redis = FakeRedis::new();
        let mut con = redis.connection();
        let id: String = redis::cmd("XADD")
            .arg("s")
            .arg("*")
            .arg("f")
            .arg("v")
            .query(&mut con)
            .unwrap();

        let none: Value = redis::cmd("XREAD")
            .arg("BLOCK")
            .arg(10)
            .arg("STREAMS")
            .arg("s")
            .arg(&id)
            .query(&mut con)
            .unwrap();
        assert_eq!(none, Value::Nil);

        let all: Value = redis::cmd("XREAD")
            .arg("STREAMS")
            .arg("s")
            .arg("0")
            .query(&mut con)
            .unwrap();
        assert_ne!(all, Value::Nil);
        assert_eq!(redis.stream_len("s"), 1);
    }

    #[test]
    fn outage_fails_commands_and_connects() {
        let redis = FakeRedis::new();
        let manager = redis.manager();
        let mut con = r2d2::ManageConnection::connect(&manager).unwrap();
        redis.set_down(true);
        assert!(redis::cmd("GET").arg("k").query::<Option<Vec<u8>>>(&mut con).is_err());
        assert!(!con.is_open());
        assert!(r2d2::ManageConnection::connect(&manager).is_err());
        assert_eq!(manager.connects(), 1);
    }
}
