//! Ready-made in-memory keyspace handlers.
//!
//! Enough string and list commands to drive a client through realistic
//! scenarios without writing handlers by hand. Values live in a single
//! mutex-guarded map; there is no expiry.

use crate::connection::Connection;
use crate::server::StubServer;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

const WRONGTYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";
const NOT_AN_INTEGER: &str = "ERR value is not an integer or out of range";
const OVERFLOW: &str = "ERR increment or decrement would overflow";
const DECREMENT_OVERFLOW: &str = "ERR decrement would overflow";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Value {
    String(Bytes),
    List(VecDeque<Bytes>),
}

/// Shared state behind the fixture handlers. Keys and values are raw bytes.
#[derive(Debug, Default)]
pub struct Keyspace {
    entries: Mutex<HashMap<Bytes, Value>>,
}

impl Keyspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Seed or inspect string values directly from a test.
    pub fn set_string(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) {
        self.entries.lock().insert(
            Bytes::copy_from_slice(key.as_ref()),
            Value::String(Bytes::copy_from_slice(value.as_ref())),
        );
    }

    pub fn get_string(&self, key: impl AsRef<[u8]>) -> Option<Bytes> {
        match self.entries.lock().get(key.as_ref()) {
            Some(Value::String(s)) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn list(&self, key: impl AsRef<[u8]>) -> Option<Vec<Bytes>> {
        match self.entries.lock().get(key.as_ref()) {
            Some(Value::List(items)) => Some(items.iter().cloned().collect()),
            _ => None,
        }
    }
}

type Route = fn(&Keyspace, &Connection, &[Bytes]);

/// Register the keyspace commands on `server`, all sharing `keyspace`.
pub fn install(server: &StubServer, keyspace: Arc<Keyspace>) {
    let routes: [(&str, Route); 17] = [
        ("SET", set),
        ("GET", get),
        ("GETSET", getset),
        ("GETDEL", getdel),
        ("DEL", del),
        ("EXISTS", exists),
        ("INCR", |ks, conn, args| incr_by(ks, conn, "incr", args, Some(1))),
        ("DECR", |ks, conn, args| incr_by(ks, conn, "decr", args, Some(-1))),
        ("INCRBY", |ks, conn, args| incr_by(ks, conn, "incrby", args, None)),
        ("DECRBY", decrby),
        ("LPUSH", |ks, conn, args| push(ks, conn, "lpush", args, true)),
        ("RPUSH", |ks, conn, args| push(ks, conn, "rpush", args, false)),
        ("LPOP", |ks, conn, args| pop(ks, conn, "lpop", args, true)),
        ("RPOP", |ks, conn, args| pop(ks, conn, "rpop", args, false)),
        ("LLEN", llen),
        ("LRANGE", lrange),
        ("LINDEX", lindex),
    ];

    for (name, route) in routes {
        let keyspace = Arc::clone(&keyspace);
        server.register(name, move |conn, args| route(&keyspace, conn, args));
    }
    tracing::debug!("keyspace fixtures installed");
}

fn arity_error(conn: &Connection, command: &str) {
    conn.write_error(format!(
        "ERR wrong number of arguments for '{command}' command"
    ));
}

fn set(ks: &Keyspace, conn: &Connection, args: &[Bytes]) {
    // Options such as EX/NX are accepted and ignored.
    let [key, value, ..] = args else {
        return arity_error(conn, "set");
    };
    ks.set_string(key, value);
    conn.write_ok();
}

fn get(ks: &Keyspace, conn: &Connection, args: &[Bytes]) {
    let [key] = args else {
        return arity_error(conn, "get");
    };
    match ks.entries.lock().get(key) {
        Some(Value::String(s)) => conn.write_bulk_string(s),
        Some(Value::List(_)) => conn.write_error(WRONGTYPE),
        None => conn.write_null(),
    }
}

fn getset(ks: &Keyspace, conn: &Connection, args: &[Bytes]) {
    let [key, value] = args else {
        return arity_error(conn, "getset");
    };
    let mut entries = ks.entries.lock();
    match entries.get(key) {
        Some(Value::List(_)) => return conn.write_error(WRONGTYPE),
        Some(Value::String(old)) => conn.write_bulk_string(old),
        None => conn.write_null(),
    }
    entries.insert(key.clone(), Value::String(value.clone()));
}

fn getdel(ks: &Keyspace, conn: &Connection, args: &[Bytes]) {
    let [key] = args else {
        return arity_error(conn, "getdel");
    };
    let mut entries = ks.entries.lock();
    match entries.remove(key) {
        Some(Value::String(old)) => conn.write_bulk_string(old),
        Some(list) => {
            entries.insert(key.clone(), list);
            conn.write_error(WRONGTYPE);
        }
        None => conn.write_null(),
    }
}

fn del(ks: &Keyspace, conn: &Connection, args: &[Bytes]) {
    if args.is_empty() {
        return arity_error(conn, "del");
    }
    let mut entries = ks.entries.lock();
    let removed = args.iter().filter(|k| entries.remove(*k).is_some()).count();
    conn.write_integer(removed as i64);
}

fn exists(ks: &Keyspace, conn: &Connection, args: &[Bytes]) {
    if args.is_empty() {
        return arity_error(conn, "exists");
    }
    let entries = ks.entries.lock();
    // Repeated keys count once per mention, as in Redis.
    let found = args.iter().filter(|k| entries.contains_key(*k)).count();
    conn.write_integer(found as i64);
}

fn decrby(ks: &Keyspace, conn: &Connection, args: &[Bytes]) {
    let [key, delta] = args else {
        return arity_error(conn, "decrby");
    };
    let Some(delta) = parse_i64(delta) else {
        return conn.write_error(NOT_AN_INTEGER);
    };
    match delta.checked_neg() {
        Some(delta) => apply_delta(ks, conn, key, delta),
        None => conn.write_error(DECREMENT_OVERFLOW),
    }
}

/// INCR/DECR pass a fixed `delta`; INCRBY reads it from the second argument.
fn incr_by(ks: &Keyspace, conn: &Connection, command: &str, args: &[Bytes], delta: Option<i64>) {
    let (key, delta) = match (args, delta) {
        ([key], Some(delta)) => (key, Some(delta)),
        ([key, raw], None) => (key, parse_i64(raw)),
        _ => return arity_error(conn, command),
    };
    match delta {
        Some(delta) => apply_delta(ks, conn, key, delta),
        None => conn.write_error(NOT_AN_INTEGER),
    }
}

fn apply_delta(ks: &Keyspace, conn: &Connection, key: &Bytes, delta: i64) {
    let mut entries = ks.entries.lock();
    let current = match entries.get(key) {
        Some(Value::String(s)) => match parse_i64(s) {
            Some(n) => n,
            None => return conn.write_error(NOT_AN_INTEGER),
        },
        Some(Value::List(_)) => return conn.write_error(WRONGTYPE),
        None => 0,
    };
    let Some(next) = current.checked_add(delta) else {
        return conn.write_error(OVERFLOW);
    };
    entries.insert(key.clone(), Value::String(Bytes::from(next.to_string())));
    conn.write_integer(next);
}

fn push(ks: &Keyspace, conn: &Connection, command: &str, args: &[Bytes], front: bool) {
    let [key, values @ ..] = args else {
        return arity_error(conn, command);
    };
    if values.is_empty() {
        return arity_error(conn, command);
    }

    let mut entries = ks.entries.lock();
    let entry = entries
        .entry(key.clone())
        .or_insert_with(|| Value::List(VecDeque::new()));
    let Value::List(items) = entry else {
        return conn.write_error(WRONGTYPE);
    };
    for value in values {
        if front {
            items.push_front(value.clone());
        } else {
            items.push_back(value.clone());
        }
    }
    conn.write_integer(items.len() as i64);
}

fn pop(ks: &Keyspace, conn: &Connection, command: &str, args: &[Bytes], front: bool) {
    let [key] = args else {
        return arity_error(conn, command);
    };
    let mut entries = ks.entries.lock();
    let Some(Value::List(items)) = entries.get_mut(key) else {
        if entries.contains_key(key) {
            return conn.write_error(WRONGTYPE);
        }
        return conn.write_null();
    };
    let popped = if front {
        items.pop_front()
    } else {
        items.pop_back()
    };
    let now_empty = items.is_empty();
    match popped {
        Some(value) => conn.write_bulk_string(value),
        None => conn.write_null(),
    }
    if now_empty {
        entries.remove(key);
    }
}

fn llen(ks: &Keyspace, conn: &Connection, args: &[Bytes]) {
    let [key] = args else {
        return arity_error(conn, "llen");
    };
    match ks.entries.lock().get(key) {
        Some(Value::List(items)) => conn.write_integer(items.len() as i64),
        Some(Value::String(_)) => conn.write_error(WRONGTYPE),
        None => conn.write_integer(0),
    }
}

fn lrange(ks: &Keyspace, conn: &Connection, args: &[Bytes]) {
    let [key, start, stop] = args else {
        return arity_error(conn, "lrange");
    };
    let (Some(start), Some(stop)) = (parse_i64(start), parse_i64(stop)) else {
        return conn.write_error(NOT_AN_INTEGER);
    };

    let entries = ks.entries.lock();
    let items = match entries.get(key) {
        Some(Value::List(items)) => items,
        Some(Value::String(_)) => return conn.write_error(WRONGTYPE),
        None => return conn.write_array::<Bytes>(&[]),
    };
    match resolve_range(items.len(), start, stop) {
        Some((from, to)) => {
            let slice: Vec<&Bytes> = items.range(from..=to).collect();
            conn.write_array(&slice);
        }
        None => conn.write_array::<Bytes>(&[]),
    }
}

fn lindex(ks: &Keyspace, conn: &Connection, args: &[Bytes]) {
    let [key, index] = args else {
        return arity_error(conn, "lindex");
    };
    let Some(index) = parse_i64(index) else {
        return conn.write_error(NOT_AN_INTEGER);
    };

    let entries = ks.entries.lock();
    let item = match entries.get(key) {
        Some(Value::List(items)) => resolve_index(items.len(), index).and_then(|i| items.get(i)),
        Some(Value::String(_)) => return conn.write_error(WRONGTYPE),
        None => None,
    };
    match item {
        Some(value) => conn.write_bulk_string(value),
        None => conn.write_null(),
    }
}

/// Integer argument in the form Redis accepts: optional sign, decimal digits.
fn parse_i64(raw: &[u8]) -> Option<i64> {
    std::str::from_utf8(raw).ok()?.parse().ok()
}

/// Redis LRANGE semantics: negative offsets count from the tail, the start is
/// clamped to 0 and the stop to the last element. `None` means an empty range.
fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

fn resolve_index(len: usize, index: i64) -> Option<usize> {
    let len = len as i64;
    let index = if index < 0 { len + index } else { index };
    (0..len).contains(&index).then_some(index as usize)
}
