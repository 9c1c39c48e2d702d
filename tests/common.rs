#![allow(dead_code)]

//! Shared test fixtures: an in-process keyspace server speaking the wire
//! protocol over real sockets, plus store bootstrap helpers.
//!
//! The server implements just the command subset the engine uses (strings,
//! hashes, sets, sorted sets, MULTI/EXEC, PING/AUTH/SELECT), all in one
//! logical namespace, so the full stack — framing, pipelining,
//! transactions, startup load — is exercised end-to-end without an external
//! process.

use std::collections::{HashMap, HashSet};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use folio_redis::{FolioConfig, RecordStore, WireClient};

// =============================================================================
// In-process keyspace server
// =============================================================================

#[derive(Default)]
struct Db {
    strings: HashMap<String, Vec<u8>>,
    hashes: HashMap<String, HashMap<String, Vec<u8>>>,
    sets: HashMap<String, HashSet<Vec<u8>>>,
    /// Kept sorted by (score, member).
    zsets: HashMap<String, Vec<(i64, Vec<u8>)>>,
}

pub struct TestServer {
    pub port: u16,
}

impl TestServer {
    pub fn uri(&self) -> String {
        format!("redis://127.0.0.1:{}/0", self.port)
    }
}

pub fn start_server() -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server");
    let port = listener.local_addr().expect("local addr").port();
    let db: Arc<Mutex<Db>> = Arc::new(Mutex::new(Db::default()));

    thread::spawn(move || {
        for conn in listener.incoming() {
            let Ok(stream) = conn else { break };
            let db = Arc::clone(&db);
            thread::spawn(move || handle_conn(stream, db));
        }
    });

    TestServer { port }
}

fn handle_conn(stream: TcpStream, db: Arc<Mutex<Db>>) {
    let mut reader = BufReader::new(match stream.try_clone() {
        Ok(clone) => clone,
        Err(_) => return,
    });
    let mut out = stream;
    let mut tx_queue: Option<Vec<Vec<Vec<u8>>>> = None;

    loop {
        let Some(args) = read_command(&mut reader) else {
            return;
        };
        if args.is_empty() {
            continue;
        }
        let cmd = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();

        let reply: Vec<u8> = match cmd.as_str() {
            "MULTI" => {
                tx_queue = Some(Vec::new());
                status("OK")
            }
            "EXEC" => match tx_queue.take() {
                Some(queue) => {
                    let mut db = db.lock().expect("db mutex");
                    let mut buf = format!("*{}\r\n", queue.len()).into_bytes();
                    for queued in &queue {
                        buf.extend(execute(&mut db, queued));
                    }
                    buf
                }
                None => error("ERR EXEC without MULTI"),
            },
            "DISCARD" => {
                tx_queue = None;
                status("OK")
            }
            _ if tx_queue.is_some() => {
                tx_queue.as_mut().expect("tx queue").push(args);
                status("QUEUED")
            }
            _ => {
                let mut db = db.lock().expect("db mutex");
                execute(&mut db, &args)
            }
        };

        if out.write_all(&reply).is_err() {
            return;
        }
    }
}

fn read_command(r: &mut impl BufRead) -> Option<Vec<Vec<u8>>> {
    let header = read_line(r)?;
    if !header.starts_with('*') {
        return None;
    }
    let count: usize = header[1..].parse().ok()?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        let len_line = read_line(r)?;
        if !len_line.starts_with('$') {
            return None;
        }
        let len: usize = len_line[1..].parse().ok()?;
        let mut payload = vec![0u8; len];
        r.read_exact(&mut payload).ok()?;
        let mut crlf = [0u8; 2];
        r.read_exact(&mut crlf).ok()?;
        args.push(payload);
    }
    Some(args)
}

fn read_line(r: &mut impl BufRead) -> Option<String> {
    let mut line = String::new();
    let n = r.read_line(&mut line).ok()?;
    if n == 0 {
        return None;
    }
    Some(line.trim_end().to_string())
}

// =============================================================================
// Command execution
// =============================================================================

fn execute(db: &mut Db, args: &[Vec<u8>]) -> Vec<u8> {
    let cmd = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
    match cmd.as_str() {
        "PING" => status("PONG"),
        "AUTH" | "SELECT" => status("OK"),

        "GET" => bulk(db.strings.get(&key(args, 1)).map(|v| v.as_slice())),
        "SET" => {
            db.strings.insert(key(args, 1), args[2].clone());
            status("OK")
        }
        "DEL" => {
            let k = key(args, 1);
            let mut removed = 0;
            if db.strings.remove(&k).is_some() {
                removed = 1;
            }
            if db.hashes.remove(&k).is_some() {
                removed = 1;
            }
            if db.sets.remove(&k).is_some() {
                removed = 1;
            }
            if db.zsets.remove(&k).is_some() {
                removed = 1;
            }
            int(removed)
        }

        "HSET" => {
            let entry = db.hashes.entry(key(args, 1)).or_default();
            let fresh = entry.insert(key(args, 2), args[3].clone()).is_none();
            int(if fresh { 1 } else { 0 })
        }
        "HGET" => bulk(
            db.hashes
                .get(&key(args, 1))
                .and_then(|h| h.get(&key(args, 2)))
                .map(|v| v.as_slice()),
        ),
        "HGETALL" => {
            let pairs = db.hashes.get(&key(args, 1));
            let mut items: Vec<Vec<u8>> = Vec::new();
            if let Some(pairs) = pairs {
                for (field, val) in pairs {
                    items.push(field.as_bytes().to_vec());
                    items.push(val.clone());
                }
            }
            array_of_bulks(&items)
        }

        "SADD" => {
            let set = db.sets.entry(key(args, 1)).or_default();
            int(if set.insert(args[2].clone()) { 1 } else { 0 })
        }
        "SREM" => {
            let removed = db
                .sets
                .get_mut(&key(args, 1))
                .map(|s| s.remove(&args[2]))
                .unwrap_or(false);
            int(if removed { 1 } else { 0 })
        }
        "SMEMBERS" => {
            let members: Vec<Vec<u8>> = db
                .sets
                .get(&key(args, 1))
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default();
            array_of_bulks(&members)
        }

        "ZADD" => {
            let score: i64 = match key(args, 2).parse() {
                Ok(score) => score,
                Err(_) => return error("ERR value is not a valid integer"),
            };
            let zset = db.zsets.entry(key(args, 1)).or_default();
            let existing = zset.iter().position(|(_, m)| *m == args[3]);
            let fresh = existing.is_none();
            if let Some(pos) = existing {
                zset.remove(pos);
            }
            zset.push((score, args[3].clone()));
            zset.sort();
            int(if fresh { 1 } else { 0 })
        }
        "ZCARD" => int(db.zsets.get(&key(args, 1)).map(|z| z.len()).unwrap_or(0) as i64),
        "ZRANGEBYSCORE" | "ZREVRANGEBYSCORE" => {
            let reverse = cmd == "ZREVRANGEBYSCORE";
            let (lo_arg, hi_arg) = if reverse { (3, 2) } else { (2, 3) };
            let lo = match parse_bound(&key(args, lo_arg)) {
                Some(bound) => bound,
                None => return error("ERR min or max is not a float"),
            };
            let hi = match parse_bound(&key(args, hi_arg)) {
                Some(bound) => bound,
                None => return error("ERR min or max is not a float"),
            };
            let limit = parse_limit(args);

            let mut members: Vec<Vec<u8>> = db
                .zsets
                .get(&key(args, 1))
                .map(|z| {
                    z.iter()
                        .filter(|(score, _)| in_range(*score, &lo, &hi))
                        .map(|(_, m)| m.clone())
                        .collect()
                })
                .unwrap_or_default();
            if reverse {
                members.reverse();
            }
            if let Some((offset, count)) = limit {
                members = members
                    .into_iter()
                    .skip(offset)
                    .take(count)
                    .collect();
            }
            array_of_bulks(&members)
        }
        "ZREMRANGEBYSCORE" => {
            let lo = match parse_bound(&key(args, 2)) {
                Some(bound) => bound,
                None => return error("ERR min or max is not a float"),
            };
            let hi = match parse_bound(&key(args, 3)) {
                Some(bound) => bound,
                None => return error("ERR min or max is not a float"),
            };
            let removed = match db.zsets.get_mut(&key(args, 1)) {
                Some(zset) => {
                    let before = zset.len();
                    zset.retain(|(score, _)| !in_range(*score, &lo, &hi));
                    before - zset.len()
                }
                None => 0,
            };
            int(removed as i64)
        }

        other => error(&format!("ERR unknown command '{}'", other)),
    }
}

fn key(args: &[Vec<u8>], idx: usize) -> String {
    String::from_utf8_lossy(&args[idx]).to_string()
}

enum Bound {
    NegInf,
    PosInf,
    Incl(i64),
    Excl(i64),
}

fn parse_bound(s: &str) -> Option<Bound> {
    match s {
        "-inf" => Some(Bound::NegInf),
        "+inf" | "inf" => Some(Bound::PosInf),
        _ if s.starts_with('(') => s[1..].parse().ok().map(Bound::Excl),
        _ => s.parse().ok().map(Bound::Incl),
    }
}

fn in_range(score: i64, lo: &Bound, hi: &Bound) -> bool {
    let above = match lo {
        Bound::NegInf => true,
        Bound::PosInf => false,
        Bound::Incl(n) => score >= *n,
        Bound::Excl(n) => score > *n,
    };
    let below = match hi {
        Bound::NegInf => false,
        Bound::PosInf => true,
        Bound::Incl(n) => score <= *n,
        Bound::Excl(n) => score < *n,
    };
    above && below
}

fn parse_limit(args: &[Vec<u8>]) -> Option<(usize, usize)> {
    let pos = args
        .iter()
        .position(|a| a.eq_ignore_ascii_case(b"LIMIT"))?;
    let offset: usize = key(args, pos + 1).parse().ok()?;
    let count: i64 = key(args, pos + 2).parse().ok()?;
    let count = if count < 0 { usize::MAX } else { count as usize };
    Some((offset, count))
}

// =============================================================================
// Reply encoders
// =============================================================================

fn status(s: &str) -> Vec<u8> {
    format!("+{}\r\n", s).into_bytes()
}

fn error(msg: &str) -> Vec<u8> {
    format!("-{}\r\n", msg).into_bytes()
}

fn int(n: i64) -> Vec<u8> {
    format!(":{}\r\n", n).into_bytes()
}

fn bulk(payload: Option<&[u8]>) -> Vec<u8> {
    match payload {
        None => b"$-1\r\n".to_vec(),
        Some(bytes) => {
            let mut buf = format!("${}\r\n", bytes.len()).into_bytes();
            buf.extend_from_slice(bytes);
            buf.extend_from_slice(b"\r\n");
            buf
        }
    }
}

fn array_of_bulks(items: &[Vec<u8>]) -> Vec<u8> {
    let mut buf = format!("*{}\r\n", items.len()).into_bytes();
    for item in items {
        buf.extend(bulk(Some(item)));
    }
    buf
}

// =============================================================================
// Store bootstrap helpers
// =============================================================================

pub fn test_config(server: &TestServer) -> FolioConfig {
    FolioConfig::new("test")
        .endpoint(&server.uri())
        .expect("endpoint uri")
        .pool_size(2)
        .connect_timeout(Duration::from_secs(1))
        .receive_timeout(Duration::from_secs(5))
}

pub fn open_store(server: &TestServer) -> RecordStore {
    RecordStore::open(test_config(server)).expect("open store")
}

/// A raw wire session for inspecting storage state directly.
pub fn raw_client(server: &TestServer) -> WireClient {
    WireClient::open(&test_config(server)).expect("open raw client")
}
