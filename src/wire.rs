//! Wire session to the remote keyspace.
//!
//! A [`WireClient`] is one stateful TCP session speaking the line-framed
//! request / array-reply protocol: every request is an array of bulk
//! strings, every reply is one of five frame kinds. Operations are strictly
//! request-then-blocking-reply except in the two batching modes:
//!
//! - **Transaction** (`begin` / queued ops / `commit`): the server queues
//!   each operation (acknowledged with `+QUEUED`) and executes them
//!   atomically on `commit`, which returns the per-op results in order, or
//!   absent when the transaction was aborted. Any error while queueing
//!   requires [`WireClient::rollback`].
//! - **Pipeline** (`pipeline_begin` / ops / `pipeline_end`): operations are
//!   written without reading replies; `pipeline_end` reads exactly as many
//!   replies as were queued.
//!
//! ## Failure semantics
//!
//! Transport and protocol errors poison the session — it must be closed and
//! discarded (the pool does this on checkin). A server-reported error leaves
//! the session healthy, except inside a transaction where the queue must be
//! discarded first.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};

use crate::config::FolioConfig;
use crate::error::{Error, Result};

// =============================================================================
// Reply frames
// =============================================================================

/// One reply frame from the server.
///
/// Server errors are carried as [`Reply::Error`] values so they can appear
/// inside `EXEC` result arrays; top-level operations convert them to
/// [`Error::Remote`].
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Simple status line, e.g. `OK`, `PONG`, `QUEUED`.
    Status(String),
    /// Server-reported error message.
    Error(String),
    /// Integer reply.
    Int(i64),
    /// Opaque bytes; `None` when the key or field is absent.
    Bulk(Option<Vec<u8>>),
    /// Nested replies; `None` for an aborted transaction.
    Array(Option<Vec<Reply>>),
}

impl Reply {
    /// Extracts a bulk payload. Queue/pipeline acknowledgements decay to
    /// absent so typed wrappers stay usable while batching.
    pub fn into_bulk(self) -> Result<Option<Vec<u8>>> {
        match self {
            Reply::Bulk(b) => Ok(b),
            Reply::Status(_) => Ok(None),
            Reply::Error(msg) => Err(Error::Remote(msg)),
            other => Err(Error::Protocol(format!("expected bulk reply, got {:?}", other))),
        }
    }

    /// Extracts an integer. Queue/pipeline acknowledgements decay to zero.
    pub fn into_int(self) -> Result<i64> {
        match self {
            Reply::Int(i) => Ok(i),
            Reply::Status(_) => Ok(0),
            Reply::Error(msg) => Err(Error::Remote(msg)),
            other => Err(Error::Protocol(format!("expected int reply, got {:?}", other))),
        }
    }

    /// Extracts array elements. Queue/pipeline acknowledgements decay to
    /// empty.
    pub fn into_array(self) -> Result<Vec<Reply>> {
        match self {
            Reply::Array(Some(items)) => Ok(items),
            Reply::Array(None) => Ok(Vec::new()),
            Reply::Status(_) => Ok(Vec::new()),
            Reply::Error(msg) => Err(Error::Remote(msg)),
            other => Err(Error::Protocol(format!("expected array reply, got {:?}", other))),
        }
    }
}

// =============================================================================
// Frame codec
// =============================================================================

/// Encodes one request as an array of bulk strings.
pub(crate) fn encode_command(args: &[&[u8]]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32);
    buf.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        buf.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        buf.extend_from_slice(arg);
        buf.extend_from_slice(b"\r\n");
    }
    buf
}

/// Reads one reply frame.
///
/// Bulk payloads are read with `read_exact`, which loops until the declared
/// length is consumed; the trailing frame separator is consumed and checked
/// but not part of the payload. Unknown frame markers are protocol errors.
pub(crate) fn read_reply(r: &mut impl BufRead) -> Result<Reply> {
    let line = read_line(r)?;
    let (kind, rest) = match line.split_first() {
        Some(split) => split,
        None => return Err(Error::Protocol("empty reply frame".into())),
    };
    let rest = std::str::from_utf8(rest)
        .map_err(|_| Error::Protocol("non-utf8 reply header".into()))?;

    match *kind {
        b'+' => Ok(Reply::Status(rest.to_string())),
        b'-' => Ok(Reply::Error(rest.to_string())),
        b':' => {
            let n = rest
                .parse::<i64>()
                .map_err(|_| Error::Protocol(format!("invalid integer reply '{}'", rest)))?;
            Ok(Reply::Int(n))
        }
        b'$' => {
            let len = rest
                .parse::<i64>()
                .map_err(|_| Error::Protocol(format!("invalid bulk length '{}'", rest)))?;
            if len < 0 {
                return Ok(Reply::Bulk(None));
            }
            let mut payload = vec![0u8; len as usize];
            r.read_exact(&mut payload)?;
            let mut crlf = [0u8; 2];
            r.read_exact(&mut crlf)?;
            if &crlf != b"\r\n" {
                return Err(Error::Protocol("bulk payload missing terminator".into()));
            }
            Ok(Reply::Bulk(Some(payload)))
        }
        b'*' => {
            let len = rest
                .parse::<i64>()
                .map_err(|_| Error::Protocol(format!("invalid array length '{}'", rest)))?;
            if len < 0 {
                return Ok(Reply::Array(None));
            }
            let mut items = Vec::with_capacity(len as usize);
            for _ in 0..len {
                items.push(read_reply(r)?);
            }
            Ok(Reply::Array(Some(items)))
        }
        other => Err(Error::Protocol(format!(
            "unknown reply frame marker 0x{:02x}",
            other
        ))),
    }
}

fn read_line(r: &mut impl BufRead) -> Result<Vec<u8>> {
    let mut line = Vec::new();
    let n = r.read_until(b'\n', &mut line)?;
    if n == 0 {
        return Err(Error::Transport(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed by server",
        )));
    }
    if line.ends_with(b"\r\n") {
        line.truncate(line.len() - 2);
        Ok(line)
    } else {
        Err(Error::Protocol("reply line missing terminator".into()))
    }
}

// =============================================================================
// WireClient
// =============================================================================

/// A single-threaded session to the remote keyspace.
pub struct WireClient {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
    /// Count of writes outstanding while pipelining; `None` when not.
    pipelined: Option<usize>,
    in_tx: bool,
    poisoned: bool,
}

impl WireClient {
    /// Connects, authenticates, and selects the configured namespace.
    pub fn open(config: &FolioConfig) -> Result<Self> {
        let endpoint = &config.endpoint;
        let addr = (endpoint.host.as_str(), endpoint.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                Error::Transport(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("cannot resolve {}:{}", endpoint.host, endpoint.port),
                ))
            })?;

        let stream = TcpStream::connect_timeout(&addr, config.connect_timeout)?;
        stream.set_read_timeout(Some(config.receive_timeout))?;
        stream.set_write_timeout(Some(config.receive_timeout))?;
        stream.set_nodelay(true)?;
        let reader = BufReader::new(stream.try_clone()?);

        let mut client = WireClient {
            stream,
            reader,
            pipelined: None,
            in_tx: false,
            poisoned: false,
        };

        if let Some(password) = &endpoint.password {
            client.auth(password)?;
        }
        if endpoint.db != 0 {
            client.select(endpoint.db)?;
        }
        Ok(client)
    }

    /// True once a transport or protocol error has invalidated the session.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Shuts the session down; errors on close are ignored.
    pub fn close(self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }

    // =========================================================================
    // Request / reply plumbing
    // =========================================================================

    fn call(&mut self, args: &[&[u8]]) -> Result<Reply> {
        if self.poisoned {
            return Err(Error::Protocol("session is poisoned".into()));
        }
        let frame = encode_command(args);
        if let Err(e) = self.stream.write_all(&frame) {
            self.poisoned = true;
            return Err(Error::Transport(e));
        }
        if let Some(count) = &mut self.pipelined {
            *count += 1;
            return Ok(Reply::Status("PIPELINED".into()));
        }
        match self.read_frame()? {
            Reply::Error(msg) => Err(Error::Remote(msg)),
            reply => Ok(reply),
        }
    }

    fn read_frame(&mut self) -> Result<Reply> {
        match read_reply(&mut self.reader) {
            Ok(reply) => Ok(reply),
            Err(e) => {
                // Transport and protocol failures desynchronize the frame
                // stream; the session cannot be reused.
                self.poisoned = true;
                Err(e)
            }
        }
    }

    // =========================================================================
    // Connection setup / liveness
    // =========================================================================

    pub fn ping(&mut self) -> Result<bool> {
        Ok(self.call(&[b"PING"])? == Reply::Status("PONG".into()))
    }

    fn auth(&mut self, password: &str) -> Result<()> {
        self.call(&[b"AUTH", password.as_bytes()])?;
        Ok(())
    }

    fn select(&mut self, db: u32) -> Result<()> {
        self.call(&[b"SELECT", db.to_string().as_bytes()])?;
        Ok(())
    }

    // =========================================================================
    // Strings
    // =========================================================================

    pub fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        self.call(&[b"GET", key.as_bytes()])?.into_bulk()
    }

    pub fn set(&mut self, key: &str, val: &[u8]) -> Result<()> {
        self.call(&[b"SET", key.as_bytes(), val])?;
        Ok(())
    }

    pub fn del(&mut self, key: &str) -> Result<i64> {
        self.call(&[b"DEL", key.as_bytes()])?.into_int()
    }

    // =========================================================================
    // Hashes
    // =========================================================================

    pub fn hset(&mut self, key: &str, field: &str, val: &[u8]) -> Result<()> {
        self.call(&[b"HSET", key.as_bytes(), field.as_bytes(), val])?;
        Ok(())
    }

    pub fn hget(&mut self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        self.call(&[b"HGET", key.as_bytes(), field.as_bytes()])?
            .into_bulk()
    }

    pub fn hget_all(&mut self, key: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let items = self.call(&[b"HGETALL", key.as_bytes()])?.into_array()?;
        let mut pairs = Vec::with_capacity(items.len() / 2);
        let mut iter = items.into_iter();
        while let (Some(field), Some(val)) = (iter.next(), iter.next()) {
            let field = field.into_bulk()?.unwrap_or_default();
            let field = String::from_utf8(field)
                .map_err(|_| Error::Protocol("non-utf8 hash field".into()))?;
            pairs.push((field, val.into_bulk()?.unwrap_or_default()));
        }
        Ok(pairs)
    }

    // =========================================================================
    // Sets
    // =========================================================================

    pub fn sadd(&mut self, key: &str, member: &str) -> Result<()> {
        self.call(&[b"SADD", key.as_bytes(), member.as_bytes()])?;
        Ok(())
    }

    pub fn srem(&mut self, key: &str, member: &str) -> Result<()> {
        self.call(&[b"SREM", key.as_bytes(), member.as_bytes()])?;
        Ok(())
    }

    pub fn smembers(&mut self, key: &str) -> Result<Vec<String>> {
        let items = self.call(&[b"SMEMBERS", key.as_bytes()])?.into_array()?;
        let mut members = Vec::with_capacity(items.len());
        for item in items {
            let bytes = item.into_bulk()?.unwrap_or_default();
            members.push(
                String::from_utf8(bytes)
                    .map_err(|_| Error::Protocol("non-utf8 set member".into()))?,
            );
        }
        Ok(members)
    }

    // =========================================================================
    // Sorted sets
    // =========================================================================

    pub fn zadd(&mut self, key: &str, score: i64, member: &[u8]) -> Result<()> {
        self.call(&[b"ZADD", key.as_bytes(), score.to_string().as_bytes(), member])?;
        Ok(())
    }

    pub fn zcard(&mut self, key: &str) -> Result<i64> {
        self.call(&[b"ZCARD", key.as_bytes()])?.into_int()
    }

    /// Members with score in `[min, max]`, ascending. Bounds use the score
    /// grammar: a decimal, `(decimal` for exclusive, or `-inf`/`+inf`.
    pub fn zrange_by_score(
        &mut self,
        key: &str,
        min: &str,
        max: &str,
        limit: Option<(i64, i64)>,
    ) -> Result<Vec<Vec<u8>>> {
        let reply = match limit {
            None => self.call(&[b"ZRANGEBYSCORE", key.as_bytes(), min.as_bytes(), max.as_bytes()])?,
            Some((offset, count)) => self.call(&[
                b"ZRANGEBYSCORE",
                key.as_bytes(),
                min.as_bytes(),
                max.as_bytes(),
                b"LIMIT",
                offset.to_string().as_bytes(),
                count.to_string().as_bytes(),
            ])?,
        };
        collect_members(reply)
    }

    /// Members with score in `[min, max]`, descending from `max`.
    pub fn zrev_range_by_score(
        &mut self,
        key: &str,
        max: &str,
        min: &str,
        limit: Option<(i64, i64)>,
    ) -> Result<Vec<Vec<u8>>> {
        let reply = match limit {
            None => self.call(&[
                b"ZREVRANGEBYSCORE",
                key.as_bytes(),
                max.as_bytes(),
                min.as_bytes(),
            ])?,
            Some((offset, count)) => self.call(&[
                b"ZREVRANGEBYSCORE",
                key.as_bytes(),
                max.as_bytes(),
                min.as_bytes(),
                b"LIMIT",
                offset.to_string().as_bytes(),
                count.to_string().as_bytes(),
            ])?,
        };
        collect_members(reply)
    }

    pub fn zrem_range_by_score(&mut self, key: &str, min: &str, max: &str) -> Result<i64> {
        self.call(&[
            b"ZREMRANGEBYSCORE",
            key.as_bytes(),
            min.as_bytes(),
            max.as_bytes(),
        ])?
        .into_int()
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Opens a transaction. Subsequent operations are queued server-side and
    /// acknowledged with `+QUEUED` until [`commit`](Self::commit) or
    /// [`rollback`](Self::rollback).
    pub fn begin(&mut self) -> Result<()> {
        self.call(&[b"MULTI"])?;
        self.in_tx = true;
        Ok(())
    }

    /// Executes the queued operations atomically.
    ///
    /// Returns the per-op results in queue order, or `None` when the server
    /// aborted the transaction.
    pub fn commit(&mut self) -> Result<Option<Vec<Reply>>> {
        self.in_tx = false;
        match self.call(&[b"EXEC"])? {
            Reply::Array(Some(items)) => Ok(Some(items)),
            Reply::Array(None) => Ok(None),
            other => Err(Error::Protocol(format!(
                "unexpected EXEC reply {:?}",
                other
            ))),
        }
    }

    /// Discards the queued operations.
    pub fn rollback(&mut self) -> Result<()> {
        self.in_tx = false;
        self.call(&[b"DISCARD"])?;
        Ok(())
    }

    /// True while a transaction is open.
    pub fn in_tx(&self) -> bool {
        self.in_tx
    }

    // =========================================================================
    // Pipelining
    // =========================================================================

    /// Enters pipeline mode: operations are written but replies are not
    /// read until [`pipeline_end`](Self::pipeline_end).
    pub fn pipeline_begin(&mut self) {
        self.pipelined = Some(0);
    }

    /// Leaves pipeline mode, reading exactly as many replies as operations
    /// were queued. Returns them in order; the first server error, if any,
    /// is surfaced after the stream is drained so the session stays in sync.
    pub fn pipeline_end(&mut self) -> Result<Vec<Reply>> {
        let count = self.pipelined.take().unwrap_or(0);
        let mut replies = Vec::with_capacity(count);
        for _ in 0..count {
            replies.push(self.read_frame()?);
        }
        if let Some(Reply::Error(msg)) = replies.iter().find(|r| matches!(r, Reply::Error(_))) {
            return Err(Error::Remote(msg.clone()));
        }
        Ok(replies)
    }
}

fn collect_members(reply: Reply) -> Result<Vec<Vec<u8>>> {
    let items = reply.into_array()?;
    let mut members = Vec::with_capacity(items.len());
    for item in items {
        members.push(item.into_bulk()?.unwrap_or_default());
    }
    Ok(members)
}

impl std::fmt::Debug for WireClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireClient")
            .field("peer", &self.stream.peer_addr().ok())
            .field("in_tx", &self.in_tx)
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn parse(bytes: &[u8]) -> Result<Reply> {
        read_reply(&mut Cursor::new(bytes))
    }

    #[test]
    fn test_encode_command() {
        let frame = encode_command(&[b"GET", b"rec:a-1"]);
        assert_eq!(frame, b"*2\r\n$3\r\nGET\r\n$7\r\nrec:a-1\r\n");
    }

    #[test]
    fn test_parse_status_and_error() {
        assert_eq!(parse(b"+OK\r\n").unwrap(), Reply::Status("OK".into()));
        assert_eq!(parse(b"+PONG\r\n").unwrap(), Reply::Status("PONG".into()));
        assert_eq!(
            parse(b"-ERR unknown command\r\n").unwrap(),
            Reply::Error("ERR unknown command".into())
        );
    }

    #[test]
    fn test_parse_int() {
        assert_eq!(parse(b":42\r\n").unwrap(), Reply::Int(42));
        assert_eq!(parse(b":-1\r\n").unwrap(), Reply::Int(-1));
        assert!(matches!(parse(b":abc\r\n"), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_parse_bulk() {
        assert_eq!(
            parse(b"$5\r\nhello\r\n").unwrap(),
            Reply::Bulk(Some(b"hello".to_vec()))
        );
        assert_eq!(parse(b"$0\r\n\r\n").unwrap(), Reply::Bulk(Some(Vec::new())));
        assert_eq!(parse(b"$-1\r\n").unwrap(), Reply::Bulk(None));

        // Payload may contain frame separators; length wins.
        assert_eq!(
            parse(b"$6\r\nab\r\ncd\r\n").unwrap(),
            Reply::Bulk(Some(b"ab\r\ncd".to_vec()))
        );
    }

    #[test]
    fn test_parse_array() {
        assert_eq!(
            parse(b"*3\r\n:1\r\n$1\r\na\r\n+OK\r\n").unwrap(),
            Reply::Array(Some(vec![
                Reply::Int(1),
                Reply::Bulk(Some(b"a".to_vec())),
                Reply::Status("OK".into()),
            ]))
        );
        assert_eq!(parse(b"*-1\r\n").unwrap(), Reply::Array(None));
        assert_eq!(parse(b"*0\r\n").unwrap(), Reply::Array(Some(Vec::new())));

        // Errors nest as values so an EXEC result can carry them.
        assert_eq!(
            parse(b"*2\r\n:1\r\n-ERR oops\r\n").unwrap(),
            Reply::Array(Some(vec![Reply::Int(1), Reply::Error("ERR oops".into())]))
        );
    }

    #[test]
    fn test_parse_unknown_marker() {
        assert!(matches!(parse(b"?what\r\n"), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_parse_eof() {
        assert!(matches!(parse(b""), Err(Error::Transport(_))));
        // Truncated payload surfaces as a transport error.
        assert!(matches!(parse(b"$10\r\nabc"), Err(Error::Transport(_))));
    }

    #[test]
    fn test_reply_extractors() {
        assert_eq!(
            Reply::Bulk(Some(b"x".to_vec())).into_bulk().unwrap(),
            Some(b"x".to_vec())
        );
        assert_eq!(Reply::Status("QUEUED".into()).into_bulk().unwrap(), None);
        assert_eq!(Reply::Int(7).into_int().unwrap(), 7);
        assert!(Reply::Error("ERR".into()).into_int().is_err());
        assert!(Reply::Int(1).into_array().is_err());
    }
}
