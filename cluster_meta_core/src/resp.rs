//! RESP2 wire codec and a framed command connection
//!
//! Both the sentinel directory and the metadata store speak RESP. Commands
//! are always sent as arrays of bulk strings; replies are decoded into
//! [`RespValue`], keeping null bulk strings and null arrays distinct since an
//! aborted `EXEC` is reported as a null array.

use bytes::{Buf, BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::error::{MetaError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    SimpleString(String),
    Error(String),
    Integer(i64),
    BulkString(Option<String>),
    Array(Vec<RespValue>),
    NullArray,
}

impl RespValue {
    /// Build a command as an array of bulk strings.
    pub fn command<S: AsRef<str>>(args: &[S]) -> RespValue {
        RespValue::Array(
            args.iter()
                .map(|arg| RespValue::BulkString(Some(arg.as_ref().to_string())))
                .collect(),
        )
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            RespValue::SimpleString(s) => {
                dst.put_u8(b'+');
                dst.put_slice(s.as_bytes());
                dst.put_slice(b"\r\n");
            }
            RespValue::Error(e) => {
                dst.put_u8(b'-');
                dst.put_slice(e.as_bytes());
                dst.put_slice(b"\r\n");
            }
            RespValue::Integer(i) => {
                dst.put_slice(format!(":{}\r\n", i).as_bytes());
            }
            RespValue::BulkString(Some(s)) => {
                dst.put_slice(format!("${}\r\n", s.len()).as_bytes());
                dst.put_slice(s.as_bytes());
                dst.put_slice(b"\r\n");
            }
            RespValue::BulkString(None) => dst.put_slice(b"$-1\r\n"),
            RespValue::Array(items) => {
                dst.put_slice(format!("*{}\r\n", items.len()).as_bytes());
                for item in items {
                    item.encode(dst);
                }
            }
            RespValue::NullArray => dst.put_slice(b"*-1\r\n"),
        }
    }

    /// Text content of a simple or bulk string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RespValue::SimpleString(s) => Some(s),
            RespValue::BulkString(Some(s)) => Some(s),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<RespValue>> {
        match self {
            RespValue::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Flatten a `[k1, v1, k2, v2, ...]` reply into pairs, skipping
    /// entries that are not strings.
    pub fn into_pairs(self) -> Vec<(String, String)> {
        let items = match self {
            RespValue::Array(items) => items,
            _ => return Vec::new(),
        };
        let mut pairs = Vec::with_capacity(items.len() / 2);
        let mut iter = items.into_iter();
        while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
            if let (Some(k), Some(v)) = (key.as_str(), value.as_str()) {
                pairs.push((k.to_string(), v.to_string()));
            }
        }
        pairs
    }
}

pub struct RespCodec;

impl Decoder for RespCodec {
    type Item = RespValue;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::result::Result<Option<Self::Item>, Self::Error> {
        match parse_value(src)? {
            Some((value, consumed)) => {
                src.advance(consumed);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<RespValue> for RespCodec {
    type Error = io::Error;

    fn encode(&mut self, item: RespValue, dst: &mut BytesMut) -> std::result::Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

fn find_crlf(src: &[u8], start: usize) -> Option<usize> {
    if src.len() < 2 {
        return None;
    }
    (start..src.len() - 1).find(|&i| src[i] == b'\r' && src[i + 1] == b'\n')
}

fn parse_line(src: &[u8]) -> io::Result<Option<(String, usize)>> {
    match find_crlf(src, 1) {
        Some(pos) => {
            let line = std::str::from_utf8(&src[1..pos]).map_err(|_| invalid("Invalid UTF-8 in line"))?;
            Ok(Some((line.to_string(), pos + 2)))
        }
        None => Ok(None),
    }
}

fn parse_len(line: &str) -> io::Result<i64> {
    line.parse::<i64>().map_err(|_| invalid("Invalid length"))
}

/// Parse one complete value from the front of `src`, returning it with the
/// number of bytes it occupies, or `None` if more data is needed.
fn parse_value(src: &[u8]) -> io::Result<Option<(RespValue, usize)>> {
    if src.is_empty() {
        return Ok(None);
    }

    match src[0] {
        b'+' => Ok(parse_line(src)?.map(|(s, n)| (RespValue::SimpleString(s), n))),
        b'-' => Ok(parse_line(src)?.map(|(s, n)| (RespValue::Error(s), n))),
        b':' => match parse_line(src)? {
            Some((s, n)) => {
                let value = s.parse::<i64>().map_err(|_| invalid("Invalid integer"))?;
                Ok(Some((RespValue::Integer(value), n)))
            }
            None => Ok(None),
        },
        b'$' => {
            let (line, header) = match parse_line(src)? {
                Some(parsed) => parsed,
                None => return Ok(None),
            };
            let len = parse_len(&line)?;
            if len == -1 {
                return Ok(Some((RespValue::BulkString(None), header)));
            }
            if len < 0 {
                return Err(invalid("Invalid bulk string length"));
            }
            let end = usize::try_from(len)
                .ok()
                .and_then(|len| header.checked_add(len))
                .filter(|end| end.checked_add(2).is_some())
                .ok_or_else(|| invalid("Invalid bulk string length"))?;
            if src.len() < end + 2 {
                return Ok(None);
            }
            if &src[end..end + 2] != b"\r\n" {
                return Err(invalid("Invalid bulk string format"));
            }
            let s = std::str::from_utf8(&src[header..end]).map_err(|_| invalid("Invalid UTF-8 in bulk string"))?;
            Ok(Some((RespValue::BulkString(Some(s.to_string())), end + 2)))
        }
        b'*' => {
            let (line, header) = match parse_line(src)? {
                Some(parsed) => parsed,
                None => return Ok(None),
            };
            let len = parse_len(&line)?;
            if len == -1 {
                return Ok(Some((RespValue::NullArray, header)));
            }
            if len < 0 {
                return Err(invalid("Invalid array length"));
            }
            // The length is peer supplied; never reserve more than the bytes at hand.
            let remaining = src.len() - header;
            let mut items = Vec::with_capacity(usize::try_from(len).unwrap_or(usize::MAX).min(remaining));
            let mut pos = header;
            for _ in 0..len {
                match parse_value(&src[pos..])? {
                    Some((item, used)) => {
                        items.push(item);
                        pos += used;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((RespValue::Array(items), pos)))
        }
        _ => Err(invalid("Unknown RESP type")),
    }
}

/// One framed RESP connection with per-command timeouts.
pub struct RespConnection {
    framed: Framed<TcpStream, RespCodec>,
    peer: String,
    command_timeout: Duration,
}

impl RespConnection {
    pub async fn connect(addr: &str, connect_timeout: Duration, command_timeout: Duration) -> Result<Self> {
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| MetaError::Timeout(format!("connect to {}", addr)))??;
        stream.set_nodelay(true)?;
        Ok(Self {
            framed: Framed::new(stream, RespCodec),
            peer: addr.to_string(),
            command_timeout,
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Write a command without waiting for its reply.
    pub async fn send<S: AsRef<str>>(&mut self, args: &[S]) -> Result<()> {
        let frame = RespValue::command(args);
        timeout(self.command_timeout, self.framed.send(frame))
            .await
            .map_err(|_| MetaError::Timeout(format!("write to {}", self.peer)))??;
        Ok(())
    }

    /// Send a command and wait for exactly one reply. Server error replies are
    /// returned as [`RespValue::Error`] for the caller to classify.
    pub async fn command<S: AsRef<str>>(&mut self, args: &[S]) -> Result<RespValue> {
        self.send(args).await?;
        match timeout(self.command_timeout, self.framed.next()).await {
            Ok(Some(reply)) => Ok(reply?),
            Ok(None) => Err(MetaError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} closed the connection", self.peer),
            ))),
            Err(_) => Err(MetaError::Timeout(format!("reply from {}", self.peer))),
        }
    }

    /// Wait for the next pushed value with no deadline (pub/sub).
    pub async fn next_push(&mut self) -> Result<Option<RespValue>> {
        match self.framed.next().await {
            Some(value) => Ok(Some(value?)),
            None => Ok(None),
        }
    }
}
