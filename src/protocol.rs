//! The line-oriented wire protocol shared by client and route connections
//! (spec.md §4.3, §4.4, §6). One incremental decoder walks a `BytesMut`
//! buffer and yields fully-parsed `Op`s, consuming bytes only once an
//! entire frame (including any payload) is present.

use bytes::{Buf, Bytes, BytesMut};
use std::str::FromStr;

use crate::info::{ConnectInfo, ServerInfo};

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Info(Box<ServerInfo>),
    Connect(Box<ConnectInfo>),
    Sub { subject: String, queue: Option<Bytes>, sid: Bytes },
    Unsub { sid: Bytes, max: Option<u64> },
    Pub { subject: String, reply: Option<String>, payload: Bytes },
    Msg { subject: String, sid: Bytes, reply: Option<String>, payload: Bytes },
    Ping,
    Pong,
    Ok,
    Err(String),
    /// Remote sub add. `weight` is only present when `queue` is.
    RsPlus { account: String, subject: String, queue: Option<Bytes>, weight: Option<u64>, rsid: Bytes },
    /// Remote sub remove.
    RsMinus { account: String, subject: String, queue: Option<Bytes>, rsid: Bytes },
    /// A message fanned across a route into the given account.
    RMsg { account: String, subject: String, reply: Option<String>, queues: Vec<Bytes>, payload: Bytes },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError(pub String);

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn err(msg: impl Into<String>) -> DecodeError {
    DecodeError(msg.into())
}

/// Incrementally decodes `Op`s out of a growing buffer. Callers append
/// freshly-read bytes with `feed` and then call `next_op` in a loop until
/// it returns `Ok(None)` (not enough bytes yet for the next frame).
#[derive(Default)]
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Decoder {
        Decoder { buffer: BytesMut::new() }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn next_op(&mut self) -> Result<Option<Op>, DecodeError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        if self.buffer.starts_with(b"+OK\r\n") {
            self.buffer.advance(5);
            return Ok(Some(Op::Ok));
        }
        if self.buffer.starts_with(b"PING\r\n") {
            self.buffer.advance(6);
            return Ok(Some(Op::Ping));
        }
        if self.buffer.starts_with(b"PONG\r\n") {
            self.buffer.advance(6);
            return Ok(Some(Op::Pong));
        }
        if let Some(line) = prefix_line(&self.buffer, b"-ERR ") {
            let reason = line.to_owned();
            let consumed = 5 + line.len() + 2;
            self.buffer.advance(consumed);
            return Ok(Some(Op::Err(reason)));
        }
        if let Some(line) = prefix_line(&self.buffer, b"INFO ") {
            let info: ServerInfo = serde_json::from_str(line).map_err(|e| err(format!("bad INFO json: {}", e)))?;
            let consumed = 5 + line.len() + 2;
            self.buffer.advance(consumed);
            return Ok(Some(Op::Info(Box::new(info))));
        }
        if let Some(line) = prefix_line(&self.buffer, b"CONNECT ") {
            let info: ConnectInfo = serde_json::from_str(line).map_err(|e| err(format!("bad CONNECT json: {}", e)))?;
            let consumed = 8 + line.len() + 2;
            self.buffer.advance(consumed);
            return Ok(Some(Op::Connect(Box::new(info))));
        }
        if let Some(line) = prefix_line(&self.buffer, b"SUB ") {
            let op = parse_sub(line)?;
            let consumed = 4 + line.len() + 2;
            self.buffer.advance(consumed);
            return Ok(Some(op));
        }
        if let Some(line) = prefix_line(&self.buffer, b"UNSUB ") {
            let op = parse_unsub(line)?;
            let consumed = 6 + line.len() + 2;
            self.buffer.advance(consumed);
            return Ok(Some(op));
        }
        if self.buffer.starts_with(b"PUB ") {
            return self.try_parse_payload_frame(4, b"PUB ", ParseKind::Pub);
        }
        if self.buffer.starts_with(b"MSG ") {
            return self.try_parse_payload_frame(4, b"MSG ", ParseKind::Msg);
        }
        if self.buffer.starts_with(b"RS+ ") {
            if let Some(line) = prefix_line(&self.buffer, b"RS+ ") {
                let op = parse_rs_plus(line)?;
                let consumed = 4 + line.len() + 2;
                self.buffer.advance(consumed);
                return Ok(Some(op));
            }
            return Ok(None);
        }
        if self.buffer.starts_with(b"RS- ") {
            if let Some(line) = prefix_line(&self.buffer, b"RS- ") {
                let op = parse_rs_minus(line)?;
                let consumed = 4 + line.len() + 2;
                self.buffer.advance(consumed);
                return Ok(Some(op));
            }
            return Ok(None);
        }
        if self.buffer.starts_with(b"RMSG ") {
            return self.try_parse_payload_frame(5, b"RMSG ", ParseKind::RMsg);
        }

        // Unknown verb: surface enough of the buffer to identify it, but
        // don't consume — the caller decides whether to close or skip.
        let verb_end = self.buffer.iter().position(|&b| b == b' ' || b == b'\r').unwrap_or(self.buffer.len());
        let verb = String::from_utf8_lossy(&self.buffer[..verb_end]).into_owned();
        Err(err(format!("unknown protocol operation {:?}", verb)))
    }

    fn try_parse_payload_frame(&mut self, verb_len: usize, verb: &[u8], kind: ParseKind) -> Result<Option<Op>, DecodeError> {
        let line = match prefix_line(&self.buffer, verb) {
            Some(l) => l,
            None => return Ok(None),
        };
        let header_len = verb_len + line.len() + 2;
        let parts: Vec<&str> = line.split(' ').filter(|s| !s.is_empty()).collect();

        let (op_shape, payload_len) = match kind {
            ParseKind::Pub => parse_pub_header(&parts)?,
            ParseKind::Msg => parse_msg_header(&parts)?,
            ParseKind::RMsg => parse_rmsg_header(&parts)?,
        };

        let total_len = header_len + payload_len + 2;
        if self.buffer.remaining() < total_len {
            return Ok(None);
        }

        self.buffer.advance(header_len);
        let payload = self.buffer.split_to(payload_len).freeze();
        if &self.buffer[..2] != b"\r\n" {
            return Err(err("payload length mismatch: missing trailing CRLF"));
        }
        self.buffer.advance(2);

        Ok(Some(op_shape(payload)))
    }
}

enum ParseKind {
    Pub,
    Msg,
    RMsg,
}

type OpBuilder = Box<dyn FnOnce(Bytes) -> Op>;

fn parse_pub_header(parts: &[&str]) -> Result<(OpBuilder, usize), DecodeError> {
    let (subject, reply, len) = match parts {
        [subject, len] => (*subject, None, *len),
        [subject, reply, len] => (*subject, Some(*reply), *len),
        _ => return Err(err("invalid number of arguments after PUB")),
    };
    let payload_len = usize::from_str(len).map_err(|_| err("invalid payload size in PUB"))?;
    let subject = subject.to_owned();
    let reply = reply.map(|r| r.to_owned());
    Ok((Box::new(move |payload| Op::Pub { subject, reply, payload }), payload_len))
}

fn parse_msg_header(parts: &[&str]) -> Result<(OpBuilder, usize), DecodeError> {
    let (subject, sid, reply, len) = match parts {
        [subject, sid, len] => (*subject, *sid, None, *len),
        [subject, sid, reply, len] => (*subject, *sid, Some(*reply), *len),
        _ => return Err(err("invalid number of arguments after MSG")),
    };
    let payload_len = usize::from_str(len).map_err(|_| err("invalid payload size in MSG"))?;
    let subject = subject.to_owned();
    let sid = Bytes::copy_from_slice(sid.as_bytes());
    let reply = reply.map(|r| r.to_owned());
    Ok((Box::new(move |payload| Op::Msg { subject, sid, reply, payload }), payload_len))
}

fn parse_rmsg_header(parts: &[&str]) -> Result<(OpBuilder, usize), DecodeError> {
    // RMSG <account> <subject> [reply] [queue-list] <n>
    if parts.len() < 3 {
        return Err(err("invalid number of arguments after RMSG"));
    }
    let account = parts[0].to_owned();
    let subject = parts[1].to_owned();
    let len = *parts.last().unwrap();
    let payload_len = usize::from_str(len).map_err(|_| err("invalid payload size in RMSG"))?;
    let middle = &parts[2..parts.len() - 1];

    // A queue-list entry is recognizable because RMSG's reply (if present)
    // always comes first; by convention this core requires a reply to be
    // marked with a leading '+' when queues follow it, matching how routes
    // in this corpus disambiguate optional trailing fields. Absent that
    // marker, if there's exactly one middle token we treat it as a reply.
    let (reply, queues) = match middle.len() {
        0 => (None, Vec::new()),
        1 => (Some(middle[0].to_owned()), Vec::new()),
        _ => {
            let reply = if let Some(stripped) = middle[0].strip_prefix('+') {
                Some(stripped.to_owned())
            } else {
                None
            };
            let queue_start = if reply.is_some() { 1 } else { 0 };
            let queues = middle[queue_start..].iter().map(|q| Bytes::copy_from_slice(q.as_bytes())).collect();
            (reply, queues)
        }
    };

    Ok((Box::new(move |payload| Op::RMsg { account, subject, reply, queues, payload }), payload_len))
}

fn parse_sub(line: &str) -> Result<Op, DecodeError> {
    let parts: Vec<&str> = line.split(' ').filter(|s| !s.is_empty()).collect();
    let (subject, queue, sid) = match parts[..] {
        [subject, sid] => (subject, None, sid),
        [subject, queue, sid] => (subject, Some(queue), sid),
        _ => return Err(err("invalid number of arguments after SUB")),
    };
    Ok(Op::Sub {
        subject: subject.to_owned(),
        queue: queue.map(|q| Bytes::copy_from_slice(q.as_bytes())),
        sid: Bytes::copy_from_slice(sid.as_bytes()),
    })
}

fn parse_unsub(line: &str) -> Result<Op, DecodeError> {
    let parts: Vec<&str> = line.split(' ').filter(|s| !s.is_empty()).collect();
    let (sid, max) = match parts[..] {
        [sid] => (sid, None),
        [sid, max] => (sid, Some(max)),
        _ => return Err(err("invalid number of arguments after UNSUB")),
    };
    let max = match max {
        Some(m) => Some(u64::from_str(m).map_err(|_| err("invalid max in UNSUB"))?),
        None => None,
    };
    Ok(Op::Unsub { sid: Bytes::copy_from_slice(sid.as_bytes()), max })
}

fn parse_rs_plus(line: &str) -> Result<Op, DecodeError> {
    // RS+ <account> <subject> [queue [weight]] <rsid>
    let parts: Vec<&str> = line.split(' ').filter(|s| !s.is_empty()).collect();
    match parts[..] {
        [account, subject, rsid] => Ok(Op::RsPlus {
            account: account.to_owned(),
            subject: subject.to_owned(),
            queue: None,
            weight: None,
            rsid: Bytes::copy_from_slice(rsid.as_bytes()),
        }),
        [account, subject, queue, weight, rsid] => Ok(Op::RsPlus {
            account: account.to_owned(),
            subject: subject.to_owned(),
            queue: Some(Bytes::copy_from_slice(queue.as_bytes())),
            weight: Some(u64::from_str(weight).map_err(|_| err("invalid weight in RS+"))?),
            rsid: Bytes::copy_from_slice(rsid.as_bytes()),
        }),
        _ => Err(err("invalid number of arguments after RS+")),
    }
}

fn parse_rs_minus(line: &str) -> Result<Op, DecodeError> {
    // RS- <account> <subject> [queue] <rsid>
    let parts: Vec<&str> = line.split(' ').filter(|s| !s.is_empty()).collect();
    match parts[..] {
        [account, subject, rsid] => Ok(Op::RsMinus {
            account: account.to_owned(),
            subject: subject.to_owned(),
            queue: None,
            rsid: Bytes::copy_from_slice(rsid.as_bytes()),
        }),
        [account, subject, queue, rsid] => Ok(Op::RsMinus {
            account: account.to_owned(),
            subject: subject.to_owned(),
            queue: Some(Bytes::copy_from_slice(queue.as_bytes())),
            rsid: Bytes::copy_from_slice(rsid.as_bytes()),
        }),
        _ => Err(err("invalid number of arguments after RS-")),
    }
}

/// Returns the line (without the verb prefix or trailing CRLF) once a full
/// `\r\n`-terminated line starting with `verb` is present in `buf`.
fn prefix_line<'a>(buf: &'a BytesMut, verb: &[u8]) -> Option<&'a str> {
    if !buf.starts_with(verb) {
        return None;
    }
    let crlf = find_crlf(&buf[verb.len()..])?;
    std::str::from_utf8(&buf[verb.len()..verb.len() + crlf]).ok()
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

// --- encoding ---

pub fn encode_info(info: &ServerInfo) -> Bytes {
    Bytes::from(format!("INFO {}\r\n", serde_json::to_string(info).expect("ServerInfo always serializes")))
}

pub fn encode_msg(subject: &str, sid: &[u8], reply: Option<&str>, payload: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(subject.len() + payload.len() + 32);
    out.extend_from_slice(b"MSG ");
    out.extend_from_slice(subject.as_bytes());
    out.push(b' ');
    out.extend_from_slice(sid);
    out.push(b' ');
    if let Some(r) = reply {
        out.extend_from_slice(r.as_bytes());
        out.push(b' ');
    }
    out.extend_from_slice(payload.len().to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(payload);
    out.extend_from_slice(b"\r\n");
    Bytes::from(out)
}

pub fn encode_rmsg(account: &str, subject: &str, reply: Option<&str>, queues: &[Bytes], payload: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(subject.len() + payload.len() + 32);
    out.extend_from_slice(b"RMSG ");
    out.extend_from_slice(account.as_bytes());
    out.push(b' ');
    out.extend_from_slice(subject.as_bytes());
    out.push(b' ');
    if let Some(r) = reply {
        out.push(b'+');
        out.extend_from_slice(r.as_bytes());
        out.push(b' ');
    }
    for q in queues {
        out.extend_from_slice(q);
        out.push(b' ');
    }
    out.extend_from_slice(payload.len().to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(payload);
    out.extend_from_slice(b"\r\n");
    Bytes::from(out)
}

pub fn encode_rs_plus(account: &str, subject: &str, queue: Option<&[u8]>, weight: Option<u64>, rsid: &[u8]) -> Bytes {
    let mut out = Vec::new();
    out.extend_from_slice(b"RS+ ");
    out.extend_from_slice(account.as_bytes());
    out.push(b' ');
    out.extend_from_slice(subject.as_bytes());
    out.push(b' ');
    if let Some(q) = queue {
        out.extend_from_slice(q);
        out.push(b' ');
        if let Some(w) = weight {
            out.extend_from_slice(w.to_string().as_bytes());
            out.push(b' ');
        }
    }
    out.extend_from_slice(rsid);
    out.extend_from_slice(b"\r\n");
    Bytes::from(out)
}

pub fn encode_rs_minus(account: &str, subject: &str, queue: Option<&[u8]>, rsid: &[u8]) -> Bytes {
    let mut out = Vec::new();
    out.extend_from_slice(b"RS- ");
    out.extend_from_slice(account.as_bytes());
    out.push(b' ');
    out.extend_from_slice(subject.as_bytes());
    out.push(b' ');
    if let Some(q) = queue {
        out.extend_from_slice(q);
        out.push(b' ');
    }
    out.extend_from_slice(rsid);
    out.extend_from_slice(b"\r\n");
    Bytes::from(out)
}

pub const PING: &[u8] = b"PING\r\n";
pub const PONG: &[u8] = b"PONG\r\n";
pub const OK: &[u8] = b"+OK\r\n";

pub fn encode_err(reason: &str) -> Bytes {
    Bytes::from(format!("-ERR '{}'\r\n", reason))
}
