//! The byte pipeline: sinks on the way in, producers on the way out.
//!
//! A connection owns one active [`Sink`] at a time; arriving bytes are pushed
//! through it and the sink advances whatever protocol state machine it
//! implements. Outbound bytes are pulled from a FIFO of [`Producer`]s. Both
//! directions are re-entrant safe under partial progress: a sink left
//! mid-state and a producer left mid-payload simply resume on the next poll.
//!
//! The module also carries the two reusable parsers every text protocol
//! needs, a terminator-delimited line reader and an RFC 822 header-block
//! reader, plus [`Conn`], the control block a reactor hands to protocol
//! code.

use crate::{buffer::Buffer, errors::Fault};
use std::{any::Any, cell::RefCell, collections::VecDeque, rc::Rc};

/// A stateful byte consumer.
///
/// Returning `false` is terminal: the reactor stops reading and drops the
/// connection once pending output has drained. A sink may re-point the
/// connection's current sink from inside `drain`; bytes it leaves in `buf`
/// are delivered to the newly installed sink within the same poll.
pub trait Sink {
    fn drain(&mut self, buf: &mut Buffer<'_>) -> bool;
}

/// Shared handle to a sink. The same sink instance is installed repeatedly
/// across requests, so ownership is shared between the connection slot and
/// whoever re-arms it.
pub type SinkRef = Rc<RefCell<dyn Sink>>;

/// A pullable byte generator.
///
/// Writes as much as fits into the output buffer and returns `true` while it
/// has more to produce; `false` removes it from the queue. A producer that
/// cannot make progress must return without writing rather than spin.
pub type Producer = Box<dyn FnMut(&mut Buffer<'_>) -> bool>;

/// Wraps a byte payload into a [`Producer`] that drains it across as many
/// output cycles as the buffer requires.
pub fn data_producer(data: impl Into<Vec<u8>>) -> Producer {
    let data = data.into();
    let mut off = 0;
    Box::new(move |out: &mut Buffer<'_>| {
        let avail = out.compact();
        let n = (data.len() - off).min(avail);
        out.to_produce()[..n].copy_from_slice(&data[off..off + n]);
        out.produced(n);
        off += n;
        off != data.len()
    })
}

/// Per-connection control block shared between the reactor and the protocol
/// stack: the active sink, the outbound producer queue and a context slot
/// that keeps the protocol object alive for as long as the connection is.
pub struct Conn {
    pub(crate) current_sink: Option<SinkRef>,
    pub(crate) producers: VecDeque<Producer>,
    pub(crate) ctx: Option<Rc<dyn Any>>,
}

/// Shared handle to a [`Conn`].
pub type ConnRef = Rc<RefCell<Conn>>;

impl Conn {
    pub fn new() -> ConnRef {
        Rc::new(RefCell::new(Conn {
            current_sink: None,
            producers: VecDeque::new(),
            ctx: None,
        }))
    }

    /// Installs `sink` as the active byte consumer.
    pub fn set_sink(&mut self, sink: SinkRef) {
        self.current_sink = Some(sink);
    }

    /// Disarms input; the reactor closes the socket once output has drained.
    pub fn clear_sink(&mut self) {
        self.current_sink = None;
    }

    /// Appends a producer to the outbound queue.
    pub fn push_producer(&mut self, p: Producer) {
        self.producers.push_back(p);
    }

    /// Stores the protocol object owning this connection.
    pub fn set_ctx(&mut self, ctx: Rc<dyn Any>) {
        self.ctx = Some(ctx);
    }
}

// LINE PARSER

/// Accumulates bytes until a terminator is seen, bounded by a maximum line
/// length. At most one line is delivered per call so that a caller swapping
/// sinks on a line boundary leaves the remaining bytes for the next sink.
pub struct LineParser {
    term: &'static [u8],
    max: usize,
    acc: Vec<u8>,
}

#[derive(Debug, PartialEq)]
pub enum LineEvent {
    /// Buffer exhausted before the terminator appeared.
    Partial,
    /// A full line, terminator stripped.
    Line(String),
}

impl LineParser {
    pub fn new(term: &'static [u8], max: usize) -> Self {
        debug_assert!(!term.is_empty());
        Self {
            term,
            max,
            acc: Vec::new(),
        }
    }

    pub fn feed(&mut self, buf: &mut Buffer<'_>) -> Result<LineEvent, Fault> {
        let last = *self.term.last().unwrap();
        while buf.usage() > 0 {
            let room = self.max - self.acc.len();
            let readable = buf.to_consume();
            let scan = readable.len().min(room);
            match memchr::memchr(last, &readable[..scan]) {
                Some(i) => {
                    self.acc.extend_from_slice(&readable[..=i]);
                    buf.consumed(i + 1);
                    if self.acc.len() > self.term.len() && self.acc.ends_with(self.term) {
                        self.acc.truncate(self.acc.len() - self.term.len());
                        let line = String::from_utf8_lossy(&self.acc).into_owned();
                        self.acc.clear();
                        return Ok(LineEvent::Line(line));
                    }
                }
                None => {
                    self.acc.extend_from_slice(&readable[..scan]);
                    buf.consumed(scan);
                    if self.acc.len() >= self.max {
                        return Err(Fault::LineTooLong);
                    }
                }
            }
        }
        Ok(LineEvent::Partial)
    }
}

// HEADER PARSER

/// Incremental parser of an RFC 822 header block with folded continuation
/// lines and an optional per-character key filter (lowercasing for HTTP).
///
/// Emits one event per call: a completed `key: value` field, the blank-line
/// terminator, or `Partial` when the buffer runs dry mid-field. The parser
/// re-arms itself after the terminator so the same instance serves every
/// request on a connection.
pub struct HeaderParser {
    state: HeaderState,
    key: Vec<u8>,
    value: Vec<u8>,
    count: usize,
    max: usize,
    filter: Option<fn(u8) -> u8>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum HeaderState {
    FirstLineStart,
    LineStart,
    TestEmptyLine,
    InKey,
    PostKeySkip,
    InValue,
    PostValue,
}

#[derive(Debug, PartialEq)]
pub enum HeaderEvent {
    Partial,
    Field(String, String),
    End,
}

impl HeaderParser {
    pub fn new(max: usize, filter: Option<fn(u8) -> u8>) -> Self {
        Self {
            state: HeaderState::FirstLineStart,
            key: Vec::new(),
            value: Vec::new(),
            count: 0,
            max,
            filter,
        }
    }

    fn filtered(&self, c: u8) -> u8 {
        match self.filter {
            Some(f) => f(c),
            None => c,
        }
    }

    fn take_field(&mut self) -> HeaderEvent {
        let k = String::from_utf8_lossy(&self.key).into_owned();
        let v = String::from_utf8_lossy(&self.value).into_owned();
        self.key.clear();
        self.value.clear();
        HeaderEvent::Field(k, v)
    }

    pub fn feed(&mut self, buf: &mut Buffer<'_>) -> Result<HeaderEvent, Fault> {
        use HeaderState::*;

        while buf.usage() > 0 {
            if self.count >= self.max {
                return Err(Fault::HeadersTooLarge);
            }
            let c = buf.consume();
            self.count += 1;
            match self.state {
                FirstLineStart | LineStart => {
                    if c == b'\r' {
                        let pending = self.state == LineStart;
                        self.state = TestEmptyLine;
                        if pending {
                            return Ok(self.take_field());
                        }
                        continue;
                    }
                    if c == b'\n' {
                        return Err(Fault::BareLf);
                    }
                    if self.state == LineStart {
                        if c.is_ascii_whitespace() {
                            // folded continuation, keep extending the value
                            self.state = InValue;
                            self.value.push(c);
                            continue;
                        }
                        let ev = self.take_field();
                        self.state = InKey;
                        let c = self.filtered(c);
                        self.key.push(c);
                        return Ok(ev);
                    }
                    if c.is_ascii_whitespace() {
                        continue;
                    }
                    self.state = InKey;
                    let c = self.filtered(c);
                    self.key.push(c);
                }
                TestEmptyLine => {
                    if c != b'\n' {
                        return Err(Fault::CrWithoutLf);
                    }
                    self.state = FirstLineStart;
                    self.count = 0;
                    self.key.clear();
                    self.value.clear();
                    return Ok(HeaderEvent::End);
                }
                InKey => {
                    if c == b':' {
                        self.state = PostKeySkip;
                    } else {
                        let c = self.filtered(c);
                        self.key.push(c);
                    }
                }
                PostKeySkip => {
                    if c == b'\r' {
                        // value-less header line
                        self.state = PostValue;
                    } else if !c.is_ascii_whitespace() {
                        self.state = InValue;
                        self.value.push(c);
                    }
                }
                InValue => {
                    if c == b'\r' {
                        self.state = PostValue;
                    } else {
                        self.value.push(c);
                    }
                }
                PostValue => {
                    if c != b'\n' {
                        return Err(Fault::CrWithoutLf);
                    }
                    self.state = LineStart;
                }
            }
        }
        Ok(HeaderEvent::Partial)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::buffer::Buffer;

    /// Loads `bytes` into a fresh owned buffer.
    pub(crate) fn buf(bytes: &[u8]) -> Buffer<'static> {
        let mut b = Buffer::with_capacity(bytes.len().max(16));
        b.to_produce()[..bytes.len()].copy_from_slice(bytes);
        b.produced(bytes.len());
        b
    }

    /// Runs the connection's producer queue dry and returns what came out.
    pub(crate) fn drain_producers(conn: &ConnRef) -> Vec<u8> {
        let mut out = Vec::new();
        let mut scratch = Buffer::with_capacity(64);
        loop {
            let Some(mut p) = conn.borrow_mut().producers.pop_front() else {
                break;
            };
            loop {
                let keep = p(&mut scratch);
                let n = scratch.usage();
                out.extend_from_slice(scratch.to_consume());
                scratch.consumed(n);
                if !keep {
                    break;
                }
                assert!(n > 0, "producer spinning without output");
            }
        }
        out
    }
}


#[cfg(test)]
mod header_tests {
    use super::test_support::buf;
    use super::*;

    fn lower(c: u8) -> u8 {
        c.to_ascii_lowercase()
    }

    fn collect(block: &[u8]) -> Result<Vec<(String, String)>, Fault> {
        let mut p = HeaderParser::new(1024, Some(lower));
        let mut b = buf(block);
        let mut out = Vec::new();
        loop {
            match p.feed(&mut b)? {
                HeaderEvent::Partial => panic!("block ended without terminator"),
                HeaderEvent::Field(k, v) => out.push((k, v)),
                HeaderEvent::End => return Ok(out),
            }
        }
    }

    #[test]
    fn parses_fields() {
        #[rustfmt::skip]
        let cases: &[(&[u8], &[(&str, &str)])] = &[
            (b"Host: x\r\n\r\n",                        &[("host", "x")]),
            (b"HOST: x\r\nUser-Agent: curl\r\n\r\n",    &[("host", "x"), ("user-agent", "curl")]),
            (b"A: 1\r\nB:    spaced\r\n\r\n",           &[("a", "1"), ("b", "spaced")]),
            (b"Fold: one\r\n  two\r\n\r\n",             &[("fold", "one  two")]),
            (b"Empty:\r\n\r\n",                         &[("empty", "")]),
            (b"\r\n",                                   &[]),
        ];

        for &(block, expected) in cases {
            let got = collect(block).unwrap();
            let want: Vec<(String, String)> = expected
                .iter()
                .map(|&(k, v)| (k.into(), v.into()))
                .collect();
            assert_eq!(got, want, "block {:?}", String::from_utf8_lossy(block));
        }
    }

    #[test]
    fn faults() {
        #[rustfmt::skip]
        let cases: &[(&[u8], Fault)] = &[
            (b"\nHost: x\r\n\r\n",    Fault::BareLf),
            (b"Host: x\rz\r\n",       Fault::CrWithoutLf),
            (b"\rz",                  Fault::CrWithoutLf),
        ];

        for &(block, fault) in cases {
            assert_eq!(collect(block), Err(fault));
        }
    }

    #[test]
    fn oversized_block_faults() {
        let mut p = HeaderParser::new(16, None);
        let mut b = buf(b"Header: aaaaaaaaaaaaaaaaaaaa\r\n\r\n");
        loop {
            match p.feed(&mut b) {
                Ok(HeaderEvent::Partial) => panic!("should have faulted"),
                Ok(_) => continue,
                Err(f) => {
                    assert_eq!(f, Fault::HeadersTooLarge);
                    break;
                }
            }
        }
    }

    #[test]
    fn rearms_after_terminator() {
        let mut p = HeaderParser::new(64, Some(lower));
        let mut b = buf(b"A: 1\r\n\r\nB: 2\r\n\r\n");
        assert_eq!(p.feed(&mut b).unwrap(), HeaderEvent::Field("a".into(), "1".into()));
        assert_eq!(p.feed(&mut b).unwrap(), HeaderEvent::End);
        assert_eq!(p.feed(&mut b).unwrap(), HeaderEvent::Field("b".into(), "2".into()));
        assert_eq!(p.feed(&mut b).unwrap(), HeaderEvent::End);
    }

    #[test]
    fn split_points_do_not_matter() {
        let block = b"Host: example\r\nAccept: */*\r\n\r\n";
        for split in 1..block.len() {
            let mut p = HeaderParser::new(1024, Some(lower));
            let mut fields = Vec::new();
            for part in [&block[..split], &block[split..]] {
                let mut b = buf(part);
                loop {
                    match p.feed(&mut b).unwrap() {
                        HeaderEvent::Partial => break,
                        HeaderEvent::Field(k, v) => fields.push((k, v)),
                        HeaderEvent::End => break,
                    }
                }
            }
            assert_eq!(
                fields,
                vec![
                    ("host".to_string(), "example".to_string()),
                    ("accept".to_string(), "*/*".to_string())
                ],
                "split at {split}"
            );
        }
    }
}

#[cfg(test)]
mod producer_tests {
    use super::*;

    #[test]
    fn data_producer_drains_across_small_buffers() {
        let mut p = data_producer(b"hello world".to_vec());
        let mut out = Buffer::with_capacity(4);
        let mut collected = Vec::new();
        let mut keep = true;
        while keep {
            keep = p(&mut out);
            collected.extend_from_slice(out.to_consume());
            let n = out.usage();
            out.consumed(n);
        }
        assert_eq!(collected, b"hello world");
    }

    #[test]
    fn empty_payload_finishes_immediately() {
        let mut p = data_producer(Vec::new());
        let mut out = Buffer::with_capacity(4);
        assert!(!p(&mut out));
        assert_eq!(out.usage(), 0);
    }
}
