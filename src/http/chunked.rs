//! Incremental decoder for chunked transfer-encoding.
//!
//! Chunk extensions are tolerated in both their token and quoted-string
//! forms and discarded. Body bytes are forwarded to the connection's consume
//! function in view-buffer slices; a zero-length chunk hands control to the
//! trailing header block.

use crate::{
    buffer::Buffer,
    errors::Fault,
    http::connection::{deliver_body, HttpConn},
    pipe::Sink,
};
use log::debug;
use std::{
    cell::RefCell,
    rc::{Rc, Weak},
};

#[derive(Debug, Clone, Copy, PartialEq)]
enum ChunkState {
    /// Hex digits of the chunk size.
    Size,
    /// After the size or an extension: `;`, or CR closing the size line.
    PostSize,
    /// LF closing the size line; decides between body and trailer.
    SizeLf,
    /// CR terminating the chunk payload.
    BodyCr,
    /// LF terminating the chunk payload.
    BodyLf,
    /// Extension name token.
    ExtName,
    /// First byte of an extension value.
    ExtValueStart,
    /// Unquoted extension value token.
    ExtValueToken,
    /// Quoted-string extension value with backslash escapes.
    ExtValueQuoted,
    /// Chunk payload bytes.
    Body,
}

pub(crate) struct ChunkedBodySink {
    http: Weak<RefCell<HttpConn>>,
    state: ChunkState,
    size: u64,
    escaped: bool,
}

impl ChunkedBodySink {
    pub(crate) fn new(http: Weak<RefCell<HttpConn>>) -> Self {
        Self {
            http,
            state: ChunkState::Size,
            size: 0,
            escaped: false,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.state = ChunkState::Size;
        self.size = 0;
        self.escaped = false;
    }

    /// Advances the machine by one state transition. `Ok(Step::HandedOff)`
    /// means the zero chunk arrived and the trailer sink now owns the rest
    /// of the buffer.
    fn step(&mut self, http: &Rc<RefCell<HttpConn>>, buf: &mut Buffer<'_>) -> Result<Step, Fault> {
        use ChunkState::*;

        match self.state {
            Size => {
                let c = buf.peek().unwrap();
                match hex_value(c) {
                    Some(v) => {
                        buf.consume();
                        self.size = self
                            .size
                            .checked_mul(16)
                            .and_then(|s| s.checked_add(v as u64))
                            .ok_or(Fault::BadChunkSize)?;
                    }
                    None => self.state = PostSize,
                }
            }
            PostSize => match buf.consume() {
                b';' => self.state = ExtName,
                b'\r' => self.state = SizeLf,
                _ => return Err(Fault::BadChunkDelimiter),
            },
            SizeLf => {
                if buf.consume() != b'\n' {
                    return Err(Fault::BadChunkDelimiter);
                }
                if self.size == 0 {
                    self.reset();
                    if !http.borrow_mut().enter_trailer() {
                        return Err(Fault::BadChunkDelimiter);
                    }
                    return Ok(Step::HandedOff);
                }
                self.state = Body;
            }
            Body => {
                let n = (buf.usage() as u64).min(self.size) as usize;
                if !deliver_body(http, buf, n) {
                    return Ok(Step::Dead);
                }
                self.size -= n as u64;
                if self.size == 0 {
                    self.state = BodyCr;
                }
            }
            BodyCr => {
                if buf.consume() != b'\r' {
                    return Err(Fault::BadChunkDelimiter);
                }
                self.state = BodyLf;
            }
            BodyLf => {
                if buf.consume() != b'\n' {
                    return Err(Fault::BadChunkDelimiter);
                }
                self.state = Size;
            }
            ExtName => match buf.peek().unwrap() {
                b'=' => {
                    buf.consume();
                    self.state = ExtValueStart;
                }
                b'\r' => {
                    buf.consume();
                    self.state = SizeLf;
                }
                c if is_token_byte(c) => {
                    buf.consume();
                }
                _ => return Err(Fault::BadChunkExtension),
            },
            ExtValueStart => {
                if buf.peek().unwrap() == b'"' {
                    buf.consume();
                    self.escaped = false;
                    self.state = ExtValueQuoted;
                } else {
                    self.state = ExtValueToken;
                }
            }
            ExtValueToken => {
                if is_token_byte(buf.peek().unwrap()) {
                    buf.consume();
                } else {
                    self.state = PostSize;
                }
            }
            ExtValueQuoted => {
                let c = buf.consume();
                if self.escaped {
                    self.escaped = false;
                } else if c == b'\\' {
                    self.escaped = true;
                } else if c == b'"' {
                    self.state = PostSize;
                }
            }
        }
        Ok(Step::Continue)
    }
}

enum Step {
    Continue,
    HandedOff,
    /// The connection underneath is gone or refused the response.
    Dead,
}

impl Sink for ChunkedBodySink {
    fn drain(&mut self, buf: &mut Buffer<'_>) -> bool {
        let Some(http) = self.http.upgrade() else {
            return false;
        };
        while buf.usage() > 0 {
            match self.step(&http, buf) {
                Ok(Step::Continue) => {}
                Ok(Step::HandedOff) => return true,
                Ok(Step::Dead) => return false,
                Err(fault) => {
                    debug!("dropping connection: {fault}");
                    return false;
                }
            }
        }
        true
    }
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Token characters per the HTTP grammar: printable ASCII minus separators.
pub(crate) fn is_token_byte(c: u8) -> bool {
    if !(0x21..=0x7e).contains(&c) {
        return false;
    }
    !matches!(
        c,
        b'(' | b')'
            | b'<'
            | b'>'
            | b'@'
            | b','
            | b';'
            | b':'
            | b'\\'
            | b'"'
            | b'/'
            | b'['
            | b']'
            | b'?'
            | b'='
            | b'{'
            | b'}'
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::connection::test_support::{pump, serve};
    use crate::http::response::{Action, Response};
    use crate::pipe::test_support::drain_producers;

    type Log = Rc<RefCell<Vec<Option<Vec<u8>>>>>;

    fn collecting_server(log: &Log) -> crate::pipe::ConnRef {
        let log = log.clone();
        serve(move |_| {
            let log = log.clone();
            Some(Action::consume(move |slice| match slice {
                Some(view) => {
                    log.borrow_mut().push(Some(view.to_consume().to_vec()));
                    None
                }
                None => {
                    log.borrow_mut().push(None);
                    Some(Response::text(200, "done"))
                }
            }))
        })
    }

    fn chunked_request(body: &[u8]) -> Vec<u8> {
        let mut req = b"POST /sink HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        req.extend_from_slice(body);
        req
    }

    fn delivered(log: &Log) -> Vec<u8> {
        log.borrow()
            .iter()
            .flatten()
            .flat_map(|v| v.iter().copied())
            .collect()
    }

    #[test]
    fn two_chunks_reassemble() {
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let conn = collecting_server(&log);
        assert!(pump(
            &conn,
            &chunked_request(b"5\r\nHello\r\n6\r\n World\r\n0\r\n\r\n")
        ));
        assert_eq!(
            *log.borrow(),
            vec![
                Some(b"Hello".to_vec()),
                Some(b" World".to_vec()),
                None
            ]
        );
        let out = String::from_utf8(drain_producers(&conn)).unwrap();
        assert!(out.ends_with("done"), "{out}");
        // keep-alive survives a chunked body
        assert!(conn.borrow().current_sink.is_some());
    }

    #[test]
    fn reassembly_is_split_invariant() {
        let wire = chunked_request(b"3\r\nabc\r\nA\r\n0123456789\r\n0\r\n\r\n");
        for split in 1..wire.len() {
            let log: Log = Rc::new(RefCell::new(Vec::new()));
            let conn = collecting_server(&log);
            assert!(pump(&conn, &wire[..split]), "split {split}");
            assert!(pump(&conn, &wire[split..]), "split {split}");
            assert_eq!(delivered(&log), b"abc0123456789", "split {split}");
            assert_eq!(log.borrow().last(), Some(&None), "split {split}");
        }
    }

    #[test]
    fn extensions_are_skipped() {
        #[rustfmt::skip]
        let bodies: &[&[u8]] = &[
            b"3;name\r\nabc\r\n0\r\n\r\n",
            b"3;name=token\r\nabc\r\n0\r\n\r\n",
            b"3;name=\"quoted value\"\r\nabc\r\n0\r\n\r\n",
            b"3;name=\"with \\\" escape\"\r\nabc\r\n0\r\n\r\n",
            b"3;a=1;b=2\r\nabc\r\n0;last\r\n\r\n",
        ];

        for &body in bodies {
            let log: Log = Rc::new(RefCell::new(Vec::new()));
            let conn = collecting_server(&log);
            assert!(pump(&conn, &chunked_request(body)), "{body:?}");
            assert_eq!(delivered(&log), b"abc", "{body:?}");
        }
    }

    #[test]
    fn uppercase_hex_sizes_parse() {
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let conn = collecting_server(&log);
        let payload = vec![b'x'; 0x1A];
        let mut body = b"1A\r\n".to_vec();
        body.extend_from_slice(&payload);
        body.extend_from_slice(b"\r\n0\r\n\r\n");
        assert!(pump(&conn, &chunked_request(&body)));
        assert_eq!(delivered(&log), payload);
    }

    #[test]
    fn trailer_headers_are_accepted_and_dropped() {
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let conn = collecting_server(&log);
        assert!(pump(
            &conn,
            &chunked_request(b"2\r\nhi\r\n0\r\nX-Checksum: abc\r\n\r\n")
        ));
        assert_eq!(delivered(&log), b"hi");
        assert_eq!(log.borrow().last(), Some(&None));
        assert!(conn.borrow().current_sink.is_some());
    }

    #[test]
    fn malformed_framing_fails_the_connection() {
        #[rustfmt::skip]
        let bodies: &[&[u8]] = &[
            b"zz\r\nhi\r\n0\r\n\r\n",      // size is not hex
            b"2\rhi",                       // cr without lf after size
            b"2\r\nhi!!\r\n",               // payload terminator missing
            b"2;bad ext\r\nhi\r\n0\r\n\r\n", // space in extension token
        ];

        for &body in bodies {
            let log: Log = Rc::new(RefCell::new(Vec::new()));
            let conn = collecting_server(&log);
            assert!(!pump(&conn, &chunked_request(body)), "{body:?}");
        }
    }

    #[test]
    fn oversized_chunk_size_fails_instead_of_wrapping() {
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let conn = collecting_server(&log);
        assert!(!pump(
            &conn,
            &chunked_request(b"fffffffffffffffff\r\nx\r\n0\r\n\r\n")
        ));
    }
}
