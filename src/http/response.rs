//! Response construction and the router action type.

use crate::{
    buffer::Buffer,
    errors::Fault,
    http::connection::HttpConn,
    pipe::{data_producer, Producer, SinkRef},
};
use log::error;
use std::collections::BTreeMap;

/// What a router hands back for a request.
pub enum Action {
    /// Emit a response now.
    Respond(Response),
    /// Defer the response: install a consume function that receives the
    /// request body as view-buffer slices and once `None` at end-of-body.
    /// The response it returns from any invocation is the one sent.
    Consume(ConsumeFn),
}

/// One-shot continuation for request-body bytes. Invoked with `Some` view
/// buffer for each body slice and with `None` exactly once at end-of-body,
/// after which the connection clears it.
pub type ConsumeFn = Box<dyn FnMut(Option<&mut Buffer>) -> Option<Response>>;

impl Action {
    /// Builds a consume action from a closure.
    pub fn consume(f: impl FnMut(Option<&mut Buffer>) -> Option<Response> + 'static) -> Self {
        Action::Consume(Box::new(f))
    }
}

impl From<Response> for Action {
    fn from(r: Response) -> Self {
        Action::Respond(r)
    }
}

/// An HTTP response: status code, header map and a body producer.
///
/// Header keys are canonicalized to lowercase at insertion and emitted in
/// key order. Emission queues two producers on the connection: one for the
/// status line plus headers, one for the body.
pub struct Response {
    code: u16,
    headers: BTreeMap<String, String>,
    body: Body,
}

enum Body {
    Empty,
    Stream(Producer),
    Upgrade(SinkRef),
}

impl Response {
    /// Response with a streaming body producer. The caller must supply a
    /// `content-length` header; a streamed body without one refuses to
    /// produce and closes the connection.
    pub fn stream(code: u16, prod: Producer) -> Self {
        Response {
            code,
            headers: BTreeMap::new(),
            body: Body::Stream(prod),
        }
    }

    /// Response carrying a byte payload with its `content-length` set.
    pub fn blob(code: u16, data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        let len = data.len();
        Response::stream(code, data_producer(data)).header("content-length", len.to_string())
    }

    /// Plain-text response with `content-length` and `content-type` set.
    pub fn text(code: u16, body: impl Into<String>) -> Self {
        Response::blob(code, body.into().into_bytes()).header("content-type", "text/plain")
    }

    /// Bodiless response with an explicit zero `content-length`.
    pub fn empty(code: u16) -> Self {
        Response {
            code,
            headers: BTreeMap::new(),
            body: Body::Empty,
        }
        .header("content-length", "0")
    }

    /// Protocol-switch response: emits status plus headers, then installs
    /// `sink` as the connection's current sink instead of producing a body.
    pub(crate) fn switching(code: u16, sink: SinkRef) -> Self {
        Response {
            code,
            headers: BTreeMap::new(),
            body: Body::Upgrade(sink),
        }
    }

    /// Sets a header, treating the key case-insensitively.
    pub fn header(mut self, key: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers.insert(key.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    pub(crate) fn head_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(b"HTTP/1.1 ");
        out.extend_from_slice(self.code.to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(reason(self.code).as_bytes());
        out.extend_from_slice(b"\r\n");
        for (k, v) in &self.headers {
            out.extend_from_slice(k.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(v.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }

    /// Queues the status line and headers as one producer and the body as
    /// the next, or swaps in the upgrade sink for protocol switches.
    pub(crate) fn produce(self, http: &mut HttpConn) -> bool {
        if matches!(self.body, Body::Stream(_)) && !self.headers.contains_key("content-length") {
            error!("dropping connection: {}", Fault::ResponseWithoutLength);
            return false;
        }
        let head = self.head_bytes();
        if !http.push_producer(data_producer(head)) {
            return false;
        }
        match self.body {
            Body::Empty => true,
            Body::Stream(prod) => http.push_producer(prod),
            Body::Upgrade(sink) => http.install_sink(sink),
        }
    }
}

fn reason(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        426 => "Upgrade Required",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head_str(r: &Response) -> String {
        String::from_utf8(r.head_bytes()).unwrap()
    }

    #[test]
    fn status_lines() {
        #[rustfmt::skip]
        let cases = [
            (200, "HTTP/1.1 200 OK\r\n\r\n"),
            (404, "HTTP/1.1 404 Not Found\r\n\r\n"),
            (101, "HTTP/1.1 101 Switching Protocols\r\n\r\n"),
            (599, "HTTP/1.1 599 Unknown\r\n\r\n"),
        ];

        for (code, expected) in cases {
            let r = Response {
                code,
                headers: BTreeMap::new(),
                body: Body::Empty,
            };
            assert_eq!(head_str(&r), expected);
        }
    }

    #[test]
    fn headers_are_lowercased_and_key_ordered() {
        let r = Response::empty(200)
            .header("X-Later", "2")
            .header("Accept", "1");
        assert_eq!(
            head_str(&r),
            "HTTP/1.1 200 OK\r\naccept: 1\r\ncontent-length: 0\r\nx-later: 2\r\n\r\n"
        );
    }

    #[test]
    fn duplicate_keys_overwrite() {
        let r = Response::empty(200)
            .header("X-Tag", "old")
            .header("x-tag", "new");
        assert!(head_str(&r).contains("x-tag: new\r\n"));
        assert!(!head_str(&r).contains("old"));
    }

    #[test]
    fn text_sets_length_and_type() {
        let r = Response::text(200, "Hello");
        let head = head_str(&r);
        assert!(head.contains("content-length: 5\r\n"));
        assert!(head.contains("content-type: text/plain\r\n"));
    }
}
