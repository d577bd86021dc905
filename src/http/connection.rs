//! The HTTP/1.1 connection state machine.
//!
//! A connection walks each request through a pipeline of sinks: the
//! request-line sink parses the first line, the header sink fills the header
//! map and dispatches to the router, then a body sink (sized or chunked)
//! streams the payload into an installed consume function. After the
//! response producers are queued the request-line sink is re-armed for the
//! next request, or input is disarmed for HTTP/1.0 peers.
//!
//! The sinks are independent objects sharing weak references to the
//! [`HttpConn`] they drive; the connection in turn only weakly references
//! the reactor's control block, so the reactor dropping a connection tears
//! the whole structure down without reference cycles.

use crate::{
    buffer::Buffer,
    errors::Fault,
    http::{
        chunked::ChunkedBodySink,
        response::{Action, ConsumeFn, Response},
    },
    limits::HttpLimits,
    pipe::{
        Conn, ConnRef, HeaderEvent, HeaderParser, LineEvent, LineParser, Producer, Sink, SinkRef,
    },
};
use log::{debug, trace};
use std::{
    cell::RefCell,
    collections::HashMap,
    rc::{Rc, Weak},
};

/// Builds a connection factory for [`Reactor::listen`](crate::Reactor::listen)
/// with default [`HttpLimits`].
pub fn make_server<R>(router: R) -> impl Fn(&ConnRef)
where
    R: Fn(&mut HttpConn) -> Option<Action> + 'static,
{
    make_server_with(HttpLimits::default(), router)
}

/// Builds a connection factory with explicit parser limits. The router is
/// installed once and shared by every connection the listener accepts.
pub fn make_server_with<R>(limits: HttpLimits, router: R) -> impl Fn(&ConnRef)
where
    R: Fn(&mut HttpConn) -> Option<Action> + 'static,
{
    let router: Rc<dyn Fn(&mut HttpConn) -> Option<Action>> = Rc::new(router);
    move |conn| {
        HttpConn::attach(conn, router.clone(), &limits);
    }
}

fn lower(c: u8) -> u8 {
    c.to_ascii_lowercase()
}

/// Per-connection HTTP state: the request line, the case-folded header map,
/// the router, the optional body consume function and the reusable protocol
/// sinks.
pub struct HttpConn {
    conn: Weak<RefCell<Conn>>,
    wthis: Weak<RefCell<HttpConn>>,

    reqline: [String; 3],
    headers: HashMap<String, String>,

    router: Rc<dyn Fn(&mut HttpConn) -> Option<Action>>,
    consume: Option<ConsumeFn>,
    produced: bool,

    reqline_sink: Rc<RefCell<RequestLineSink>>,
    header_sink: Rc<RefCell<HeaderFieldSink>>,
    sized_sink: Rc<RefCell<SizedBodySink>>,
    chunked_sink: Rc<RefCell<ChunkedBodySink>>,
    trailer_sink: Rc<RefCell<TrailerSink>>,
}

enum BodyMode {
    None,
    Sized(usize),
    Chunked,
}

impl HttpConn {
    /// Creates the HTTP state for a freshly accepted connection, stores it in
    /// the connection's context slot and installs the request-line sink.
    pub(crate) fn attach(
        conn: &ConnRef,
        router: Rc<dyn Fn(&mut HttpConn) -> Option<Action>>,
        limits: &HttpLimits,
    ) -> Rc<RefCell<HttpConn>> {
        let http = Rc::new_cyclic(|wthis: &Weak<RefCell<HttpConn>>| {
            RefCell::new(HttpConn {
                conn: Rc::downgrade(conn),
                wthis: wthis.clone(),
                reqline: Default::default(),
                headers: HashMap::new(),
                router,
                consume: None,
                produced: false,
                reqline_sink: Rc::new(RefCell::new(RequestLineSink {
                    http: wthis.clone(),
                    line: LineParser::new(b"\r\n", limits.request_line_max),
                })),
                header_sink: Rc::new(RefCell::new(HeaderFieldSink {
                    http: wthis.clone(),
                    parser: HeaderParser::new(limits.header_block_max, Some(lower)),
                })),
                sized_sink: Rc::new(RefCell::new(SizedBodySink {
                    http: wthis.clone(),
                    remaining: 0,
                })),
                chunked_sink: Rc::new(RefCell::new(ChunkedBodySink::new(wthis.clone()))),
                trailer_sink: Rc::new(RefCell::new(TrailerSink {
                    http: wthis.clone(),
                    parser: HeaderParser::new(limits.header_block_max, Some(lower)),
                })),
            })
        });
        {
            let mut c = conn.borrow_mut();
            c.set_ctx(http.clone());
            let sink: SinkRef = http.borrow().reqline_sink.clone();
            c.set_sink(sink);
        }
        trace!("http connection attached");
        http
    }
}

// Public request surface for routers.
impl HttpConn {
    /// Request method token, e.g. `GET`.
    pub fn method(&self) -> &str {
        &self.reqline[0]
    }

    /// Raw request target as sent on the wire.
    pub fn url(&self) -> &str {
        &self.reqline[1]
    }

    /// Rewrites the request target, e.g. mapping `/` to an index file
    /// before handing off to [`match_file_response`](crate::http::files).
    pub fn set_url(&mut self, url: impl Into<String>) {
        self.reqline[1] = url.into();
    }

    /// Protocol version token, e.g. `HTTP/1.1`. Empty on a two-token line.
    pub fn version(&self) -> &str {
        &self.reqline[2]
    }

    /// Header value by its lowercase name, if the request carried it.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn has_header(&self, key: &str) -> bool {
        self.headers.contains_key(key)
    }
}

// Pipeline plumbing.
impl HttpConn {
    pub(crate) fn weak(&self) -> Weak<RefCell<HttpConn>> {
        self.wthis.clone()
    }

    /// Re-points the connection's current sink; fails when the reactor has
    /// already dropped the connection.
    pub(crate) fn install_sink(&mut self, sink: SinkRef) -> bool {
        match self.conn.upgrade() {
            Some(c) => {
                c.borrow_mut().set_sink(sink);
                true
            }
            None => false,
        }
    }

    /// Appends to the connection's outbound producer queue.
    pub(crate) fn push_producer(&mut self, p: Producer) -> bool {
        match self.conn.upgrade() {
            Some(c) => {
                c.borrow_mut().push_producer(p);
                true
            }
            None => false,
        }
    }

    fn begin_request(&mut self, line: &str) -> bool {
        // split on whitespace runs into up to three slots; a fourth token
        // glues onto the version slot, and leading whitespace shifts the
        // method out of slot zero, which fails the check below
        let mut slots: [String; 3] = Default::default();
        let mut idx = 0;
        let mut in_white = false;
        for c in line.chars() {
            if c.is_whitespace() {
                in_white = true;
                continue;
            }
            if in_white && idx < 2 {
                idx += 1;
            }
            slots[idx].push(c);
            in_white = false;
        }
        if idx == 0 || slots[0].is_empty() || slots[1].is_empty() {
            debug!("dropping connection: {}", Fault::BadRequestLine);
            return false;
        }

        self.reqline = slots;
        self.headers.clear();
        self.produced = false;
        self.consume = None;
        trace!("{} {}", self.method(), self.url());

        let sink: SinkRef = self.header_sink.clone();
        self.install_sink(sink)
    }

    fn body_mode(&self) -> BodyMode {
        if let Some(te) = self.headers.get("transfer-encoding") {
            if !te.trim().eq_ignore_ascii_case("identity") {
                return BodyMode::Chunked;
            }
        }
        if let Some(cl) = self.headers.get("content-length") {
            let n = cl.trim().parse::<i64>().unwrap_or(0).max(0) as usize;
            if n > 0 {
                return BodyMode::Sized(n);
            }
        }
        BodyMode::None
    }

    /// Runs once the blank line ends a header block: pick the body sink,
    /// hand the request to the router, and feed whatever it returned through
    /// the produce path. The next sink is installed before the router runs
    /// so a response (the WebSocket upgrade in particular) may hijack it.
    fn end_headers(&mut self) -> bool {
        let no_body = match self.body_mode() {
            BodyMode::Chunked => {
                self.chunked_sink.borrow_mut().reset();
                let sink: SinkRef = self.chunked_sink.clone();
                if !self.install_sink(sink) {
                    return false;
                }
                false
            }
            BodyMode::Sized(n) => {
                self.sized_sink.borrow_mut().remaining = n;
                let sink: SinkRef = self.sized_sink.clone();
                if !self.install_sink(sink) {
                    return false;
                }
                false
            }
            BodyMode::None => {
                if !self.install_next_request_sink() {
                    return false;
                }
                true
            }
        };

        let router = self.router.clone();
        let action = router(self).unwrap_or_else(|| {
            Response::text(404, format!("Error 404, {} not found", self.url())).into()
        });
        if !self.apply_action(action) {
            return false;
        }
        if no_body {
            return self.finish_tail();
        }
        true
    }

    fn apply_action(&mut self, action: Action) -> bool {
        match action {
            Action::Respond(r) => self.produce_response(r),
            Action::Consume(f) => {
                self.consume = Some(f);
                true
            }
        }
    }

    /// Emits a response unless one was already produced for this request;
    /// late responses are silent no-ops.
    pub(crate) fn produce_response(&mut self, r: Response) -> bool {
        if self.produced {
            return true;
        }
        self.produced = true;
        r.produce(self)
    }

    /// Re-arms the request-line sink for HTTP/1.1 peers; for anything else
    /// input is disarmed and the reactor closes once output drains.
    fn install_next_request_sink(&mut self) -> bool {
        let Some(c) = self.conn.upgrade() else {
            return false;
        };
        if self.reqline[2] == "HTTP/1.1" {
            let sink: SinkRef = self.reqline_sink.clone();
            c.borrow_mut().set_sink(sink);
        } else {
            c.borrow_mut().clear_sink();
        }
        true
    }

    /// End-of-body from a body sink: swap to the next-request sink first,
    /// then deliver the end marker and any deferred response.
    pub(crate) fn end_of_body(&mut self) -> bool {
        if !self.install_next_request_sink() {
            return false;
        }
        self.finish_tail()
    }

    fn finish_tail(&mut self) -> bool {
        if let Some(mut f) = self.consume.take() {
            if let Some(r) = f(None) {
                if !self.produce_response(r) {
                    return false;
                }
            }
        }
        self.finish_request();
        true
    }

    fn finish_request(&mut self) {
        for slot in &mut self.reqline {
            slot.clear();
        }
        self.headers.clear();
        self.consume = None;
        self.produced = false;
    }

    /// Chunked decoder hand-off once the zero-length chunk arrives.
    pub(crate) fn enter_trailer(&mut self) -> bool {
        let sink: SinkRef = self.trailer_sink.clone();
        self.install_sink(sink)
    }
}

/// Forwards `n` buffered bytes to the installed consume function as a view
/// buffer (or discards them when no consumer is installed) and produces any
/// response the consumer returned.
pub(crate) fn deliver_body(http: &Rc<RefCell<HttpConn>>, buf: &mut Buffer<'_>, n: usize) -> bool {
    let taken = http.borrow_mut().consume.take();
    let Some(mut f) = taken else {
        buf.consumed(n);
        return true;
    };
    let resp = {
        let mut view = Buffer::view(&buf.to_consume()[..n]);
        f(Some(&mut view))
    };
    buf.consumed(n);
    http.borrow_mut().consume = Some(f);
    match resp {
        Some(r) => http.borrow_mut().produce_response(r),
        None => true,
    }
}

// The pipeline sinks.

pub(crate) struct RequestLineSink {
    http: Weak<RefCell<HttpConn>>,
    line: LineParser,
}

impl Sink for RequestLineSink {
    fn drain(&mut self, buf: &mut Buffer<'_>) -> bool {
        let Some(http) = self.http.upgrade() else {
            return false;
        };
        match self.line.feed(buf) {
            Err(fault) => {
                debug!("dropping connection: {fault}");
                false
            }
            Ok(LineEvent::Partial) => true,
            Ok(LineEvent::Line(l)) => http.borrow_mut().begin_request(&l),
        }
    }
}

pub(crate) struct HeaderFieldSink {
    http: Weak<RefCell<HttpConn>>,
    parser: HeaderParser,
}

impl Sink for HeaderFieldSink {
    fn drain(&mut self, buf: &mut Buffer<'_>) -> bool {
        let Some(http) = self.http.upgrade() else {
            return false;
        };
        loop {
            match self.parser.feed(buf) {
                Err(fault) => {
                    debug!("dropping connection: {fault}");
                    return false;
                }
                Ok(HeaderEvent::Partial) => return true,
                Ok(HeaderEvent::Field(k, v)) => {
                    // duplicates overwrite
                    http.borrow_mut().headers.insert(k, v);
                }
                Ok(HeaderEvent::End) => return http.borrow_mut().end_headers(),
            }
        }
    }
}

/// Consumes exactly `content-length` bytes and forwards them to the consume
/// function, then delivers the end marker.
pub(crate) struct SizedBodySink {
    http: Weak<RefCell<HttpConn>>,
    pub(crate) remaining: usize,
}

impl Sink for SizedBodySink {
    fn drain(&mut self, buf: &mut Buffer<'_>) -> bool {
        let Some(http) = self.http.upgrade() else {
            return false;
        };
        let n = buf.usage().min(self.remaining);
        if n > 0 {
            if !deliver_body(&http, buf, n) {
                return false;
            }
            self.remaining -= n;
        }
        if self.remaining == 0 {
            return http.borrow_mut().end_of_body();
        }
        true
    }
}

/// Parses the trailing header block after a chunked body. The fields are
/// validated and dropped; the interesting part is reaching the terminator.
pub(crate) struct TrailerSink {
    http: Weak<RefCell<HttpConn>>,
    parser: HeaderParser,
}

impl Sink for TrailerSink {
    fn drain(&mut self, buf: &mut Buffer<'_>) -> bool {
        let Some(http) = self.http.upgrade() else {
            return false;
        };
        loop {
            match self.parser.feed(buf) {
                Err(fault) => {
                    debug!("dropping connection: {fault}");
                    return false;
                }
                Ok(HeaderEvent::Partial) => return true,
                Ok(HeaderEvent::Field(..)) => {}
                Ok(HeaderEvent::End) => return http.borrow_mut().end_of_body(),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::pipe::{test_support::buf, Conn};

    pub(crate) fn serve<R>(router: R) -> ConnRef
    where
        R: Fn(&mut HttpConn) -> Option<Action> + 'static,
    {
        let conn = Conn::new();
        make_server(router)(&conn);
        conn
    }

    /// Feeds bytes through the current-sink dispatch loop the way the
    /// reactor does, re-pointing mid-buffer as sinks swap themselves.
    pub(crate) fn pump(conn: &ConnRef, bytes: &[u8]) -> bool {
        let mut input = buf(bytes);
        while input.usage() > 0 {
            let sink = match conn.borrow().current_sink.clone() {
                Some(s) => s,
                None => return true,
            };
            if !sink.borrow_mut().drain(&mut input) {
                conn.borrow_mut().clear_sink();
                return false;
            }
        }
        true
    }
}
