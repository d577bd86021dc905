//! spigot - single-threaded, non-blocking HTTP/1.1 and WebSocket server
//!
//! A small protocol stack built around two ideas: inbound bytes flow through
//! pluggable *sinks* that advance a per-connection state machine, and
//! outbound bytes are pulled from a FIFO of *producers*. Everything runs on
//! one cooperative thread; partial progress lives in sink state and buffer
//! cursors, never in a parked task.
//!
//! # Protocol Support
//!
//! - **HTTP/1.1**: persistent connections, sized and chunked request bodies,
//!   streaming responses with explicit `content-length`
//! - **HTTP/1.0**: single request, connection closes after the response drains
//! - **WebSocket**: RFC 6455 server side - upgrade handshake, fragmentation,
//!   ping/pong/close, unmasked outbound frames
//!
//! # Quick Start
//!
//! ```no_run
//! use spigot::{http, Reactor, Response};
//!
//! let mut reactor = Reactor::default();
//! reactor
//!     .listen(
//!         "127.0.0.1:8080",
//!         http::make_server(|conn| {
//!             if conn.url() == "/hello" {
//!                 return Some(Response::text(200, "Hello world!").into());
//!             }
//!             None // 404 synthesized for everything else
//!         }),
//!     )
//!     .expect("bind");
//! reactor.run();
//! ```
//!
//! # Routing
//!
//! The router runs once per request and returns an [`Action`]: a
//! [`Response`] to send, a consume function to stream the request body into
//! ([`Action::consume`]), or `None` to fall through to the built-in 404.
//! WebSocket endpoints call [`ws::upgrade`] and hand back its response; the
//! frame codec takes over the connection when it is produced.
//!
//! Faults never carry detail to the peer: malformed input of any kind just
//! closes the connection.

pub mod buffer;
pub(crate) mod errors;
pub mod limits;
pub mod pipe;
pub mod sched;

pub mod http {
    pub(crate) mod chunked;
    pub mod connection;
    pub mod files;
    pub mod response;

    pub use connection::{make_server, make_server_with, HttpConn};
    pub use files::match_file_response;
    pub use response::{Action, ConsumeFn, Response};
}

pub mod ws {
    pub mod frame;
    pub mod session;
    pub mod upgrade;

    pub use frame::{FrameHandler, FrameSink, MessageCollector};
    pub use session::{Session, WsRef};
    pub use upgrade::{upgrade, upgrade_with};
}

pub mod server {
    pub mod reactor;
}

pub use crate::{
    buffer::Buffer,
    http::{make_server, make_server_with, Action, HttpConn, Response},
    limits::{HttpLimits, ReactorLimits},
    pipe::{data_producer, Conn, ConnRef, Producer, Sink, SinkRef},
    sched::Scheduler,
    server::reactor::Reactor,
    ws::{Session, WsRef},
};
