//! WebSocket session state shared between the frame sink and the
//! application.
//!
//! The session only weakly references the HTTP connection underneath it, so
//! a handle parked in a scheduler callback can outlive the socket: a send
//! over a dead connection simply returns `false`.

use crate::{
    http::connection::HttpConn,
    pipe::data_producer,
    ws::frame::{encode_frame, OP_BINARY, OP_TEXT},
};
use std::{
    cell::RefCell,
    rc::{Rc, Weak},
};

/// Shared handle to a [`Session`]; the frame sink holds the strong reference
/// that keeps the session alive while the connection is up.
pub type WsRef = Rc<RefCell<Session>>;

pub struct Session {
    http: Weak<RefCell<HttpConn>>,
    /// Message reassembly marker: -1 idle, 1 text, 2 binary.
    pub(crate) input_type: i8,
    pub(crate) on_close: Option<Box<dyn FnOnce()>>,
}

impl Session {
    pub(crate) fn new(http: Weak<RefCell<HttpConn>>) -> WsRef {
        Rc::new(RefCell::new(Session {
            http,
            input_type: -1,
            on_close: None,
        }))
    }

    /// Whether the connection underneath is still alive.
    pub fn is_open(&self) -> bool {
        self.http.upgrade().is_some()
    }

    /// Registers a callback fired when the peer sends a close frame.
    pub fn on_close(&mut self, f: impl FnOnce() + 'static) {
        self.on_close = Some(Box::new(f));
    }

    /// Sends a text message. Returns `false` once the connection is gone.
    pub fn send_text(&self, msg: impl AsRef<[u8]>) -> bool {
        self.send_raw(OP_TEXT, msg.as_ref())
    }

    /// Sends a binary message. Returns `false` once the connection is gone.
    pub fn send_binary(&self, msg: impl AsRef<[u8]>) -> bool {
        self.send_raw(OP_BINARY, msg.as_ref())
    }

    /// Encodes one unmasked frame with the given opcode and queues it as a
    /// single producer on the connection.
    pub(crate) fn send_raw(&self, opcode: u8, payload: &[u8]) -> bool {
        let Some(http) = self.http.upgrade() else {
            return false;
        };
        let frame = encode_frame(opcode, payload);
        let queued = http.borrow_mut().push_producer(data_producer(frame));
        queued
    }
}
