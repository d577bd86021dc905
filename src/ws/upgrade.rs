//! RFC 6455 server-side handshake.
//!
//! Validation failure returns `None` so a router can fall through to its
//! next route (and ultimately the 404 synthesis). On success the returned
//! response carries the `101` status and swaps the connection's sink to the
//! frame codec at produce time.

use crate::{
    http::{connection::HttpConn, response::Response},
    pipe::SinkRef,
    ws::{
        frame::{FrameSink, MessageCollector},
        session::{Session, WsRef},
    },
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::trace;
use sha1::{Digest, Sha1};
use std::{cell::RefCell, rc::Rc};

const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Attempts the upgrade with the standard message-collecting handler. The
/// callback runs once per completed message; returning `false` drops the
/// connection.
pub fn upgrade(
    conn: &mut HttpConn,
    max_message: usize,
    on_message: impl FnMut(&WsRef, Vec<u8>) -> bool + 'static,
) -> Option<Response> {
    let session = Session::new(conn.weak());
    let collector = MessageCollector::new(session.clone(), max_message, on_message);
    let sink: SinkRef = Rc::new(RefCell::new(FrameSink::new(session, collector)));
    upgrade_with(conn, sink)
}

/// Attempts the upgrade with a caller-supplied frame sink; the seam for
/// applications that implement their own `FrameHandler`.
pub fn upgrade_with(conn: &mut HttpConn, sink: SinkRef) -> Option<Response> {
    let key = validate(conn)?;
    let token = accept_key(&key);
    trace!("websocket upgrade accepted");
    Some(
        Response::switching(101, sink)
            .header("upgrade", "websocket")
            .header("connection", "upgrade")
            .header("sec-websocket-accept", token),
    )
}

fn validate(conn: &HttpConn) -> Option<String> {
    let connection = conn.header("connection")?;
    let upgrade = conn.header("upgrade")?;
    let version = conn.header("sec-websocket-version")?;
    let key = conn.header("sec-websocket-key")?;

    if !connection
        .split(',')
        .any(|t| t.trim().eq_ignore_ascii_case("upgrade"))
    {
        return None;
    }
    if !upgrade.trim().eq_ignore_ascii_case("websocket") {
        return None;
    }
    if version.trim() != "13" {
        return None;
    }
    Some(key.to_string())
}

/// `base64(sha1(key || guid))` per RFC 6455 §4.2.2.
pub fn accept_key(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(WS_GUID);
    STANDARD.encode(sha.finalize())
}
