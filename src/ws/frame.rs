//! RFC 6455 frame codec.
//!
//! Inbound frames walk a five-state machine (header byte, size byte, size
//! extension, mask, payload) and unmask as they go. Control frames are
//! handled inside the codec: pings are answered, pongs dropped, a close is
//! echoed and terminates the connection. Data frames are routed through the
//! [`FrameHandler`] seam; [`MessageCollector`] is the standard handler that
//! reassembles fragmented messages and hands each completed one to the
//! application.
//!
//! Outbound frames are never masked (this is the server side) and are queued
//! as one producer per frame.

use crate::{
    buffer::Buffer,
    errors::Fault,
    pipe::Sink,
    ws::session::WsRef,
};
use log::{debug, trace};
use std::mem;

pub const OP_CONTINUATION: u8 = 0;
pub const OP_TEXT: u8 = 1;
pub const OP_BINARY: u8 = 2;
pub const OP_CLOSE: u8 = 8;
pub const OP_PING: u8 = 9;
pub const OP_PONG: u8 = 10;

/// Extension seam for data frames. Control frames never reach a handler.
pub trait FrameHandler {
    /// A data frame's payload is about to stream in. Return `false` to drop
    /// the connection (e.g. the frame would overflow a message budget).
    fn packet_start(&mut self, fin: bool, opcode: u8, size: u64) -> bool;

    /// One unmasked payload byte.
    fn packet_data(&mut self, byte: u8);

    /// The frame's payload is complete. Return `false` to drop the
    /// connection.
    fn packet_end(&mut self, fin: bool, opcode: u8) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FrameState {
    FirstByte,
    SizeByte,
    SizeExtra,
    MaskBytes,
    Body,
}

/// Inbound frame decoder installed as the connection's current sink after a
/// successful upgrade. Holds the strong reference that keeps the session
/// alive.
pub struct FrameSink<H: FrameHandler> {
    session: WsRef,
    handler: H,
    state: FrameState,
    info: u8,
    count: u64,
    size: u64,
    want_mask: bool,
    mask: u32,
    in_control: bool,
    ctl: Vec<u8>,
}

impl<H: FrameHandler> FrameSink<H> {
    pub fn new(session: WsRef, handler: H) -> Self {
        Self {
            session,
            handler,
            state: FrameState::FirstByte,
            info: 0,
            count: 0,
            size: 0,
            want_mask: false,
            mask: 0,
            in_control: false,
            ctl: Vec::new(),
        }
    }

    /// The frame size is final; read the mask next or enter the payload.
    fn size_known(&mut self) -> bool {
        self.count = 0;
        if self.want_mask {
            self.state = FrameState::MaskBytes;
            return true;
        }
        self.begin_payload()
    }

    fn begin_payload(&mut self) -> bool {
        self.count = 0;
        let fin = self.info & 0x80 != 0;
        let opcode = self.info & 0x0f;

        if opcode > 7 {
            if !fin {
                debug!("dropping connection: {}", Fault::FragmentedControl);
                return false;
            }
            if !(OP_CLOSE..=OP_PONG).contains(&opcode) {
                debug!("dropping connection: {}", Fault::BadOpcode);
                return false;
            }
            if self.size > 125 {
                debug!("dropping connection: {}", Fault::ControlTooLarge);
                return false;
            }
            self.in_control = true;
            self.ctl.clear();
        } else {
            {
                let mut s = self.session.borrow_mut();
                match (s.input_type, opcode) {
                    (-1, OP_CONTINUATION) => {
                        debug!("dropping connection: {}", Fault::UnexpectedContinuation);
                        return false;
                    }
                    (-1, OP_TEXT | OP_BINARY) => s.input_type = opcode as i8,
                    (-1, _) => {
                        debug!("dropping connection: {}", Fault::BadOpcode);
                        return false;
                    }
                    (_, OP_CONTINUATION) => {}
                    _ => {
                        debug!("dropping connection: {}", Fault::ExpectedContinuation);
                        return false;
                    }
                }
            }
            self.in_control = false;
            if !self.handler.packet_start(fin, opcode, self.size) {
                return false;
            }
        }

        self.state = FrameState::Body;
        if self.size == 0 {
            let alive = self.end_payload();
            self.state = FrameState::FirstByte;
            return alive;
        }
        true
    }

    fn end_payload(&mut self) -> bool {
        let fin = self.info & 0x80 != 0;
        let opcode = self.info & 0x0f;
        if self.in_control {
            return self.dispatch_control(opcode);
        }
        if fin {
            self.session.borrow_mut().input_type = -1;
        }
        self.handler.packet_end(fin, opcode)
    }

    fn dispatch_control(&mut self, opcode: u8) -> bool {
        match opcode {
            OP_CLOSE => {
                trace!("close frame, echoing and terminating");
                let _ = self.session.borrow().send_raw(OP_CLOSE, &[]);
                let cb = self.session.borrow_mut().on_close.take();
                if let Some(f) = cb {
                    f();
                }
                false
            }
            OP_PING => self.session.borrow().send_raw(OP_PONG, &self.ctl),
            // unsolicited pongs are dropped
            _ => true,
        }
    }
}

impl<H: FrameHandler> Sink for FrameSink<H> {
    fn drain(&mut self, buf: &mut Buffer<'_>) -> bool {
        while buf.usage() > 0 {
            match self.state {
                FrameState::FirstByte => {
                    self.info = buf.consume();
                    if self.info & 0x70 != 0 {
                        debug!("dropping connection: {}", Fault::ReservedBits);
                        return false;
                    }
                    self.state = FrameState::SizeByte;
                    self.mask = 0;
                    self.count = 0;
                }
                FrameState::SizeByte => {
                    let tmp = buf.consume();
                    self.want_mask = tmp & 0x80 != 0;
                    let len7 = tmp & 0x7f;
                    if len7 < 126 {
                        self.size = len7 as u64;
                        if !self.size_known() {
                            return false;
                        }
                    } else {
                        // a 16-bit size shares the 64-bit accumulator by
                        // pretending six high bytes were already read
                        self.count = if len7 == 126 { 6 } else { 0 };
                        self.size = 0;
                        self.state = FrameState::SizeExtra;
                    }
                }
                FrameState::SizeExtra => {
                    self.size = (self.size << 8) | buf.consume() as u64;
                    self.count += 1;
                    if self.count == 8 && !self.size_known() {
                        return false;
                    }
                }
                FrameState::MaskBytes => {
                    self.mask = (self.mask << 8) | buf.consume() as u32;
                    self.count += 1;
                    if self.count == 4 && !self.begin_payload() {
                        return false;
                    }
                }
                FrameState::Body => {
                    let shift = 8 * (3 - (self.count & 3)) as u32;
                    let b = buf.consume() ^ (self.mask >> shift) as u8;
                    if self.in_control {
                        self.ctl.push(b);
                    } else {
                        self.handler.packet_data(b);
                    }
                    self.count += 1;
                    if self.count == self.size {
                        if !self.end_payload() {
                            return false;
                        }
                        self.state = FrameState::FirstByte;
                    }
                }
            }
        }
        true
    }
}

/// Encodes one final, unmasked frame.
pub fn encode_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 10);
    out.push(0x80 | (opcode & 0x0f));
    match payload.len() {
        n if n < 126 => out.push(n as u8),
        n if n < 65536 => {
            out.push(126);
            out.extend_from_slice(&(n as u16).to_be_bytes());
        }
        n => {
            out.push(127);
            out.extend_from_slice(&(n as u64).to_be_bytes());
        }
    }
    out.extend_from_slice(payload);
    out
}

/// Standard [`FrameHandler`]: reassembles fragments into whole messages,
/// validates text messages as UTF-8 and invokes the application callback
/// once per completed message.
pub struct MessageCollector {
    ws: WsRef,
    max: usize,
    kind: u8,
    data: Vec<u8>,
    on_message: Box<dyn FnMut(&WsRef, Vec<u8>) -> bool>,
}

impl MessageCollector {
    pub fn new(
        ws: WsRef,
        max: usize,
        on_message: impl FnMut(&WsRef, Vec<u8>) -> bool + 'static,
    ) -> Self {
        Self {
            ws,
            max,
            kind: 0,
            data: Vec::new(),
            on_message: Box::new(on_message),
        }
    }
}

impl FrameHandler for MessageCollector {
    fn packet_start(&mut self, _fin: bool, opcode: u8, size: u64) -> bool {
        if opcode != OP_CONTINUATION {
            self.kind = opcode;
            self.data.clear();
        }
        if size > self.max as u64 || self.data.len() as u64 + size > self.max as u64 {
            debug!("dropping connection: {}", Fault::MessageTooLarge);
            return false;
        }
        true
    }

    fn packet_data(&mut self, byte: u8) {
        self.data.push(byte);
    }

    fn packet_end(&mut self, fin: bool, _opcode: u8) -> bool {
        if !fin {
            return true;
        }
        let msg = mem::take(&mut self.data);
        if self.kind == OP_TEXT && simdutf8::basic::from_utf8(&msg).is_err() {
            debug!("dropping connection: {}", Fault::TextNotUtf8);
            return false;
        }
        let ws = self.ws.clone();
        (self.on_message)(&ws, msg)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::client_frame;
    use super::*;
    use crate::pipe::test_support::buf;
    use crate::ws::session::Session;
    use std::{cell::RefCell, rc::Rc, rc::Weak};

    #[derive(Debug, PartialEq, Clone)]
    enum Ev {
        Start(bool, u8, u64),
        Data(u8),
        End(bool, u8),
    }

    struct Recorder(Rc<RefCell<Vec<Ev>>>);

    impl FrameHandler for Recorder {
        fn packet_start(&mut self, fin: bool, opcode: u8, size: u64) -> bool {
            self.0.borrow_mut().push(Ev::Start(fin, opcode, size));
            true
        }
        fn packet_data(&mut self, byte: u8) {
            self.0.borrow_mut().push(Ev::Data(byte));
        }
        fn packet_end(&mut self, fin: bool, opcode: u8) -> bool {
            self.0.borrow_mut().push(Ev::End(fin, opcode));
            true
        }
    }

    fn recording_sink() -> (FrameSink<Recorder>, WsRef, Rc<RefCell<Vec<Ev>>>) {
        let events = Rc::new(RefCell::new(Vec::new()));
        let session = Session::new(Weak::new());
        let sink = FrameSink::new(session.clone(), Recorder(events.clone()));
        (sink, session, events)
    }

    fn data_bytes(events: &[Ev]) -> Vec<u8> {
        events
            .iter()
            .filter_map(|e| match e {
                Ev::Data(b) => Some(*b),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn masked_payload_is_unmasked() {
        let (mut sink, _session, events) = recording_sink();
        let mut input = buf(&client_frame(true, OP_TEXT, b"Hello", [0x12, 0x34, 0x56, 0x78]));
        assert!(sink.drain(&mut input));
        let ev = events.borrow();
        assert_eq!(ev[0], Ev::Start(true, OP_TEXT, 5));
        assert_eq!(data_bytes(&ev), b"Hello");
        assert_eq!(*ev.last().unwrap(), Ev::End(true, OP_TEXT));
    }

    #[test]
    fn fragmented_message_resets_input_type() {
        let (mut sink, session, events) = recording_sink();
        let mut wire = client_frame(false, OP_TEXT, b"Hel", [1, 2, 3, 4]);
        wire.extend_from_slice(&client_frame(true, OP_CONTINUATION, b"lo", [5, 6, 7, 8]));

        let mut input = buf(&wire);
        assert!(sink.drain(&mut input));
        assert_eq!(session.borrow().input_type, -1);

        let ev = events.borrow();
        assert_eq!(ev[0], Ev::Start(false, OP_TEXT, 3));
        assert_eq!(data_bytes(&ev), b"Hello");
        assert_eq!(*ev.last().unwrap(), Ev::End(true, OP_CONTINUATION));
    }

    #[test]
    fn mid_message_input_type_tracks_the_opener() {
        let (mut sink, session, _) = recording_sink();
        let mut input = buf(&client_frame(false, OP_BINARY, b"part", [0, 0, 0, 0]));
        assert!(sink.drain(&mut input));
        assert_eq!(session.borrow().input_type, 2);
    }

    #[test]
    fn protocol_violations_terminate() {
        #[rustfmt::skip]
        let frames: Vec<Vec<u8>> = vec![
            // reserved bit set
            vec![0xC1, 0x80, 0, 0, 0, 0],
            // continuation with nothing to continue
            client_frame(true, OP_CONTINUATION, b"x", [0, 0, 0, 0]),
            // unknown data opcode
            client_frame(true, 3, b"x", [0, 0, 0, 0]),
            // unknown control opcode
            client_frame(true, 11, b"", [0, 0, 0, 0]),
            // fragmented ping
            client_frame(false, OP_PING, b"", [0, 0, 0, 0]),
        ];

        for wire in frames {
            let (mut sink, _session, _) = recording_sink();
            let mut input = buf(&wire);
            assert!(!sink.drain(&mut input), "{wire:?}");
        }
    }

    #[test]
    fn new_data_frame_inside_a_fragmented_message_terminates() {
        let (mut sink, _session, _) = recording_sink();
        let mut wire = client_frame(false, OP_TEXT, b"He", [1, 1, 1, 1]);
        wire.extend_from_slice(&client_frame(true, OP_TEXT, b"llo", [1, 1, 1, 1]));
        let mut input = buf(&wire);
        assert!(!sink.drain(&mut input));
    }

    #[test]
    fn oversized_control_frame_terminates() {
        let (mut sink, _session, _) = recording_sink();
        let payload = vec![0u8; 126];
        let mut input = buf(&client_frame(true, OP_PING, &payload, [0, 0, 0, 0]));
        assert!(!sink.drain(&mut input));
    }

    #[test]
    fn control_frames_never_reach_the_handler() {
        // a pong carries payload bytes but no handler events may fire
        let (mut sink, _session, events) = recording_sink();
        let mut input = buf(&client_frame(true, OP_PONG, b"ab", [9, 9, 9, 9]));
        assert!(sink.drain(&mut input));
        assert!(events.borrow().is_empty());
    }

    #[test]
    fn encode_decode_round_trip() {
        // unmasked frames decode too: mask bit clear means no mask bytes
        let sizes = [0usize, 5, 125, 126, 4096, 65535, 65536];
        for &n in &sizes {
            let message: Vec<u8> = (0..n).map(|i| (i % 251) as u8).collect();
            let (mut sink, _session, events) = recording_sink();
            let mut input = buf(&encode_frame(OP_TEXT, &message));
            assert!(sink.drain(&mut input), "size {n}");
            let ev = events.borrow();
            assert_eq!(ev[0], Ev::Start(true, OP_TEXT, n as u64), "size {n}");
            assert_eq!(data_bytes(&ev), message, "size {n}");
            assert_eq!(*ev.last().unwrap(), Ev::End(true, OP_TEXT), "size {n}");
        }
    }

    #[test]
    fn collector_delivers_one_message_per_fin() {
        let session = Session::new(Weak::new());
        let messages = Rc::new(RefCell::new(Vec::new()));
        let m2 = messages.clone();
        let collector = MessageCollector::new(session.clone(), 1024, move |_, msg| {
            m2.borrow_mut().push(msg);
            true
        });
        let mut sink = FrameSink::new(session, collector);

        let mut wire = client_frame(false, OP_TEXT, b"Hel", [1, 2, 3, 4]);
        wire.extend_from_slice(&client_frame(true, OP_CONTINUATION, b"lo", [5, 6, 7, 8]));
        wire.extend_from_slice(&client_frame(true, OP_TEXT, b"again", [0, 0, 0, 0]));

        let mut input = buf(&wire);
        assert!(sink.drain(&mut input));
        assert_eq!(*messages.borrow(), vec![b"Hello".to_vec(), b"again".to_vec()]);
    }

    #[test]
    fn collector_rejects_oversized_messages() {
        let session = Session::new(Weak::new());
        let collector = MessageCollector::new(session.clone(), 4, |_, _| true);
        let mut sink = FrameSink::new(session, collector);
        let mut input = buf(&client_frame(true, OP_TEXT, b"too big", [0, 0, 0, 0]));
        assert!(!sink.drain(&mut input));
    }

    #[test]
    fn collector_rejects_invalid_utf8_text() {
        let session = Session::new(Weak::new());
        let collector = MessageCollector::new(session.clone(), 1024, |_, _| true);
        let mut sink = FrameSink::new(session, collector);
        let mut input = buf(&client_frame(true, OP_TEXT, &[0xff, 0xfe], [0, 0, 0, 0]));
        assert!(!sink.drain(&mut input));
    }

    #[test]
    fn empty_frames_complete_without_body_bytes() {
        let (mut sink, _session, events) = recording_sink();
        let mut input = buf(&client_frame(true, OP_TEXT, b"", [1, 2, 3, 4]));
        assert!(sink.drain(&mut input));
        let ev = events.borrow();
        assert_eq!(
            *ev,
            vec![Ev::Start(true, OP_TEXT, 0), Ev::End(true, OP_TEXT)]
        );
    }
}
