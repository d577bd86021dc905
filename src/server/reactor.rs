//! Non-blocking TCP reactor.
//!
//! One thread, one loop: accept whatever is pending, then give every
//! connection a bounded slice of work. Reading pulls socket bytes into the
//! input buffer and feeds them to the connection's current sink; writing
//! refills the output buffer from the producer queue and pushes it to the
//! socket. `WouldBlock` just leaves the cursors where they are until the
//! next poll.
//!
//! Per-tick bounds stop one connection from starving the rest: at most
//! [`max_fills_per_tick`](crate::limits::ReactorLimits::max_fills_per_tick)
//! socket reads each poll, and parsing pauses while the producer queue sits
//! above the watermark so a slow reader cannot queue unbounded output.

use crate::{
    buffer::Buffer,
    limits::ReactorLimits,
    pipe::{Conn, ConnRef},
};
use log::{debug, trace};
use socket2::{Domain, Protocol, Socket, Type};
use std::{
    io::{self, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    thread,
};

pub struct Reactor {
    limits: ReactorLimits,
    listeners: Vec<Listener>,
    conns: Vec<NetConn>,
}

struct Listener {
    sock: TcpListener,
    spawn: Box<dyn Fn(&ConnRef)>,
}

struct NetConn {
    sock: TcpStream,
    peer: SocketAddr,
    ctl: ConnRef,
    input: Buffer<'static>,
    output: Buffer<'static>,
    want_input: bool,
}

impl Reactor {
    pub fn new(limits: ReactorLimits) -> Self {
        Self {
            limits,
            listeners: Vec::new(),
            conns: Vec::new(),
        }
    }

    /// Opens a non-blocking listener and registers the factory invoked with
    /// each accepted connection's control block. Returns the bound address,
    /// which matters when the port was `0`.
    pub fn listen(
        &mut self,
        addr: impl ToSocketAddrs,
        spawn: impl Fn(&ConnRef) + 'static,
    ) -> io::Result<SocketAddr> {
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no address to bind"))?;
        let sock = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        sock.set_reuse_address(true)?;
        sock.bind(&addr.into())?;
        sock.listen(128)?;
        sock.set_nonblocking(true)?;
        let sock: TcpListener = sock.into();
        let local = sock.local_addr()?;
        self.listeners.push(Listener {
            sock,
            spawn: Box::new(spawn),
        });
        Ok(local)
    }

    /// One tick: accept pending connections, then work every connection.
    /// Returns `false` once there is nothing left to drive.
    pub fn poll(&mut self) -> bool {
        if self.listeners.is_empty() && self.conns.is_empty() {
            return false;
        }

        for l in &self.listeners {
            loop {
                match l.sock.accept() {
                    Ok((sock, peer)) => {
                        if sock.set_nonblocking(true).is_err() {
                            continue;
                        }
                        let _ = sock.set_nodelay(true);
                        trace!("accepted {peer}");
                        let ctl = Conn::new();
                        (l.spawn)(&ctl);
                        self.conns.push(NetConn {
                            sock,
                            peer,
                            ctl,
                            input: Buffer::with_capacity(self.limits.input_buffer),
                            output: Buffer::with_capacity(self.limits.output_buffer),
                            want_input: true,
                        });
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        debug!("accept failed: {e}");
                        break;
                    }
                }
            }
        }

        let limits = self.limits.clone();
        self.conns.retain_mut(|c| {
            let keep = work_conn(c, &limits);
            if !keep {
                trace!("closing {}", c.peer);
            }
            keep
        });
        true
    }

    /// Polls forever with the configured yield sleep between ticks.
    pub fn run(self) {
        self.run_with(|| {});
    }

    /// Like [`run`](Self::run), invoking `tick` between polls; the hook for
    /// driving a [`Scheduler`](crate::Scheduler) from the same loop.
    pub fn run_with(mut self, mut tick: impl FnMut()) {
        while self.poll() {
            tick();
            thread::sleep(self.limits.yield_time);
        }
    }
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new(ReactorLimits::default())
    }
}

fn work_conn(c: &mut NetConn, limits: &ReactorLimits) -> bool {
    let mut fills = 0;
    while c.want_input && fills < limits.max_fills_per_tick {
        // parse before reading so a blocked read cannot strand buffered
        // bytes, but not while the outbound queue is over the watermark
        let queued = c.ctl.borrow().producers.len();
        if c.input.usage() > 0 && queued <= limits.producer_watermark {
            let Some(sink) = c.ctl.borrow().current_sink.clone() else {
                c.want_input = false;
                break;
            };
            let alive = sink.borrow_mut().drain(&mut c.input);
            c.want_input = alive && c.ctl.borrow().current_sink.is_some();
            continue;
        }
        if c.input.total_avail() > 0 {
            c.input.compact();
            match c.sock.read(c.input.to_produce()) {
                Ok(0) => return false,
                Ok(n) => {
                    c.input.produced(n);
                    fills += 1;
                    continue;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!("read error on {}: {e}", c.peer);
                    return false;
                }
            }
        }
        break;
    }

    // flush the output buffer, refilling it from the producer queue
    loop {
        if c.output.usage() == 0 && !refill_output(c) {
            break;
        }
        match c.sock.write(c.output.to_consume()) {
            Ok(0) => return false,
            Ok(n) => {
                c.output.consumed(n);
                if c.output.usage() > 0 {
                    break; // kernel buffer is full, come back next tick
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                debug!("write error on {}: {e}", c.peer);
                return false;
            }
        }
    }

    c.want_input || c.output.usage() > 0 || !c.ctl.borrow().producers.is_empty()
}

/// Pulls queued producers into the output buffer until it fills, the queue
/// empties, or the front producer stalls. Returns whether bytes landed.
fn refill_output(c: &mut NetConn) -> bool {
    let mut any = false;
    while c.output.total_avail() > 0 {
        let Some(mut p) = c.ctl.borrow_mut().producers.pop_front() else {
            break;
        };
        let before = c.output.total_avail();
        let keep = p(&mut c.output);
        let progressed = c.output.total_avail() != before;
        any |= progressed;
        if keep {
            c.ctl.borrow_mut().producers.push_front(p);
            if !progressed {
                break;
            }
        }
    }
    any
}
