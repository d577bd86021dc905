//! Configuration limits for the protocol stack and the reactor.
//!
//! Defaults are conservative: they bound per-connection memory to the two
//! I/O buffers plus the header accumulator and keep a slow reader from
//! parking unbounded output behind a fast sender.
//!
//! # Examples
//!
//! ```no_run
//! use spigot::{http, limits::HttpLimits, Reactor, Response};
//!
//! let mut reactor = Reactor::default();
//! reactor
//!     .listen(
//!         "127.0.0.1:8080",
//!         http::make_server_with(
//!             HttpLimits {
//!                 header_block_max: 32 * 1024,
//!                 ..HttpLimits::default()
//!             },
//!             |conn| Some(Response::text(200, format!("hi from {}", conn.url())).into()),
//!         ),
//!     )
//!     .unwrap();
//! reactor.run();
//! ```

use std::time::Duration;

/// Parser bounds for a single HTTP connection.
#[derive(Debug, Clone)]
pub struct HttpLimits {
    /// Maximum accepted request-line length in bytes (default: `4096`).
    ///
    /// Longer lines close the connection without a response.
    pub request_line_max: usize,

    /// Maximum accepted size of a header block in bytes (default: `128 KiB`).
    ///
    /// Counts keys, values and framing together; also bounds the trailing
    /// header block after a chunked body.
    pub header_block_max: usize,
}

impl Default for HttpLimits {
    fn default() -> Self {
        Self {
            request_line_max: 4096,
            header_block_max: 128 * 1024,
        }
    }
}

/// Per-tick work bounds and buffer sizes for the reactor.
///
/// The refill cap and the producer watermark together implement the flow
/// control contract: a connection never reads more than `max_fills_per_tick`
/// socket chunks per poll, and parsing pauses while more than
/// `producer_watermark` producers are queued so a slow peer cannot grow the
/// outbound queue without bound.
#[derive(Debug, Clone)]
pub struct ReactorLimits {
    /// Capacity of the per-connection input buffer (default: `4096`).
    pub input_buffer: usize,

    /// Capacity of the per-connection output buffer (default: `4096`).
    pub output_buffer: usize,

    /// Maximum socket reads folded into one poll per connection (default: `10`).
    pub max_fills_per_tick: usize,

    /// Parsing stops while more producers than this are queued (default: `1`).
    pub producer_watermark: usize,

    /// Sleep between polls in [`Reactor::run`](crate::Reactor::run)
    /// (default: `10 ms`).
    pub yield_time: Duration,
}

impl Default for ReactorLimits {
    fn default() -> Self {
        Self {
            input_buffer: 4096,
            output_buffer: 4096,
            max_fills_per_tick: 10,
            producer_watermark: 1,
            yield_time: Duration::from_millis(10),
        }
    }
}
