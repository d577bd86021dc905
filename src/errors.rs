use std::{error, fmt};

/// Protocol faults detected while draining peer bytes.
///
/// None of these ever reach the peer: a fault is logged and the sink that hit
/// it returns `false`, which tears the connection down. The variants exist so
/// the log line says what actually went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fault {
    LineTooLong,

    HeadersTooLarge,
    BareLf,
    CrWithoutLf,

    BadRequestLine,

    BadChunkSize,
    BadChunkDelimiter,
    BadChunkExtension,

    ReservedBits,
    BadOpcode,
    ControlTooLarge,
    FragmentedControl,
    UnexpectedContinuation,
    ExpectedContinuation,
    TextNotUtf8,
    MessageTooLarge,

    ResponseWithoutLength,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Fault::LineTooLong => "line exceeds the configured maximum",

            Fault::HeadersTooLarge => "headers too large",
            Fault::BareLf => "lf without a preceding cr in header block",
            Fault::CrWithoutLf => "cr but no lf in header line",

            Fault::BadRequestLine => "request line lacks a method or target",

            Fault::BadChunkSize => "chunk size is not a valid hex number",
            Fault::BadChunkDelimiter => "chunk framing delimiter missing",
            Fault::BadChunkExtension => "malformed chunk extension",

            Fault::ReservedBits => "frame reserved bits set",
            Fault::BadOpcode => "unknown frame opcode",
            Fault::ControlTooLarge => "control frame payload over 125 bytes",
            Fault::FragmentedControl => "control frame without fin",
            Fault::UnexpectedContinuation => "continuation frame outside a message",
            Fault::ExpectedContinuation => "data frame interleaved into a fragmented message",
            Fault::TextNotUtf8 => "text message is not valid utf-8",
            Fault::MessageTooLarge => "message exceeds the configured maximum",

            Fault::ResponseWithoutLength => "streamed response carries no content-length",
        };
        f.write_str(msg)
    }
}

impl error::Error for Fault {}
