//! Static file responses.
//!
//! Bundled helper rather than core protocol: maps a URL prefix onto a
//! directory and streams matching regular files. Suspicious paths are
//! either rejected loudly (backslashes) or skipped quietly so the router
//! can fall through, which avoids leaking what exists on disk.

use crate::{buffer::Buffer, http::connection::HttpConn, http::response::Response};
use log::trace;
use std::{fs, io::Read};

/// Maps `url_prefix` onto `root` and returns a streaming response when the
/// request names a regular file beneath it.
///
/// `None` means "not mine": prefix mismatch, a dot or slash right after a
/// `/` (traversal and hidden-file hints), or a path that does not resolve
/// to a regular file. A backslash anywhere is a hard `500`.
pub fn match_file_response(conn: &HttpConn, url_prefix: &str, root: &str) -> Option<Response> {
    let url = conn.url();
    let checked = url.strip_prefix(url_prefix)?;

    let mut end = checked.len();
    let mut last = b'/';
    for (i, &c) in checked.as_bytes().iter().enumerate() {
        if c == b'\\' {
            return Some(Response::text(500, "Bad request, \\ not allowed in url"));
        }
        if c == b'?' {
            end = i;
            break;
        }
        if last == b'/' && (c == b'.' || c == b'/') {
            return None;
        }
        last = c;
    }

    let path = format!("{root}{}", &checked[..end]);
    let meta = fs::metadata(&path).ok()?;
    if !meta.is_file() {
        return None;
    }
    let mut file = fs::File::open(&path).ok()?;
    trace!("serving {path}");

    let prod = move |out: &mut Buffer<'_>| {
        if out.compact() == 0 {
            return true;
        }
        match file.read(out.to_produce()) {
            Ok(0) => false,
            Ok(n) => {
                out.produced(n);
                true
            }
            // stop sending on any error
            Err(_) => false,
        }
    };
    Some(
        Response::stream(200, Box::new(prod)).header("content-length", meta.len().to_string()),
    )
}
