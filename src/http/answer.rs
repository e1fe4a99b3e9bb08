//! Canned HTTP responses written directly by the gateway.
//!
//! These are best-effort: an error answer that cannot be delivered is
//! logged and dropped, the connection is torn down either way.

use std::io::Write;

use log::error;
use time::{format_description::FormatItem, macros::format_description, OffsetDateTime};

use crate::socket::write_all;

/// IMF-fixdate, e.g. `Tue, 26 Aug 2026 10:00:00 GMT`
const IMF_FIXDATE: &[FormatItem<'static>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

pub fn status_reason(code: u16) -> &'static str {
    match code {
        200 => "Connection Established",
        400 => "Bad Request",
        403 => "Forbidden",
        500 => "Internal Error",
        502 => "Proxy Failed Connection",
        503 => "Service Unavailable",
        _ => "Unknown Error",
    }
}

pub fn http_date() -> String {
    OffsetDateTime::now_utc()
        .format(IMF_FIXDATE)
        .unwrap_or_else(|_| String::new())
}

/// Serialize a full response with the standard header block.
pub fn build_response(code: u16, server_name: &str, content_type: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} {}\r\n\
         Server: {}/1.0\r\n\
         Date: {}\r\n\
         Content-Type: {}\r\n\
         Content-Length: {}\r\n\
         Via: 1.1 {} ({}/1.0)\r\n\
         Connection: close\r\n\r\n\
         {}",
        code,
        status_reason(code),
        server_name,
        http_date(),
        content_type,
        body.len(),
        server_name,
        server_name,
        body,
    )
    .into_bytes()
}

/// One best-effort plain-text error answer; write failures are ignored
/// because the connection is being torn down regardless.
pub fn write_error<W: Write>(dst: &mut W, code: u16, server_name: &str, body: &str) {
    let response = build_response(code, server_name, "text/plain;charset=us-ascii", body);
    if let Err(e) = write_all(dst, &response) {
        error!("could not deliver {} answer: {}", code, e);
    }
}

/// HTML answer used by the administrative interface.
pub fn write_html<W: Write>(dst: &mut W, code: u16, server_name: &str, body: &str) {
    let response = build_response(code, server_name, "text/html;charset=utf-8", body);
    if let Err(e) = write_all(dst, &response) {
        error!("could not deliver {} answer: {}", code, e);
    }
}
