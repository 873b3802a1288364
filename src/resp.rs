//! RESP fragment recognizer.
//!
//! A pure, allocation-only-on-rewrite function that looks at a single
//! buffer read from a client and decides whether it is an `AUTH` or
//! `HELLO ... AUTH ...` handshake frame. No I/O happens here, which
//! keeps this the most heavily unit-tested module in the crate.
//!
//! Detection is deliberately conservative: anything that does not parse
//! as a well-formed RESP array of bulk strings consuming the whole
//! buffer falls through as [`RecognizeOutcome::Passthrough`]. A binary
//! payload that happens to contain the ASCII substring `AUTH` is never
//! mangled.

use crate::config::Config;

pub const INVALID_PASSWORD_REPLY: &[u8] = b"-ERR invalid password\r\n";

/// Result of running the recognizer over one client-read buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum RecognizeOutcome {
    /// Not an AUTH/HELLO frame (or unparsable) — forward `buf` unchanged.
    Passthrough,
    /// An AUTH/HELLO frame whose password matched; forward the rewritten bytes.
    Rewritten(Vec<u8>),
    /// An AUTH/HELLO frame whose password did not match the proxy password.
    AuthFailed,
}

/// One bulk-string element of a parsed RESP array, with its byte range
/// in the original buffer so a rewrite can splice just that element.
struct Element<'a> {
    payload: &'a [u8],
    header_start: usize,
    payload_end: usize,
}

/// Parse `buf` as `*<n>\r\n($<len>\r\n<payload>\r\n){n}` and require that
/// it consumes the entire buffer. Returns `None` on any structural
/// mismatch — truncation, a non-`$` length prefix, a length prefix that
/// disagrees with the payload, or trailing bytes after the array.
fn parse_resp_array(buf: &[u8]) -> Option<Vec<Element<'_>>> {
    let mut pos = 0usize;
    if buf.first()? != &b'*' {
        return None;
    }
    pos += 1;
    let (count, next) = parse_int_line(buf, pos)?;
    pos = next;
    if count < 0 {
        return None;
    }
    let count = count as usize;
    let mut elements = Vec::with_capacity(count);
    for _ in 0..count {
        if buf.get(pos)? != &b'$' {
            return None;
        }
        let header_start = pos;
        pos += 1;
        let (len, next) = parse_int_line(buf, pos)?;
        if len < 0 {
            return None;
        }
        let len = len as usize;
        pos = next;
        let payload_end = pos.checked_add(len)?;
        if buf.len() < payload_end + 2 {
            return None;
        }
        if &buf[payload_end..payload_end + 2] != b"\r\n" {
            return None;
        }
        elements.push(Element {
            payload: &buf[pos..payload_end],
            header_start,
            payload_end,
        });
        pos = payload_end + 2;
    }
    if pos != buf.len() {
        return None;
    }
    Some(elements)
}

/// Parse a `<digits>\r\n` integer line starting at `start`, returning the
/// value and the position right after the trailing `\r\n`.
fn parse_int_line(buf: &[u8], start: usize) -> Option<(i64, usize)> {
    let rest = buf.get(start..)?;
    let crlf = find_crlf(rest)?;
    let text = std::str::from_utf8(&rest[..crlf]).ok()?;
    let value: i64 = text.parse().ok()?;
    Some((value, start + crlf + 2))
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn eq_ci(a: &[u8], b: &str) -> bool {
    a.eq_ignore_ascii_case(b.as_bytes())
}

/// Build a literal `AUTH <username> <password>` frame against the
/// upstream credentials in `cfg`.
fn build_auth_frame(cfg: &Config) -> Vec<u8> {
    let user = &cfg.upstream_username;
    let pass = &cfg.upstream_password;
    let mut out = Vec::with_capacity(32 + user.len() + pass.len());
    out.extend_from_slice(b"*3\r\n$4\r\nAUTH\r\n");
    out.extend_from_slice(format!("${}\r\n", user.len()).as_bytes());
    out.extend_from_slice(user);
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(format!("${}\r\n", pass.len()).as_bytes());
    out.extend_from_slice(pass);
    out.extend_from_slice(b"\r\n");
    out
}

/// Splice the password element of a HELLO frame with the upstream
/// password, leaving every other byte of `buf` untouched.
fn splice_hello_password(buf: &[u8], password_elem: &Element<'_>, cfg: &Config) -> Vec<u8> {
    let mut out = Vec::with_capacity(buf.len() + cfg.upstream_password.len());
    out.extend_from_slice(&buf[..password_elem.header_start]);
    out.extend_from_slice(format!("${}\r\n", cfg.upstream_password.len()).as_bytes());
    out.extend_from_slice(&cfg.upstream_password);
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&buf[password_elem.payload_end + 2..]);
    out
}

/// Inspect one client-read buffer for an AUTH/HELLO handshake frame.
pub fn recognize(buf: &[u8], cfg: &Config) -> RecognizeOutcome {
    let elements = match parse_resp_array(buf) {
        Some(e) => e,
        None => return RecognizeOutcome::Passthrough,
    };

    match elements.len() {
        2 => recognize_auth_password(&elements, cfg),
        3 => recognize_auth_user_password(&elements, cfg),
        5 => recognize_hello(buf, &elements, cfg),
        _ => RecognizeOutcome::Passthrough,
    }
}

fn recognize_auth_password(elements: &[Element<'_>], cfg: &Config) -> RecognizeOutcome {
    if !eq_ci(elements[0].payload, "AUTH") {
        return RecognizeOutcome::Passthrough;
    }
    let provided = elements[1].payload;
    if provided != cfg.proxy_password.as_slice() {
        return RecognizeOutcome::AuthFailed;
    }
    RecognizeOutcome::Rewritten(build_auth_frame(cfg))
}

fn recognize_auth_user_password(elements: &[Element<'_>], cfg: &Config) -> RecognizeOutcome {
    if !eq_ci(elements[0].payload, "AUTH") {
        return RecognizeOutcome::Passthrough;
    }
    let provided = elements[2].payload;
    if provided != cfg.proxy_password.as_slice() {
        return RecognizeOutcome::AuthFailed;
    }
    RecognizeOutcome::Rewritten(build_auth_frame(cfg))
}

/// HELLO is parsed by locating the `AUTH` keyword and reading the two
/// elements that follow it, rather than assuming the password is
/// positionally last — see the HELLO open question in the design notes.
fn recognize_hello(buf: &[u8], elements: &[Element<'_>], cfg: &Config) -> RecognizeOutcome {
    if !eq_ci(elements[0].payload, "HELLO") {
        return RecognizeOutcome::Passthrough;
    }
    let auth_idx = match elements.iter().position(|e| eq_ci(e.payload, "AUTH")) {
        Some(i) if i + 2 < elements.len() => i,
        _ => return RecognizeOutcome::Passthrough,
    };
    let provided = elements[auth_idx + 2].payload;
    if provided != cfg.proxy_password.as_slice() {
        return RecognizeOutcome::AuthFailed;
    }
    RecognizeOutcome::Rewritten(splice_hello_password(buf, &elements[auth_idx + 2], cfg))
}
