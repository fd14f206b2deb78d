use crate::config::{MAX_BODY_SIZE, REQUEST_BUFFER_SIZE};
use fixed_buffer::FixedBuf;
use log::warn;
use safe_regex::{Matcher2, Matcher3, regex};
use std::io::{ErrorKind, Read};

/// The per-slot request buffer. Headers must fit here in full.
pub type RequestBuf = FixedBuf<REQUEST_BUFFER_SIZE>;

const HEADERS_END: &[u8] = b"\r\n\r\n";
const MIN_HEAD_LEN: usize = "GET / HTTP\r\n\r\n".len();
const BOUNDARY_MIN_LEN: usize = 27;
const BOUNDARY_MAX_LEN: usize = 70;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Method {
    Get,
    Head,
    Post,
}

/// A parsed request head. The body, if any, is tracked by the connection
/// slot, not here.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Request {
    pub method: Method,
    pub path: String,
    /// Raw query string after the first `?`, when non-empty.
    pub params: Option<String>,
    /// Multipart boundary, already prefixed with `--` so it matches the
    /// in-body delimiter.
    pub boundary: Option<Vec<u8>>,
    pub content_length: Option<usize>,
}

/// Tracks progress through the `\r\n\r\n` head terminator across reads.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeadEndMatcher {
    matched: usize,
}
impl HeadEndMatcher {
    /// Feeds one byte; returns true when the full terminator has been seen.
    pub fn advance(&mut self, byte: u8) -> bool {
        if byte == HEADERS_END[self.matched] {
            self.matched += 1;
        } else {
            self.matched = 0;
        }
        self.matched == HEADERS_END.len()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReadHeadersResult {
    /// The read would block or more bytes are needed.
    Continue,
    /// The peer went away before sending anything; close silently.
    CloseConnection,
    /// Protocol violation; answer 400.
    Invalid,
    /// Head complete. The body starts at `headers_len`; `rem_len` bytes of
    /// it are already in the buffer.
    Done { headers_len: usize, rem_len: usize },
}

/// Performs one read into `buf` and scans the new bytes for the end of the
/// head. Bytes outside CR, LF, and printable ASCII are rejected; the scan
/// stops at the terminator, so body bytes arriving in the same read are
/// never inspected.
pub fn read_headers(
    reader: &mut impl Read,
    matcher: &mut HeadEndMatcher,
    buf: &mut RequestBuf,
) -> ReadHeadersResult {
    let old_len = buf.readable().len();
    let writable = buf.writable();
    if writable.is_empty() {
        warn!("read_headers: headers section too large");
        return ReadHeadersResult::Invalid;
    }
    let nread = match reader.read(writable) {
        Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
            return ReadHeadersResult::Continue;
        }
        Err(e) => {
            warn!("read_headers: read failed: {e}");
            return ReadHeadersResult::CloseConnection;
        }
        Ok(0) if old_len == 0 => return ReadHeadersResult::CloseConnection,
        Ok(0) => {
            warn!("read_headers: EOF before the end of headers");
            return ReadHeadersResult::Invalid;
        }
        Ok(n) => n,
    };
    buf.wrote(nread);
    for i in old_len..old_len + nread {
        let byte = buf.readable()[i];
        if byte != b'\r' && byte != b'\n' && !(b' '..=b'~').contains(&byte) {
            warn!("read_headers: illegal byte 0x{byte:02x} in headers");
            return ReadHeadersResult::Invalid;
        }
        if matcher.advance(byte) {
            let headers_len = i + 1;
            return ReadHeadersResult::Done {
                headers_len,
                rem_len: buf.readable().len() - headers_len,
            };
        }
    }
    if buf.writable().is_empty() {
        warn!("read_headers: headers section too large");
        return ReadHeadersResult::Invalid;
    }
    ReadHeadersResult::Continue
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RequestError {
    TooShort,
    EmptyRequestLine,
    MalformedRequestLine,
    UnsupportedMethod,
    MalformedHeaderLine,
    UnsupportedContentType,
    MissingBoundary,
    MalformedBoundary,
    MalformedContentLength,
    MissingContentType,
    MissingContentLength,
}

fn trim_trailing_cr(bytes: &[u8]) -> &[u8] {
    bytes.strip_suffix(b"\r").unwrap_or(bytes)
}

/// Parses a complete request head, `\r\n\r\n` terminator included.
///
/// Only `content-type` and `content-length` are acted on; a POST must carry
/// both. The slice is never written to; tokens are borrowed by index and
/// copied out.
///
/// # Errors
/// Returns an error on any malformed line, an unsupported method, a
/// non-multipart content type, a bad boundary, or a content length outside
/// `[1, MAX_BODY_SIZE]`.
pub fn parse_headers(head: &[u8]) -> Result<Request, RequestError> {
    if head.len() < MIN_HEAD_LEN {
        warn!("parse_headers: request too small");
        return Err(RequestError::TooShort);
    }
    if head.starts_with(b"\r\n") {
        warn!("parse_headers: first line of request is empty");
        return Err(RequestError::EmptyRequestLine);
    }
    let head = &head[..head.len() - HEADERS_END.len()];
    let mut lines = head.split(|b| *b == b'\n').map(trim_trailing_cr);

    let request_line = lines.next().ok_or(RequestError::MalformedRequestLine)?;
    let (method, path, params) = parse_request_line(request_line)?;

    let mut boundary = None;
    let mut content_length = None;
    for line in lines {
        let (name, value) = parse_header_line(line)?;
        if name == "content-type" {
            boundary = Some(parse_multipart_content_type(&value)?);
        } else if name == "content-length" {
            content_length = Some(parse_content_length(&value)?);
        }
    }

    if method == Method::Post && boundary.is_none() {
        warn!("parse_headers: POST request with no Content-Type field");
        return Err(RequestError::MissingContentType);
    }
    if method == Method::Post && content_length.is_none() {
        warn!("parse_headers: POST request with no Content-Length field");
        return Err(RequestError::MissingContentLength);
    }
    Ok(Request {
        method,
        path,
        params,
        boundary,
        content_length,
    })
}

fn parse_request_line(line: &[u8]) -> Result<(Method, String, Option<String>), RequestError> {
    // request-line = method SP request-target SP HTTP-version
    #[allow(clippy::assign_op_pattern)]
    #[allow(clippy::range_plus_one)]
    let matcher: Matcher3<_> = regex!(br"([-!#$%&'*+.^_`|~0-9A-Za-z]+) ([^ \t\r\n]+) ([^ \t\r\n]+)");
    let (method_bytes, route_bytes, _proto_bytes) = matcher
        .match_slices(line)
        .ok_or(RequestError::MalformedRequestLine)?;
    let method = if method_bytes == b"GET" {
        Method::Get
    } else if method_bytes == b"HEAD" {
        Method::Head
    } else if method_bytes == b"POST" {
        Method::Post
    } else {
        warn!("parse_headers: invalid request method");
        return Err(RequestError::UnsupportedMethod);
    };
    let route =
        std::str::from_utf8(route_bytes).map_err(|_| RequestError::MalformedRequestLine)?;
    let (path, params) = match route.split_once('?') {
        Some((path, params)) if !params.is_empty() => (path, Some(params.to_string())),
        Some((path, _)) => (path, None),
        None => (route, None),
    };
    Ok((method, path.to_string(), params))
}

fn parse_header_line(line: &[u8]) -> Result<(String, String), RequestError> {
    // header-field = field-name ":" OWS field-value OWS
    #[allow(clippy::assign_op_pattern)]
    #[allow(clippy::range_plus_one)]
    let matcher: Matcher2<_> = regex!(br"([-!#$%&'*+.^_`|~0-9A-Za-z]+): *(.*)");
    let (name_bytes, value_bytes) = matcher
        .match_slices(line)
        .ok_or(RequestError::MalformedHeaderLine)?;
    let name = std::str::from_utf8(name_bytes)
        .map_err(|_| RequestError::MalformedHeaderLine)?
        .to_ascii_lowercase();
    let value = std::str::from_utf8(value_bytes)
        .map_err(|_| RequestError::MalformedHeaderLine)?
        .trim_end_matches(' ')
        .to_string();
    Ok((name, value))
}

/// Accepts only `multipart/form-data` with a well-formed `boundary`
/// parameter and returns the boundary prefixed with `--`.
fn parse_multipart_content_type(value: &str) -> Result<Vec<u8>, RequestError> {
    let (mime, rest) = match value.split_once(';') {
        Some((mime, rest)) => (mime, Some(rest)),
        None => (value, None),
    };
    if mime != "multipart/form-data" {
        warn!("parse_headers: invalid Content-Type: {value}");
        return Err(RequestError::UnsupportedContentType);
    }
    let boundary = rest
        .and_then(|rest| rest.trim_start_matches(' ').split_once('='))
        .and_then(|(key, val)| (key == "boundary").then_some(val))
        .ok_or_else(|| {
            warn!("parse_headers: missing boundary");
            RequestError::MissingBoundary
        })?;
    if boundary.len() < BOUNDARY_MIN_LEN || boundary.len() > BOUNDARY_MAX_LEN {
        warn!("parse_headers: bad boundary length {}", boundary.len());
        return Err(RequestError::MalformedBoundary);
    }
    let legal =
        |b: u8| b.is_ascii_alphanumeric() || b == b'\'' || b == b'-' || b == b'_';
    if !boundary.bytes().all(legal) {
        warn!("parse_headers: illegal character in boundary");
        return Err(RequestError::MalformedBoundary);
    }
    let mut prefixed = Vec::with_capacity(2 + boundary.len());
    prefixed.extend_from_slice(b"--");
    prefixed.extend_from_slice(boundary.as_bytes());
    Ok(prefixed)
}

fn parse_content_length(value: &str) -> Result<usize, RequestError> {
    let length: i64 = value.parse().map_err(|_| {
        warn!("parse_headers: failed to parse Content-Length value");
        RequestError::MalformedContentLength
    })?;
    if length < 1 || length > MAX_BODY_SIZE as i64 {
        warn!("parse_headers: invalid Content-Length value {length}");
        return Err(RequestError::MalformedContentLength);
    }
    Ok(length as usize)
}
