use crate::resource_cache::ResourceCache;
use log::warn;
use std::io::{ErrorKind, Write};
use std::sync::Arc;

/// Bytes to send after the head, and who owns them. `Shared` bodies come
/// from the resource cache and cost nothing to hand out; `Owned` bodies
/// are freed by dropping when the slot closes.
pub enum ResponseBody {
    Empty,
    Owned(Vec<u8>),
    Shared(Arc<[u8]>),
}
impl ResponseBody {
    #[must_use]
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        match self {
            ResponseBody::Empty => &[],
            ResponseBody::Owned(bytes) => bytes,
            ResponseBody::Shared(bytes) => bytes,
        }
    }
}

/// One response, fully decided: status, headers-relevant fields, and the
/// body bytes. A HEAD answer carries the true content length with an
/// empty body.
pub struct Response {
    pub code: u16,
    pub content_type: Option<&'static str>,
    pub location: Option<String>,
    pub content_length: Option<usize>,
    pub body: ResponseBody,
}
impl Response {
    /// A 200 text/html page from a freshly rendered buffer.
    #[must_use]
    pub fn html(page: Vec<u8>, head_only: bool) -> Self {
        let len = page.len();
        Self {
            code: 200,
            content_type: Some("text/html"),
            location: None,
            content_length: Some(len),
            body: if head_only {
                ResponseBody::Empty
            } else {
                ResponseBody::Owned(page)
            },
        }
    }

    /// A 200 answer serving file bytes read from disk.
    #[must_use]
    pub fn file(bytes: Vec<u8>, mime: &'static str) -> Self {
        let len = bytes.len();
        Self {
            code: 200,
            content_type: Some(mime),
            location: None,
            content_length: Some(len),
            body: ResponseBody::Owned(bytes),
        }
    }

    /// The head-only twin of [`Response::file`]: correct length, no body.
    #[must_use]
    pub fn file_head(len: usize, mime: &'static str) -> Self {
        Self {
            code: 200,
            content_type: Some(mime),
            location: None,
            content_length: Some(len),
            body: ResponseBody::Empty,
        }
    }

    #[must_use]
    pub fn redirect_303(location: String) -> Self {
        Self {
            code: 303,
            content_type: None,
            location: Some(location),
            content_length: None,
            body: ResponseBody::Empty,
        }
    }

    #[must_use]
    pub fn error_400(cache: &mut ResourceCache) -> Self {
        Self::error_page(cache, 400, "html/400.html")
    }

    #[must_use]
    pub fn error_404(cache: &mut ResourceCache) -> Self {
        Self::error_page(cache, 404, "html/404.html")
    }

    #[must_use]
    pub fn error_500(cache: &mut ResourceCache) -> Self {
        Self::error_page(cache, 500, "html/500.html")
    }

    fn error_page(cache: &mut ResourceCache, code: u16, filename: &str) -> Self {
        let data = cache.get(filename);
        Self {
            code,
            content_type: Some("text/html"),
            location: None,
            content_length: Some(data.len()),
            body: ResponseBody::Shared(data),
        }
    }
}

#[must_use]
fn reason_phrase(code: u16) -> &'static str {
    match code {
        200 => "OK",
        303 => "SEE OTHER",
        400 => "BAD REQUEST",
        404 => "NOT FOUND",
        _ => "INTERNAL SERVER ERROR",
    }
}

/// Writes the wire head into `out`, which the caller has cleared:
/// HTTP/1.0 status line, `Server`, `Content-Type` (with
/// `; charset=utf-8` for html) and `Content-Length` when a body type is
/// set, `Connection: close`, `Location` for redirects, blank line.
pub fn encode_head(response: &Response, out: &mut Vec<u8>) {
    write!(
        out,
        "HTTP/1.0 {} {}\r\n",
        response.code,
        reason_phrase(response.code)
    )
    .unwrap();
    out.extend_from_slice(b"Server: UwU\r\n");
    if let Some(mime) = response.content_type {
        let charset = if mime == "text/html" {
            "; charset=utf-8"
        } else {
            ""
        };
        write!(out, "Content-Type: {mime}{charset}\r\n").unwrap();
        write!(
            out,
            "Content-Length: {}\r\n",
            response.content_length.unwrap_or(0)
        )
        .unwrap();
    }
    out.extend_from_slice(b"Connection: close\r\n");
    if let Some(location) = &response.location {
        write!(out, "Location: {location}\r\n").unwrap();
    }
    out.extend_from_slice(b"\r\n");
}

/// Outcome of one write pass over a slot's socket.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriteProgress {
    Continue,
    Done,
    Error,
}

/// The in-flight send state of one response: a position into the slot's
/// head buffer, the body, and a position into it.
pub struct Outgoing {
    pub head_pos: usize,
    pub body: ResponseBody,
    pub body_pos: usize,
}
impl Outgoing {
    #[must_use]
    pub fn new(body: ResponseBody) -> Self {
        Self {
            head_pos: 0,
            body,
            body_pos: 0,
        }
    }
}

/// Writes whatever the socket will take: the head first, then the body.
/// Returns `Done` once both are drained.
pub fn write_some(writer: &mut impl Write, head: &[u8], out: &mut Outgoing) -> WriteProgress {
    if out.head_pos < head.len() {
        match writer.write(&head[out.head_pos..]) {
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                return WriteProgress::Continue;
            }
            Err(e) => {
                warn!("write_some: failed write: {e}");
                return WriteProgress::Error;
            }
            Ok(0) => {
                warn!("write_some: socket accepted no bytes");
                return WriteProgress::Error;
            }
            Ok(n) => out.head_pos += n,
        }
        if out.head_pos < head.len() {
            return WriteProgress::Continue;
        }
    }
    let body = out.body.as_slice();
    if out.body_pos < body.len() {
        match writer.write(&body[out.body_pos..]) {
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                return WriteProgress::Continue;
            }
            Err(e) => {
                warn!("write_some: failed write: {e}");
                return WriteProgress::Error;
            }
            Ok(0) => {
                warn!("write_some: socket accepted no bytes");
                return WriteProgress::Error;
            }
            Ok(n) => out.body_pos += n,
        }
    }
    if out.body_pos == out.body.len() {
        WriteProgress::Done
    } else {
        WriteProgress::Continue
    }
}
