use crate::App;
use crate::config::{CONNECTION_SLOTS, RESPONSE_HEAD_BUFFER_SIZE};
use crate::request::{
    HeadEndMatcher, Method, ReadHeadersResult, Request, RequestBuf, parse_headers, read_headers,
};
use crate::response::{Outgoing, Response, WriteProgress, encode_head, write_some};
use crate::router::{do_routing, validate_post_request};
use log::{debug, error, warn};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use permit::Permit;
use std::io::{ErrorKind, Read};
use std::net::{TcpListener, TcpStream};
use std::os::fd::AsFd;

/// How often the poll loop wakes to check for shutdown.
const POLL_TICK_MS: u16 = 100;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ConnState {
    Closed,
    ReceivingHeaders,
    ReceivingBody,
    SendingResponse,
}

/// Where the request body lives. A body that arrived in full alongside the
/// head stays in the request buffer; otherwise a heap buffer sized to the
/// content length is prefilled with the residual bytes and read into.
enum BodyBuf {
    None,
    Inline { len: usize },
    Owned { buf: Vec<u8>, pos: usize },
}

/// One connection slot. The request buffer and the response-head buffer
/// are allocated once and recycled across connections.
struct Conn {
    stream: Option<TcpStream>,
    state: ConnState,
    head_end: HeadEndMatcher,
    buf: RequestBuf,
    headers_len: usize,
    req: Option<Request>,
    body: BodyBuf,
    resp_head: Vec<u8>,
    outgoing: Option<Outgoing>,
}
impl Conn {
    fn new() -> Self {
        Self {
            stream: None,
            state: ConnState::Closed,
            head_end: HeadEndMatcher::default(),
            buf: RequestBuf::new(),
            headers_len: 0,
            req: None,
            body: BodyBuf::None,
            resp_head: Vec::with_capacity(RESPONSE_HEAD_BUFFER_SIZE),
            outgoing: None,
        }
    }

    fn open(&mut self, stream: TcpStream) {
        self.stream = Some(stream);
        self.state = ConnState::ReceivingHeaders;
    }

    /// Drops the socket and clears the request state. The two scratch
    /// buffers keep their allocations for the next connection.
    fn close(&mut self) {
        self.stream = None;
        self.state = ConnState::Closed;
        self.head_end = HeadEndMatcher::default();
        self.buf.clear();
        self.headers_len = 0;
        self.req = None;
        self.body = BodyBuf::None;
        self.resp_head.clear();
        self.outgoing = None;
    }
}

/// Runs the server until `permit` is revoked. Single-threaded: every
/// connection, the forum, and the resource cache live on this thread.
///
/// # Errors
/// Returns an error when the listener cannot be made non-blocking or
/// `poll` fails.
pub fn run_server(listener: TcpListener, app: App, permit: Permit) -> Result<(), std::io::Error> {
    run_server_with_slots(listener, app, CONNECTION_SLOTS, permit)
}

/// [`run_server`] with an explicit slot count, so tests can exercise
/// admission control with a small pool.
///
/// # Errors
/// Returns an error when the listener cannot be made non-blocking or
/// `poll` fails.
pub fn run_server_with_slots(
    listener: TcpListener,
    mut app: App,
    nslots: usize,
    permit: Permit,
) -> Result<(), std::io::Error> {
    listener.set_nonblocking(true)?;
    let mut slots: Vec<Conn> = (0..nslots).map(|_| Conn::new()).collect();
    while !permit.is_revoked() {
        // The poll set is rebuilt each iteration from live slots. The
        // listener joins only while a slot is free; a full house leaves
        // new connections in the kernel backlog.
        let mut pollfds = Vec::with_capacity(nslots + 1);
        let mut owners = Vec::with_capacity(nslots + 1);
        if slots.iter().any(|slot| slot.stream.is_none()) {
            pollfds.push(PollFd::new(listener.as_fd(), PollFlags::POLLIN));
            owners.push(None);
        }
        for (i, slot) in slots.iter().enumerate() {
            if let Some(stream) = &slot.stream {
                let events = if slot.state == ConnState::SendingResponse {
                    PollFlags::POLLOUT
                } else {
                    PollFlags::POLLIN
                };
                pollfds.push(PollFd::new(stream.as_fd(), events));
                owners.push(Some(i));
            }
        }
        match poll(&mut pollfds, PollTimeout::from(POLL_TICK_MS)) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(std::io::Error::from_raw_os_error(e as i32)),
        }
        let ready: Vec<(Option<usize>, PollFlags)> = pollfds
            .iter()
            .zip(&owners)
            .filter_map(|(pollfd, owner)| {
                pollfd
                    .revents()
                    .filter(|revents| !revents.is_empty())
                    .map(|revents| (*owner, revents))
            })
            .collect();
        drop(pollfds);
        for (owner, revents) in ready {
            match owner {
                None => accept_connection(&listener, &mut slots),
                Some(i) => step_slot(&mut slots[i], revents, &mut app),
            }
        }
    }
    Ok(())
}

fn accept_connection(listener: &TcpListener, slots: &mut [Conn]) {
    let stream = match listener.accept() {
        Ok((stream, addr)) => {
            debug!("accepted connection from {addr}");
            stream
        }
        Err(e) if e.kind() == ErrorKind::WouldBlock => return,
        Err(e) => {
            warn!("accept failed: {e}");
            return;
        }
    };
    if let Err(e) = stream.set_nonblocking(true) {
        warn!("failed to set accepted socket non-blocking: {e}");
        return;
    }
    match slots.iter_mut().find(|slot| slot.stream.is_none()) {
        Some(slot) => slot.open(stream),
        None => warn!("ran out of connection slots"),
    }
}

/// Advances one slot by at most one state step. A step that produces a
/// response flushes immediately in the same iteration.
fn step_slot(conn: &mut Conn, revents: PollFlags, app: &mut App) {
    if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL) {
        debug!("closing connection on poll event {revents:?}");
        conn.close();
        return;
    }
    match conn.state {
        ConnState::Closed => {}
        ConnState::ReceivingHeaders => receive_headers(conn, app),
        ConnState::ReceivingBody => receive_body(conn, app),
        ConnState::SendingResponse => flush(conn),
    }
}

fn receive_headers(conn: &mut Conn, app: &mut App) {
    let Some(stream) = &mut conn.stream else {
        return;
    };
    let (headers_len, rem_len) = match read_headers(stream, &mut conn.head_end, &mut conn.buf) {
        ReadHeadersResult::Continue => return,
        ReadHeadersResult::CloseConnection => {
            conn.close();
            return;
        }
        ReadHeadersResult::Invalid => {
            respond(conn, Response::error_400(&mut app.cache));
            return;
        }
        ReadHeadersResult::Done {
            headers_len,
            rem_len,
        } => (headers_len, rem_len),
    };
    conn.headers_len = headers_len;
    let req = match parse_headers(&conn.buf.readable()[..headers_len]) {
        Ok(req) => req,
        Err(e) => {
            warn!("failed to parse request head: {e:?}");
            respond(conn, Response::error_400(&mut app.cache));
            return;
        }
    };
    if req.method == Method::Post {
        if !validate_post_request(&req) {
            respond(conn, Response::error_400(&mut app.cache));
            return;
        }
        let content_length = req.content_length.unwrap_or(0);
        conn.req = Some(req);
        if rem_len >= content_length {
            conn.body = BodyBuf::Inline {
                len: content_length,
            };
            route_and_respond(conn, app);
        } else {
            let mut buf = Vec::with_capacity(content_length);
            buf.extend_from_slice(&conn.buf.readable()[headers_len..]);
            buf.resize(content_length, 0);
            conn.body = BodyBuf::Owned { buf, pos: rem_len };
            conn.state = ConnState::ReceivingBody;
        }
    } else {
        conn.req = Some(req);
        conn.body = BodyBuf::None;
        route_and_respond(conn, app);
    }
}

fn receive_body(conn: &mut Conn, app: &mut App) {
    let Some(stream) = &mut conn.stream else {
        return;
    };
    let BodyBuf::Owned { buf, pos } = &mut conn.body else {
        error!("receiving a body without a body buffer");
        conn.close();
        return;
    };
    let nread = match stream.read(&mut buf[*pos..]) {
        Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
            return;
        }
        Err(e) => {
            warn!("failed to read request body: {e}");
            conn.close();
            return;
        }
        Ok(0) => {
            warn!("received fewer body bytes than expected");
            conn.close();
            return;
        }
        Ok(n) => n,
    };
    *pos += nread;
    let done = *pos == buf.len();
    if done {
        route_and_respond(conn, app);
    }
}

fn route_and_respond(conn: &mut Conn, app: &mut App) {
    let response = {
        let Some(req) = conn.req.as_ref() else {
            error!("routing without a parsed request");
            respond(conn, Response::error_500(&mut app.cache));
            return;
        };
        let body: &[u8] = match &conn.body {
            BodyBuf::None => &[],
            BodyBuf::Inline { len } => {
                &conn.buf.readable()[conn.headers_len..conn.headers_len + len]
            }
            BodyBuf::Owned { buf, .. } => buf,
        };
        do_routing(app, req, body)
    };
    respond(conn, response);
}

/// Encodes the head into the slot's scratch buffer, arms the writer, and
/// attempts the first flush right away.
fn respond(conn: &mut Conn, response: Response) {
    conn.resp_head.clear();
    encode_head(&response, &mut conn.resp_head);
    conn.outgoing = Some(Outgoing::new(response.body));
    conn.state = ConnState::SendingResponse;
    flush(conn);
}

fn flush(conn: &mut Conn) {
    let (Some(stream), Some(outgoing)) = (&mut conn.stream, &mut conn.outgoing) else {
        error!("sending state without a stream or a response");
        conn.close();
        return;
    };
    match write_some(stream, &conn.resp_head, outgoing) {
        WriteProgress::Continue => {}
        WriteProgress::Done | WriteProgress::Error => conn.close(),
    }
}
