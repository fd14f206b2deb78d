//! uwuboard
//! ========
//! A self-contained HTTP/1.0 server for a small imageboard-style forum.
//!
//! # Features
//! - `forbid(unsafe_code)`
//! - Single-threaded cooperative I/O: a `poll(2)` loop over a fixed pool of
//!   connection slots, each driven by a per-connection state machine
//!   (receive-headers, receive-body, send-response)
//! - Incremental HTTP head parsing with bounded buffers
//! - multipart/form-data bodies with schema-driven field binding
//! - Upload validation by magic-number signature, with don't-care masks
//! - In-memory threads and posts with bump-limit and hide/delete semantics
//! - A tiny line-oriented template language with includes and named callouts
//!
//! # Limitations
//! - HTTP/1.0 only; every connection closes after one response
//! - No TLS, no chunked transfer, no range requests, no authentication
//! - Forum state is process-local and ephemeral by design
//! - No request timeouts; a slow client holds its slot until it sends
//!   data or errors
#![forbid(unsafe_code)]
pub mod config;
pub mod forum;
pub mod multipart;
pub mod request;
pub mod resource_cache;
pub mod response;
pub mod router;
pub mod server;
pub mod template;
pub mod util;

mod rand;

pub use crate::forum::Forum;
pub use crate::request::Request;
pub use crate::resource_cache::ResourceCache;
pub use crate::response::Response;
pub use crate::server::{run_server, run_server_with_slots};

/// Everything a request handler can touch: the forum model and the cache of
/// static page resources. Owned by the poll loop and threaded through the
/// route handlers; never shared across threads.
pub struct App {
    pub forum: Forum,
    pub cache: ResourceCache,
}
