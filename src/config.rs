//! Compile-time configuration. There are no CLI flags and no environment
//! variables; changing any of these means recompiling.

/// TCP port the binary listens on.
pub const SERVER_PORT: u16 = 5000;

/// Absolute URL base used in redirect `Location` headers after a post.
pub const SERVER_URL: &str = "http://127.0.0.1:5000";

/// Connection slots available to clients. The kernel backlog absorbs
/// bursts beyond this.
pub const CONNECTION_SLOTS: usize = 100;

/// Per-slot request buffer. Headers must fit in full; the fast path also
/// keeps small bodies here.
pub const REQUEST_BUFFER_SIZE: usize = 8 * 1024;

/// Initial capacity of the per-slot response-head buffer. Head encoding is
/// unchecked against this, so keep it generous.
pub const RESPONSE_HEAD_BUFFER_SIZE: usize = 8 * 1024;

/// Upper bound on `Content-Length`.
pub const MAX_BODY_SIZE: usize = 5 * 1024 * 1024;

/// Ceiling for a rendered page buffer.
pub const MAX_RESPONSE_SIZE: usize = 8 * 1024 * 1024;

/// Accepted size range for an uploaded image file.
pub const UPLOAD_MIN_SIZE: usize = 100;
pub const UPLOAD_MAX_SIZE: usize = 3 * 1024 * 1024;

/// Sentinel filename treated as "no real upload" when deleting posts.
pub const PLACEHOLDER_IMAGE: &str = "placeholder.png";
