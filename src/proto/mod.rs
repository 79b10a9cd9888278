//! Wire-protocol internals.

pub(crate) mod h1;

use http::{HeaderMap, StatusCode};

/// How a request body is framed on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BodyLength {
    /// No framing headers; the body is zero bytes long.
    Empty,
    /// `Content-Length` was present.
    Known(u64),
    /// `Transfer-Encoding` ends in `chunked`.
    Chunked,
}

/// How a response body will be framed on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EncodeKind {
    /// Application declared a `Content-Length`; exact byte count enforced.
    Length(u64),
    /// Chunked transfer coding, terminated by the zero-size chunk.
    Chunked,
    /// No length information on an HTTP/1.0 exchange; the close is the
    /// delimiter.
    CloseDelimited,
    /// No body at all (`Content-Length: 0` implied).
    Empty,
}

/// The application's response head, snapshotted the moment the first body
/// byte (or the finish) is committed. Header mutations after this point
/// fail on the application side; the connection only ever sees one head.
#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub(crate) status: StatusCode,
    pub(crate) reason: Option<Box<str>>,
    pub(crate) headers: HeaderMap,
    pub(crate) keep_alive: bool,
    pub(crate) encode: EncodeKind,
}
