//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

use http::StatusCode;

/// Result type often returned from methods that can have cadente `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur handling HTTP connections.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    Parse(Parse),
    User(User),
    /// A message reached EOF, but is not complete.
    IncompleteMessage,
    /// A pending item was dropped before ever being processed.
    Canceled,
    /// Indicates the peer went away while an exchange was in flight.
    Aborted,
    /// Indicates a channel (body sender or context queue) is closed.
    ChannelClosed,
    /// An `io::Error` that occurred while trying to read or write to a
    /// network stream.
    Io,
    /// Error binding or resolving a listening endpoint.
    Listen,
    /// The WebSocket handshake could not be completed.
    Upgrade(Upgrade),
}

#[derive(Debug)]
pub(crate) enum Parse {
    Method,
    Version,
    Uri,
    UriTooLong,
    Header,
    HeaderTooLarge,
    /// `Transfer-Encoding` and `Content-Length` conflict, or either is
    /// malformed.
    TransferEncoding,
    ContentLength,
    /// An HTTP/1.1 request without a `Host` header.
    MissingHost,
    /// An `Expect` header naming something other than `100-continue`.
    Expect,
}

#[derive(Debug)]
pub(crate) enum User {
    /// The application mutated response headers after the head was written.
    HeadersAlreadySent,
    /// The application wrote more body bytes than its `Content-Length`.
    BodyOverflow,
    /// The application finished the response short of its `Content-Length`.
    BodyUnderflow,
    /// The application wrote to a response that was already finished.
    ResponseCompleted,
    /// The application set a `Content-Length` header that is not a valid
    /// non-negative integer.
    InvalidContentLength,
}

#[derive(Debug)]
pub(crate) enum Upgrade {
    /// The request is not a well-formed RFC 6455 handshake.
    Handshake,
    /// The requested sub-protocol was not offered by the client.
    Protocol,
}

impl Error {
    /// Returns true if this was an HTTP parse error.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if this error was caused by user code.
    pub fn is_user(&self) -> bool {
        matches!(self.inner.kind, Kind::User(_))
    }

    /// Returns true if this was about an operation that was canceled,
    /// such as `get_context` racing an engine stop.
    pub fn is_canceled(&self) -> bool {
        matches!(self.inner.kind, Kind::Canceled)
    }

    /// Returns true if the peer disconnected mid-exchange.
    pub fn is_aborted(&self) -> bool {
        matches!(self.inner.kind, Kind::Aborted)
    }

    /// Returns true if a body or queue channel is closed.
    pub fn is_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::ChannelClosed)
    }

    /// Returns true if the connection closed before a message could complete.
    pub fn is_incomplete_message(&self) -> bool {
        matches!(self.inner.kind, Kind::IncompleteMessage)
    }

    /// Returns true if a WebSocket upgrade was refused.
    pub fn is_upgrade(&self) -> bool {
        matches!(self.inner.kind, Kind::Upgrade(_))
    }

    /// Consumes the error, returning its cause.
    pub fn into_cause(self) -> Option<Box<dyn StdError + Send + Sync>> {
        self.inner.cause
    }

    /// The status an automatic error response should carry, when the error
    /// is one the engine answers on the wire before closing.
    pub(crate) fn reject_status(&self) -> Option<StatusCode> {
        match self.inner.kind {
            Kind::Parse(Parse::UriTooLong) => Some(StatusCode::URI_TOO_LONG),
            Kind::Parse(Parse::HeaderTooLarge) => {
                Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE)
            }
            Kind::Parse(Parse::Expect) => Some(StatusCode::EXPECTATION_FAILED),
            Kind::Parse(_) => Some(StatusCode::BAD_REQUEST),
            _ => None,
        }
    }

    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn new_canceled() -> Error {
        Error::new(Kind::Canceled)
    }

    pub(crate) fn new_aborted() -> Error {
        Error::new(Kind::Aborted)
    }

    pub(crate) fn new_incomplete() -> Error {
        Error::new(Kind::IncompleteMessage)
    }

    pub(crate) fn new_closed() -> Error {
        Error::new(Kind::ChannelClosed)
    }

    pub(crate) fn new_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_listen<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Listen).with(cause)
    }

    pub(crate) fn new_parse(parse: Parse) -> Error {
        Error::new(Kind::Parse(parse))
    }

    pub(crate) fn new_user(user: User) -> Error {
        Error::new(Kind::User(user))
    }

    pub(crate) fn new_upgrade(upgrade: Upgrade) -> Error {
        Error::new(Kind::Upgrade(upgrade))
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Parse(Parse::Method) => "invalid HTTP method parsed",
            Kind::Parse(Parse::Version) => "invalid HTTP version parsed",
            Kind::Parse(Parse::Uri) => "invalid URI",
            Kind::Parse(Parse::UriTooLong) => "request line too long",
            Kind::Parse(Parse::Header) => "invalid HTTP header parsed",
            Kind::Parse(Parse::HeaderTooLarge) => "message head is too large",
            Kind::Parse(Parse::TransferEncoding) => "invalid transfer-encoding",
            Kind::Parse(Parse::ContentLength) => "invalid content-length",
            Kind::Parse(Parse::MissingHost) => "request is missing a host header",
            Kind::Parse(Parse::Expect) => "unsupported expectation",
            Kind::User(User::HeadersAlreadySent) => {
                "response head already written to the wire"
            }
            Kind::User(User::BodyOverflow) => "body written past the declared content-length",
            Kind::User(User::BodyUnderflow) => {
                "response finished short of the declared content-length"
            }
            Kind::User(User::ResponseCompleted) => "response was already completed",
            Kind::User(User::InvalidContentLength) => "invalid user-provided content-length",
            Kind::IncompleteMessage => "connection closed before message completed",
            Kind::Canceled => "operation was canceled",
            Kind::Aborted => "connection aborted",
            Kind::ChannelClosed => "channel closed",
            Kind::Io => "connection error",
            Kind::Listen => "error binding listening endpoint",
            Kind::Upgrade(Upgrade::Handshake) => "malformed websocket handshake",
            Kind::Upgrade(Upgrade::Protocol) => "websocket sub-protocol mismatch",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("cadente::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl From<httparse::Error> for Error {
    fn from(err: httparse::Error) -> Error {
        match err {
            httparse::Error::Version => Error::new_parse(Parse::Version),
            httparse::Error::Token => Error::new_parse(Parse::Method),
            _ => Error::new_parse(Parse::Header),
        }
    }
}
