use std::io::Write;

use http::header::{CONNECTION, CONTENT_LENGTH, DATE, SERVER, TRANSFER_ENCODING};
use http::{StatusCode, Version};
use tracing::trace;

use super::date;
use crate::proto::{EncodeKind, ResponseHead};

const AVERAGE_HEADER_SIZE: usize = 30;

/// The response body is shorter than the promised `Content-Length`.
#[derive(Debug)]
pub(crate) struct NotEof(pub(crate) u64);

/// Encoder for one response message.
///
/// The head is serialized exactly once, then data frames follow in the
/// framing `EncodeKind` dictates. Responses that must not carry a body on
/// the wire (HEAD, 204, 304) keep their length bookkeeping but skip the
/// payload bytes.
#[derive(Debug)]
pub(crate) struct Encoder {
    kind: EncodeKind,
    suppress_body: bool,
}

impl Encoder {
    pub(crate) fn new(kind: EncodeKind, suppress_body: bool) -> Encoder {
        Encoder {
            kind,
            suppress_body,
        }
    }

    pub(crate) fn is_close_delimited(&self) -> bool {
        matches!(self.kind, EncodeKind::CloseDelimited)
    }

    /// Serializes the head: status line, application headers, then the
    /// framing/`Connection`/`Date`/`Server` headers the engine owns.
    pub(crate) fn encode_head(
        dst: &mut Vec<u8>,
        head: &ResponseHead,
        effective_keep_alive: bool,
        client_version: Version,
        server_header: Option<&str>,
    ) {
        trace!(status = %head.status, "Server::encode_head");
        let init_cap = 30 + head.headers.len() * AVERAGE_HEADER_SIZE;
        dst.reserve(init_cap);

        dst.extend_from_slice(b"HTTP/1.1 ");
        let mut status = itoa::Buffer::new();
        dst.extend_from_slice(status.format(head.status.as_u16()).as_bytes());
        dst.push(b' ');
        let reason = head
            .reason
            .as_deref()
            .or_else(|| head.status.canonical_reason())
            .unwrap_or("");
        dst.extend_from_slice(reason.as_bytes());
        dst.extend_from_slice(b"\r\n");

        for (name, value) in head.headers.iter() {
            dst.extend_from_slice(name.as_str().as_bytes());
            dst.extend_from_slice(b": ");
            dst.extend_from_slice(value.as_bytes());
            dst.extend_from_slice(b"\r\n");
        }

        match head.encode {
            EncodeKind::Length(len) => {
                if !head.headers.contains_key(CONTENT_LENGTH) {
                    dst.extend_from_slice(b"content-length: ");
                    let mut buf = itoa::Buffer::new();
                    dst.extend_from_slice(buf.format(len).as_bytes());
                    dst.extend_from_slice(b"\r\n");
                }
            }
            EncodeKind::Chunked => {
                if !head.headers.contains_key(TRANSFER_ENCODING) {
                    dst.extend_from_slice(b"transfer-encoding: chunked\r\n");
                }
            }
            EncodeKind::Empty => {
                if !head.headers.contains_key(CONTENT_LENGTH) && can_have_body(head.status) {
                    dst.extend_from_slice(b"content-length: 0\r\n");
                }
            }
            EncodeKind::CloseDelimited => {}
        }

        // The application owns Connection when it set one (the upgrade
        // path needs `Connection: Upgrade` verbatim).
        if !head.headers.contains_key(CONNECTION) {
            if !effective_keep_alive {
                dst.extend_from_slice(b"connection: close\r\n");
            } else if client_version == Version::HTTP_10 {
                dst.extend_from_slice(b"connection: keep-alive\r\n");
            }
        }

        if let Some(server) = server_header {
            if !head.headers.contains_key(SERVER) {
                dst.extend_from_slice(b"server: ");
                dst.extend_from_slice(server.as_bytes());
                dst.extend_from_slice(b"\r\n");
            }
        }

        if !head.headers.contains_key(DATE) {
            dst.reserve(date::DATE_VALUE_LENGTH + 8);
            dst.extend_from_slice(b"date: ");
            date::extend(dst);
            dst.extend_from_slice(b"\r\n");
        }

        dst.extend_from_slice(b"\r\n");
    }

    /// Frames one data write. The writer half already rejected overflow,
    /// so sized bookkeeping here saturates instead of erroring.
    pub(crate) fn encode_data(&mut self, dst: &mut Vec<u8>, data: &[u8]) {
        debug_assert!(!data.is_empty(), "encode_data() called with empty buf");
        match self.kind {
            EncodeKind::Chunked => {
                trace!("encoding chunked {}B", data.len());
                if !self.suppress_body {
                    let _ = write!(dst, "{:x}\r\n", data.len());
                    dst.extend_from_slice(data);
                    dst.extend_from_slice(b"\r\n");
                }
            }
            EncodeKind::Length(ref mut remaining) => {
                trace!("sized write, len = {}", data.len());
                let take = std::cmp::min(*remaining, data.len() as u64) as usize;
                *remaining -= take as u64;
                if !self.suppress_body {
                    dst.extend_from_slice(&data[..take]);
                }
            }
            EncodeKind::CloseDelimited => {
                trace!("close delimited write {}B", data.len());
                if !self.suppress_body {
                    dst.extend_from_slice(data);
                }
            }
            EncodeKind::Empty => {}
        }
    }

    /// Finishes the body: the zero-size chunk for chunked framing, an
    /// error when a sized body came up short.
    pub(crate) fn end(&mut self, dst: &mut Vec<u8>) -> Result<(), NotEof> {
        match self.kind {
            EncodeKind::Chunked => {
                if !self.suppress_body {
                    dst.extend_from_slice(b"0\r\n\r\n");
                }
                Ok(())
            }
            EncodeKind::Length(0) | EncodeKind::Empty | EncodeKind::CloseDelimited => Ok(()),
            EncodeKind::Length(remaining) => Err(NotEof(remaining)),
        }
    }
}

/// Whether a response status permits an entity body at all.
pub(crate) fn can_have_body(status: StatusCode) -> bool {
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderMap;

    fn head(encode: EncodeKind) -> ResponseHead {
        ResponseHead {
            status: StatusCode::OK,
            reason: None,
            headers: HeaderMap::new(),
            keep_alive: true,
            encode,
        }
    }

    fn rendered(head: &ResponseHead, keep_alive: bool) -> String {
        let mut dst = Vec::new();
        Encoder::encode_head(&mut dst, head, keep_alive, Version::HTTP_11, None);
        String::from_utf8(dst).unwrap()
    }

    #[test]
    fn test_encode_sized_head() {
        let text = rendered(&head(EncodeKind::Length(5)), true);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-length: 5\r\n"));
        assert!(!text.contains("connection:"));
        assert!(text.contains("date: "));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_encode_close_and_custom_reason() {
        let mut head = head(EncodeKind::Empty);
        head.status = StatusCode::IM_A_TEAPOT;
        head.reason = Some("Short And Stout".into());
        let text = rendered(&head, false);
        assert!(text.starts_with("HTTP/1.1 418 Short And Stout\r\n"));
        assert!(text.contains("connection: close\r\n"));
        assert!(text.contains("content-length: 0\r\n"));
    }

    #[test]
    fn test_encode_http10_keep_alive() {
        let mut dst = Vec::new();
        Encoder::encode_head(
            &mut dst,
            &head(EncodeKind::Empty),
            true,
            Version::HTTP_10,
            Some("cadente"),
        );
        let text = String::from_utf8(dst).unwrap();
        assert!(text.contains("connection: keep-alive\r\n"));
        assert!(text.contains("server: cadente\r\n"));
    }

    #[test]
    fn test_encode_chunked_frames() {
        let mut encoder = Encoder::new(EncodeKind::Chunked, false);
        let mut dst = Vec::new();
        encoder.encode_data(&mut dst, b"a");
        encoder.encode_data(&mut dst, b"bc");
        encoder.encode_data(&mut dst, b"def");
        encoder.end(&mut dst).unwrap();
        assert_eq!(dst, b"1\r\na\r\n2\r\nbc\r\n3\r\ndef\r\n0\r\n\r\n");
    }

    #[test]
    fn test_encode_sized_underflow_is_not_eof() {
        let mut encoder = Encoder::new(EncodeKind::Length(10), false);
        let mut dst = Vec::new();
        encoder.encode_data(&mut dst, b"12345");
        let err = encoder.end(&mut dst).unwrap_err();
        assert_eq!(err.0, 5);
    }

    #[test]
    fn test_encode_suppressed_body_keeps_length_header() {
        let text = rendered(&head(EncodeKind::Length(5)), true);
        assert!(text.contains("content-length: 5\r\n"));

        let mut encoder = Encoder::new(EncodeKind::Length(5), true);
        let mut dst = Vec::new();
        encoder.encode_data(&mut dst, b"hello");
        encoder.end(&mut dst).unwrap();
        assert!(dst.is_empty());
    }
}
