use bytes::{Bytes, BytesMut};
use http::header::{self, HeaderName, HeaderValue};
use http::{HeaderMap, Method, Version};
use tracing::{debug, trace};

use crate::error::Parse;
use crate::proto::BodyLength;

const MAX_HEADERS: usize = 100;

#[derive(Clone, Copy, Debug)]
pub(crate) struct ParseConfig {
    pub(crate) accept_bare_lf: bool,
    pub(crate) max_request_line_bytes: usize,
    pub(crate) max_headers_bytes: usize,
}

/// A fully parsed request head plus the framing facts the connection needs.
#[derive(Debug)]
pub(crate) struct RequestHead {
    pub(crate) method: Method,
    pub(crate) raw_path: String,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) body_len: BodyLength,
    pub(crate) expect_continue: bool,
    pub(crate) keep_alive: bool,
}

/// Tries to parse one request head out of `buf`.
///
/// Returns `Ok(None)` when the head is still incomplete; the parsed bytes
/// are consumed from `buf` only on success, leaving body (and pipelined)
/// bytes in place.
pub(crate) fn parse_request(
    buf: &mut BytesMut,
    config: &ParseConfig,
) -> crate::Result<Option<RequestHead>> {
    if buf.is_empty() {
        return Ok(None);
    }

    let mut headers_indices = [HeaderIndices {
        name: (0, 0),
        value: (0, 0),
    }; MAX_HEADERS];

    let (len, method, path, version, headers_len) = {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        trace!(bytes = buf.len(), "Request.parse");
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(buf)? {
            httparse::Status::Complete(len) => {
                trace!("Request.parse Complete({})", len);
                let method = req
                    .method
                    .unwrap()
                    .parse::<Method>()
                    .map_err(|_| crate::Error::new_parse(Parse::Method))?;
                let path = req.path.unwrap();
                let bytes_ptr = buf.as_ref().as_ptr() as usize;
                let path_start = path.as_ptr() as usize - bytes_ptr;
                let path_end = path_start + path.len();
                let version = match req.version.unwrap() {
                    0 => Version::HTTP_10,
                    1 => Version::HTTP_11,
                    _ => return Err(crate::Error::new_parse(Parse::Version)),
                };

                record_header_indices(buf.as_ref(), &req.headers, &mut headers_indices);
                (len, method, (path_start, path_end), version, req.headers.len())
            }
            httparse::Status::Partial => {
                let line_len = buf
                    .iter()
                    .position(|&b| b == b'\n')
                    .map(|pos| pos + 1)
                    .unwrap_or(buf.len());
                return if line_len > config.max_request_line_bytes {
                    Err(crate::Error::new_parse(Parse::UriTooLong))
                } else if buf.len() > config.max_headers_bytes {
                    Err(crate::Error::new_parse(Parse::HeaderTooLarge))
                } else {
                    Ok(None)
                };
            }
        }
    };

    if len > config.max_headers_bytes {
        return Err(crate::Error::new_parse(Parse::HeaderTooLarge));
    }

    let slice = buf.split_to(len).freeze();

    let line_len = slice
        .iter()
        .position(|&b| b == b'\n')
        .map(|pos| pos + 1)
        .unwrap_or(slice.len());
    if line_len > config.max_request_line_bytes {
        return Err(crate::Error::new_parse(Parse::UriTooLong));
    }

    if !config.accept_bare_lf && has_bare_lf(&slice) {
        debug!("request head contains bare LF line endings");
        return Err(crate::Error::new_parse(Parse::Header));
    }

    // path was validated as a URI token sequence by httparse
    let raw_path =
        std::str::from_utf8(&slice[path.0..path.1])
            .map_err(|_| crate::Error::new_parse(Parse::Uri))?
            .to_owned();

    let mut headers = HeaderMap::with_capacity(headers_len);
    for indices in &headers_indices[..headers_len] {
        let name = HeaderName::from_bytes(&slice[indices.name.0..indices.name.1])
            .map_err(|_| crate::Error::new_parse(Parse::Header))?;
        let value = HeaderValue::from_maybe_shared(slice.slice(indices.value.0..indices.value.1))
            .map_err(|_| crate::Error::new_parse(Parse::Header))?;
        headers.append(name, value);
    }

    let body_len = body_length(&headers, version)?;

    if version == Version::HTTP_11 && !headers.contains_key(header::HOST) {
        debug!("HTTP/1.1 request without Host header");
        return Err(crate::Error::new_parse(Parse::MissingHost));
    }

    let mut expect_continue = false;
    if let Some(expect) = headers.get(header::EXPECT) {
        if !expect.as_bytes().eq_ignore_ascii_case(b"100-continue") {
            return Err(crate::Error::new_parse(Parse::Expect));
        }
        expect_continue = version == Version::HTTP_11;
    }

    let keep_alive = if version == Version::HTTP_11 {
        !connection_has(&headers, "close")
    } else {
        connection_has(&headers, "keep-alive")
    };

    Ok(Some(RequestHead {
        method,
        raw_path,
        version,
        headers,
        body_len,
        expect_continue,
        keep_alive,
    }))
}

/// Message-body framing per RFC 7230 §3.3.3, restricted to requests:
/// chunked when `Transfer-Encoding` ends in `chunked`, sized on a valid
/// `Content-Length`, empty otherwise. Both headers together, a non-chunked
/// final coding, or any `Transfer-Encoding` on HTTP/1.0 are protocol errors.
fn body_length(headers: &HeaderMap, version: Version) -> crate::Result<BodyLength> {
    let has_te = headers.contains_key(header::TRANSFER_ENCODING);
    let content_length = content_length_value(headers)?;

    if has_te {
        if version == Version::HTTP_10 {
            debug!("HTTP/1.0 request with Transfer-Encoding header");
            return Err(crate::Error::new_parse(Parse::TransferEncoding));
        }
        if content_length.is_some() {
            debug!("request with both Transfer-Encoding and Content-Length");
            return Err(crate::Error::new_parse(Parse::TransferEncoding));
        }
        let last = headers
            .get_all(header::TRANSFER_ENCODING)
            .iter()
            .last()
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.rsplit(',').next())
            .map(str::trim);
        return if last.is_some_and(|coding| coding.eq_ignore_ascii_case("chunked")) {
            Ok(BodyLength::Chunked)
        } else {
            debug!("request transfer-encoding does not end in chunked");
            Err(crate::Error::new_parse(Parse::TransferEncoding))
        };
    }

    match content_length {
        Some(len) => Ok(BodyLength::Known(len)),
        None => Ok(BodyLength::Empty),
    }
}

/// Folds repeated (and comma-listed) `Content-Length` values, requiring
/// them all to agree.
fn content_length_value(headers: &HeaderMap) -> crate::Result<Option<u64>> {
    let mut length = None;
    for value in headers.get_all(header::CONTENT_LENGTH) {
        let value = value
            .to_str()
            .map_err(|_| crate::Error::new_parse(Parse::ContentLength))?;
        for part in value.split(',') {
            let parsed = part
                .trim()
                .parse::<u64>()
                .map_err(|_| crate::Error::new_parse(Parse::ContentLength))?;
            if length.get_or_insert(parsed) != &parsed {
                debug!("request with differing Content-Length values");
                return Err(crate::Error::new_parse(Parse::ContentLength));
            }
        }
    }
    Ok(length)
}

pub(crate) fn connection_has(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

fn has_bare_lf(head: &Bytes) -> bool {
    head.iter()
        .enumerate()
        .any(|(i, &b)| b == b'\n' && (i == 0 || head[i - 1] != b'\r'))
}

#[derive(Clone, Copy)]
struct HeaderIndices {
    name: (usize, usize),
    value: (usize, usize),
}

fn record_header_indices(
    bytes: &[u8],
    headers: &[httparse::Header<'_>],
    indices: &mut [HeaderIndices],
) {
    let bytes_ptr = bytes.as_ptr() as usize;
    for (header, indices) in headers.iter().zip(indices.iter_mut()) {
        let name_start = header.name.as_ptr() as usize - bytes_ptr;
        let name_end = name_start + header.name.len();
        indices.name = (name_start, name_end);
        let value_start = header.value.as_ptr() as usize - bytes_ptr;
        let value_end = value_start + header.value.len();
        indices.value = (value_start, value_end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ParseConfig {
        ParseConfig {
            accept_bare_lf: false,
            max_request_line_bytes: 8 * 1024,
            max_headers_bytes: 64 * 1024,
        }
    }

    fn parse(raw: &[u8]) -> crate::Result<Option<RequestHead>> {
        parse_request(&mut BytesMut::from(raw), &config())
    }

    #[test]
    fn test_parse_request() {
        let mut raw = BytesMut::from(&b"GET /echo HTTP/1.1\r\nHost: cadente.rs\r\n\r\nrest"[..]);
        let head = parse_request(&mut raw, &config()).unwrap().unwrap();
        assert_eq!(raw.as_ref(), b"rest");
        assert_eq!(head.method, Method::GET);
        assert_eq!(head.raw_path, "/echo");
        assert_eq!(head.version, Version::HTTP_11);
        assert_eq!(head.headers.len(), 1);
        assert_eq!(head.headers["host"], "cadente.rs");
        assert_eq!(head.body_len, BodyLength::Empty);
        assert!(head.keep_alive);
        assert!(!head.expect_continue);
    }

    #[test]
    fn test_parse_partial() {
        let mut raw = BytesMut::from(&b"GET /echo HTTP/1.1\r\nHost: cade"[..]);
        assert!(parse_request(&mut raw, &config()).unwrap().is_none());
        assert_eq!(raw.len(), 30);
    }

    #[test]
    fn test_parse_preserves_duplicate_headers_in_order() {
        let head = parse(
            b"GET / HTTP/1.1\r\nHost: a\r\nVia: one\r\nVia: two\r\n\r\n",
        )
        .unwrap()
        .unwrap();
        let via: Vec<_> = head.headers.get_all("via").iter().collect();
        assert_eq!(via, vec!["one", "two"]);
    }

    #[test]
    fn test_parse_errors() {
        // malformed request line
        parse(b"GET  HTTP/1.1\r\nHost: a\r\n\r\n").unwrap_err();
        // obs-fold continuation line
        parse(b"GET / HTTP/1.1\r\nHost: a\r\n folded\r\n\r\n").unwrap_err();
        // missing Host on 1.1
        let err = parse(b"GET / HTTP/1.1\r\n\r\n").unwrap_err();
        assert_eq!(err.reject_status(), Some(http::StatusCode::BAD_REQUEST));
    }

    #[test]
    fn test_bare_lf_rejected_unless_configured() {
        let raw = b"GET / HTTP/1.1\nHost: a\n\n";
        parse(raw).unwrap_err();

        let lenient = ParseConfig {
            accept_bare_lf: true,
            ..config()
        };
        let head = parse_request(&mut BytesMut::from(&raw[..]), &lenient)
            .unwrap()
            .unwrap();
        assert_eq!(head.headers["host"], "a");
    }

    #[test]
    fn test_body_length_rules() {
        let head = parse(b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 10\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(head.body_len, BodyLength::Known(10));

        let head = parse(b"POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(head.body_len, BodyLength::Chunked);

        let head = parse(
            b"POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: gzip, chunked\r\n\r\n",
        )
        .unwrap()
        .unwrap();
        assert_eq!(head.body_len, BodyLength::Chunked);

        // chunked not the final coding
        parse(b"POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked, gzip\r\n\r\n")
            .unwrap_err();

        // both framing headers
        let err = parse(
            b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 3\r\nTransfer-Encoding: chunked\r\n\r\n",
        )
        .unwrap_err();
        assert_eq!(err.reject_status(), Some(http::StatusCode::BAD_REQUEST));

        // transfer-encoding on 1.0
        parse(b"POST / HTTP/1.0\r\nTransfer-Encoding: chunked\r\n\r\n").unwrap_err();

        // repeated but agreeing lengths collapse
        let head = parse(
            b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\nContent-Length: 5\r\n\r\n",
        )
        .unwrap()
        .unwrap();
        assert_eq!(head.body_len, BodyLength::Known(5));

        parse(b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\nContent-Length: 6\r\n\r\n")
            .unwrap_err();
    }

    #[test]
    fn test_keep_alive_defaults() {
        let head = parse(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n").unwrap().unwrap();
        assert!(head.keep_alive);

        let head = parse(b"GET / HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(!head.keep_alive);

        let head = parse(b"GET / HTTP/1.0\r\n\r\n").unwrap().unwrap();
        assert!(!head.keep_alive);

        let head = parse(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(head.keep_alive);
    }

    #[test]
    fn test_expectations() {
        let head = parse(b"POST / HTTP/1.1\r\nHost: a\r\nExpect: 100-continue\r\nContent-Length: 1\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(head.expect_continue);

        let err = parse(b"POST / HTTP/1.1\r\nHost: a\r\nExpect: 42-dwim\r\n\r\n").unwrap_err();
        assert_eq!(
            err.reject_status(),
            Some(http::StatusCode::EXPECTATION_FAILED)
        );
    }

    #[test]
    fn test_request_line_limit() {
        let mut long = Vec::from(&b"GET /"[..]);
        long.extend(std::iter::repeat(b'a').take(9000));
        long.extend_from_slice(b" HTTP/1.1\r\nHost: a\r\n\r\n");
        let err = parse(&long).unwrap_err();
        assert_eq!(err.reject_status(), Some(http::StatusCode::URI_TOO_LONG));
    }

    #[test]
    fn test_headers_limit() {
        let mut raw = Vec::from(&b"GET / HTTP/1.1\r\nHost: a\r\n"[..]);
        for i in 0..40 {
            raw.extend_from_slice(format!("x-filler-{}: {}\r\n", i, "y".repeat(2000)).as_bytes());
        }
        raw.extend_from_slice(b"\r\n");
        let tight = ParseConfig {
            max_headers_bytes: 16 * 1024,
            ..config()
        };
        let err = parse_request(&mut BytesMut::from(&raw[..]), &tight).unwrap_err();
        assert_eq!(
            err.reject_status(),
            Some(http::StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE)
        );
    }
}
