use std::borrow::Cow;
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Method, Version};
use rustls_pki_types::CertificateDer;
use uuid::Uuid;

use crate::body::BodyReader;

/// An incoming request, immutable once parsed.
///
/// The body is read through [`data`](Request::data); when the engine is
/// configured to merge chunked trailers, the headers gain the trailer
/// fields after the final body frame has been consumed.
pub struct Request {
    pub(crate) method: Method,
    pub(crate) raw_path: String,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) content_length: Option<u64>,
    pub(crate) trace_id: Uuid,
    pub(crate) remote_addr: SocketAddr,
    pub(crate) local_addr: SocketAddr,
    pub(crate) is_secure: bool,
    pub(crate) client_certificate: Option<CertificateDer<'static>>,
    pub(crate) body: BodyReader,
    pub(crate) merge_trailers: bool,
}

impl Request {
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request target exactly as it appeared on the request line.
    pub fn raw_path(&self) -> &str {
        &self.raw_path
    }

    /// The path portion of the target, without the query string.
    pub fn path(&self) -> &str {
        match self.raw_path.split_once('?') {
            Some((path, _)) => path,
            None => &self.raw_path,
        }
    }

    /// The raw query string, without the leading `?`.
    pub fn raw_query(&self) -> Option<&str> {
        self.raw_path.split_once('?').map(|(_, query)| query)
    }

    /// Decoded `key=value` pairs of the query string, in order.
    pub fn query_pairs(&self) -> impl Iterator<Item = (Cow<'_, str>, Cow<'_, str>)> {
        self.raw_query()
            .unwrap_or("")
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((key, value)) => (percent_decode(key), percent_decode(value)),
                None => (percent_decode(pair), Cow::Borrowed("")),
            })
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The parsed `Content-Length`, if the request declared one.
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// An identifier generated for this exchange, unique per request.
    pub fn trace_id(&self) -> Uuid {
        self.trace_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether the request arrived over TLS.
    pub fn is_secure(&self) -> bool {
        self.is_secure
    }

    /// The client certificate presented during the TLS handshake, if any.
    pub fn client_certificate(&self) -> Option<&CertificateDer<'static>> {
        self.client_certificate.as_ref()
    }

    /// Resolves with the next chunk of body data, or `None` at the end.
    pub async fn data(&mut self) -> Option<crate::Result<Bytes>> {
        let frame = self.body.data().await;
        if frame.is_none() && self.merge_trailers {
            if let Some(trailers) = self.body.take_trailers() {
                for (name, value) in trailers.iter() {
                    self.headers.append(name.clone(), value.clone());
                }
            }
        }
        frame
    }

    /// Trailer fields of a chunked body, available after the body has been
    /// fully read. Empty when trailer merging is enabled — merged fields
    /// live in [`headers`](Request::headers) instead.
    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.body.trailers()
    }

    /// Reads the remaining body into one contiguous buffer.
    pub async fn body_bytes(&mut self) -> crate::Result<Bytes> {
        let mut bufs = BytesMut::new();
        while let Some(chunk) = self.data().await {
            bufs.extend_from_slice(&chunk?);
        }
        Ok(bufs.freeze())
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("raw_path", &self.raw_path)
            .field("version", &self.version)
            .field("remote_addr", &self.remote_addr)
            .field("trace_id", &self.trace_id)
            .finish()
    }
}

/// Percent-decodes one query-string component; `+` decodes to a space.
fn percent_decode(raw: &str) -> Cow<'_, str> {
    if !raw.bytes().any(|b| b == b'%' || b == b'+') {
        return Cow::Borrowed(raw);
    }
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' => {
                match (
                    bytes.get(i + 1).copied().and_then(hex_val),
                    bytes.get(i + 2).copied().and_then(hex_val),
                ) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 2;
                    }
                    // pass malformed escapes through untouched
                    _ => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    match String::from_utf8(out) {
        Ok(s) => Cow::Owned(s),
        Err(_) => Cow::Borrowed(raw),
    }
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_decoding() {
        assert_eq!(percent_decode("plain"), "plain");
        assert_eq!(percent_decode("a+b"), "a b");
        assert_eq!(percent_decode("%C3%A9"), "é");
        assert_eq!(percent_decode("100%"), "100%");
    }
}
