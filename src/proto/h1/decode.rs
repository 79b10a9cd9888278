use std::fmt;
use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use tracing::trace;

use self::Kind::{Chunked, Empty, Length};

/// Maximum amount of bytes allowed in chunked extensions.
///
/// This limit is applied for the entire body, not per chunk.
const CHUNKED_EXTENSIONS_LIMIT: u64 = 1024 * 16;

/// Maximum number of trailer fields allowed after a chunked body.
const TRAILER_FIELD_LIMIT: usize = 100;

/// One step of decoded request body.
#[derive(Debug, PartialEq)]
pub(crate) enum Decoded {
    Data(Bytes),
    /// The body is complete; chunked bodies may carry trailer fields.
    Complete(Option<HeaderMap>),
}

/// Decoders to handle different request body framings.
///
/// The decoder never touches the transport: it consumes bytes out of the
/// connection's read buffer and reports `None` when it needs another fill.
/// Any bytes past the framed body are left in the buffer untouched.
pub(crate) struct Decoder {
    kind: Kind,
}

enum Kind {
    /// Used when a Content-Length header is present.
    Length(u64),
    /// Used when Transfer-Encoding ends in `chunked`.
    Chunked {
        state: ChunkedState,
        chunk_len: u64,
        extensions_cnt: u64,
        trailers_buf: Option<BytesMut>,
        trailers_cnt: usize,
        trailer_size_limit: usize,
    },
    /// Used for requests that carry no body at all.
    Empty,
}

#[derive(Debug, PartialEq, Clone, Copy)]
enum ChunkedState {
    Start,
    Size,
    SizeLws,
    Extension,
    SizeLf,
    Body,
    BodyCr,
    BodyLf,
    Trailer,
    TrailerLf,
    EndCr,
    EndLf,
    End,
}

enum Step {
    Next(ChunkedState),
    Data(ChunkedState, Bytes),
    NeedMore,
}

impl Decoder {
    pub(crate) fn length(len: u64) -> Decoder {
        Decoder {
            kind: Kind::Length(len),
        }
    }

    pub(crate) fn chunked(trailer_size_limit: usize) -> Decoder {
        Decoder {
            kind: Kind::Chunked {
                state: ChunkedState::Start,
                chunk_len: 0,
                extensions_cnt: 0,
                trailers_buf: None,
                trailers_cnt: 0,
                trailer_size_limit,
            },
        }
    }

    pub(crate) fn empty() -> Decoder {
        Decoder { kind: Kind::Empty }
    }

    pub(crate) fn is_eof(&self) -> bool {
        matches!(
            self.kind,
            Length(0)
                | Chunked {
                    state: ChunkedState::End,
                    ..
                }
                | Empty
        )
    }

    /// Advances the decoder over buffered bytes.
    ///
    /// Returns `Ok(None)` when the buffer ran dry mid-frame; the caller
    /// refills the buffer and retries.
    pub(crate) fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Decoded>> {
        match self.kind {
            Length(ref mut remaining) => {
                if *remaining == 0 {
                    return Ok(Some(Decoded::Complete(None)));
                }
                if buf.is_empty() {
                    return Ok(None);
                }
                let take = std::cmp::min(*remaining, buf.len() as u64) as usize;
                *remaining -= take as u64;
                Ok(Some(Decoded::Data(buf.split_to(take).freeze())))
            }
            Chunked {
                ref mut state,
                ref mut chunk_len,
                ref mut extensions_cnt,
                ref mut trailers_buf,
                ref mut trailers_cnt,
                trailer_size_limit,
            } => {
                loop {
                    if *state == ChunkedState::End {
                        trace!("end of chunked");
                        let trailers = match trailers_buf.take() {
                            Some(mut raw) => Some(decode_trailers(&mut raw, *trailers_cnt)?),
                            None => None,
                        };
                        return Ok(Some(Decoded::Complete(trailers)));
                    }
                    match state.step(
                        buf,
                        chunk_len,
                        extensions_cnt,
                        trailers_buf,
                        trailers_cnt,
                        trailer_size_limit,
                    )? {
                        Step::Next(next) => *state = next,
                        Step::Data(next, data) => {
                            *state = next;
                            return Ok(Some(Decoded::Data(data)));
                        }
                        Step::NeedMore => return Ok(None),
                    }
                }
            }
            Empty => Ok(Some(Decoded::Complete(None))),
        }
    }
}

impl fmt::Debug for Decoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            Length(remaining) => f.debug_tuple("Length").field(&remaining).finish(),
            Chunked {
                ref state,
                ref chunk_len,
                ..
            } => f
                .debug_struct("Chunked")
                .field("state", state)
                .field("chunk_len", chunk_len)
                .finish(),
            Empty => f.write_str("Empty"),
        }
    }
}

macro_rules! byte (
    ($buf:ident) => ({
        if $buf.is_empty() {
            return Ok(Step::NeedMore);
        }
        $buf.split_to(1)[0]
    })
);

macro_rules! or_overflow {
    ($e:expr) => (
        match $e {
            Some(val) => val,
            None => return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid chunk size: overflow",
            )),
        }
    )
}

macro_rules! put_u8 {
    ($trailers_buf:expr, $byte:expr, $limit:expr) => {
        $trailers_buf.put_u8($byte);

        if $trailers_buf.len() >= $limit {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "chunk trailers bytes over limit",
            ));
        }
    };
}

impl ChunkedState {
    fn step(
        &self,
        buf: &mut BytesMut,
        size: &mut u64,
        extensions_cnt: &mut u64,
        trailers_buf: &mut Option<BytesMut>,
        trailers_cnt: &mut usize,
        trailer_size_limit: usize,
    ) -> io::Result<Step> {
        use self::ChunkedState::*;
        match *self {
            Start => ChunkedState::read_start(buf, size),
            Size => ChunkedState::read_size(buf, size),
            SizeLws => ChunkedState::read_size_lws(buf),
            Extension => ChunkedState::read_extension(buf, extensions_cnt),
            SizeLf => ChunkedState::read_size_lf(buf, *size),
            Body => ChunkedState::read_body(buf, size),
            BodyCr => ChunkedState::read_body_cr(buf),
            BodyLf => ChunkedState::read_body_lf(buf),
            Trailer => ChunkedState::read_trailer(buf, trailers_buf, trailer_size_limit),
            TrailerLf => {
                ChunkedState::read_trailer_lf(buf, trailers_buf, trailers_cnt, trailer_size_limit)
            }
            EndCr => ChunkedState::read_end_cr(buf, trailers_buf, trailer_size_limit),
            EndLf => ChunkedState::read_end_lf(buf, trailers_buf, trailer_size_limit),
            End => Ok(Step::Next(End)),
        }
    }

    fn read_start(buf: &mut BytesMut, size: &mut u64) -> io::Result<Step> {
        trace!("Read chunk start");
        match byte!(buf) {
            b @ b'0'..=b'9' => {
                *size = or_overflow!(size.checked_mul(16));
                *size = or_overflow!(size.checked_add((b - b'0') as u64));
            }
            b @ b'a'..=b'f' => {
                *size = or_overflow!(size.checked_mul(16));
                *size = or_overflow!(size.checked_add((b + 10 - b'a') as u64));
            }
            b @ b'A'..=b'F' => {
                *size = or_overflow!(size.checked_mul(16));
                *size = or_overflow!(size.checked_add((b + 10 - b'A') as u64));
            }
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "Invalid chunk size line: missing size digit",
                ));
            }
        }
        Ok(Step::Next(ChunkedState::Size))
    }

    fn read_size(buf: &mut BytesMut, size: &mut u64) -> io::Result<Step> {
        match byte!(buf) {
            b @ b'0'..=b'9' => {
                *size = or_overflow!(size.checked_mul(16));
                *size = or_overflow!(size.checked_add((b - b'0') as u64));
            }
            b @ b'a'..=b'f' => {
                *size = or_overflow!(size.checked_mul(16));
                *size = or_overflow!(size.checked_add((b + 10 - b'a') as u64));
            }
            b @ b'A'..=b'F' => {
                *size = or_overflow!(size.checked_mul(16));
                *size = or_overflow!(size.checked_add((b + 10 - b'A') as u64));
            }
            b'\t' | b' ' => return Ok(Step::Next(ChunkedState::SizeLws)),
            b';' => return Ok(Step::Next(ChunkedState::Extension)),
            b'\r' => return Ok(Step::Next(ChunkedState::SizeLf)),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "Invalid chunk size line: Invalid Size",
                ));
            }
        }
        Ok(Step::Next(ChunkedState::Size))
    }

    fn read_size_lws(buf: &mut BytesMut) -> io::Result<Step> {
        match byte!(buf) {
            // LWS can follow the chunk size, but no more digits can come
            b'\t' | b' ' => Ok(Step::Next(ChunkedState::SizeLws)),
            b';' => Ok(Step::Next(ChunkedState::Extension)),
            b'\r' => Ok(Step::Next(ChunkedState::SizeLf)),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Invalid chunk size linear white space",
            )),
        }
    }

    fn read_extension(buf: &mut BytesMut, extensions_cnt: &mut u64) -> io::Result<Step> {
        // Extensions "end" at the next CRLF; nothing in them is honored.
        // Some implementations may not check for the CR, so a plain LF in
        // an extension is rejected as well.
        match byte!(buf) {
            b'\r' => Ok(Step::Next(ChunkedState::SizeLf)),
            b'\n' => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid chunk extension contains newline",
            )),
            _ => {
                *extensions_cnt += 1;
                if *extensions_cnt >= CHUNKED_EXTENSIONS_LIMIT {
                    Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "chunk extensions over limit",
                    ))
                } else {
                    Ok(Step::Next(ChunkedState::Extension))
                }
            }
        }
    }

    fn read_size_lf(buf: &mut BytesMut, size: u64) -> io::Result<Step> {
        match byte!(buf) {
            b'\n' if size > 0 => Ok(Step::Next(ChunkedState::Body)),
            b'\n' => Ok(Step::Next(ChunkedState::EndCr)),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Invalid chunk size LF",
            )),
        }
    }

    fn read_body(buf: &mut BytesMut, rem: &mut u64) -> io::Result<Step> {
        if buf.is_empty() {
            return Ok(Step::NeedMore);
        }
        let take = std::cmp::min(*rem, buf.len() as u64) as usize;
        *rem -= take as u64;
        let next = if *rem > 0 {
            ChunkedState::Body
        } else {
            ChunkedState::BodyCr
        };
        Ok(Step::Data(next, buf.split_to(take).freeze()))
    }

    fn read_body_cr(buf: &mut BytesMut) -> io::Result<Step> {
        match byte!(buf) {
            b'\r' => Ok(Step::Next(ChunkedState::BodyLf)),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Invalid chunk body CR",
            )),
        }
    }

    fn read_body_lf(buf: &mut BytesMut) -> io::Result<Step> {
        match byte!(buf) {
            b'\n' => Ok(Step::Next(ChunkedState::Start)),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Invalid chunk body LF",
            )),
        }
    }

    fn read_trailer(
        buf: &mut BytesMut,
        trailers_buf: &mut Option<BytesMut>,
        limit: usize,
    ) -> io::Result<Step> {
        let byte = byte!(buf);
        put_u8!(trailers_buf.as_mut().expect("trailers_buf is None"), byte, limit);
        match byte {
            b'\r' => Ok(Step::Next(ChunkedState::TrailerLf)),
            _ => Ok(Step::Next(ChunkedState::Trailer)),
        }
    }

    fn read_trailer_lf(
        buf: &mut BytesMut,
        trailers_buf: &mut Option<BytesMut>,
        trailers_cnt: &mut usize,
        limit: usize,
    ) -> io::Result<Step> {
        let byte = byte!(buf);
        match byte {
            b'\n' => {
                if *trailers_cnt >= TRAILER_FIELD_LIMIT {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "chunk trailers count overflow",
                    ));
                }
                *trailers_cnt += 1;
                put_u8!(trailers_buf.as_mut().expect("trailers_buf is None"), byte, limit);
                Ok(Step::Next(ChunkedState::EndCr))
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Invalid trailer end LF",
            )),
        }
    }

    fn read_end_cr(
        buf: &mut BytesMut,
        trailers_buf: &mut Option<BytesMut>,
        limit: usize,
    ) -> io::Result<Step> {
        let byte = byte!(buf);
        match byte {
            b'\r' => {
                if let Some(trailers_buf) = trailers_buf {
                    put_u8!(trailers_buf, byte, limit);
                }
                Ok(Step::Next(ChunkedState::EndLf))
            }
            byte => {
                match trailers_buf {
                    None => {
                        let mut buf = BytesMut::new();
                        buf.put_u8(byte);
                        *trailers_buf = Some(buf);
                    }
                    Some(trailers_buf) => {
                        put_u8!(trailers_buf, byte, limit);
                    }
                }
                Ok(Step::Next(ChunkedState::Trailer))
            }
        }
    }

    fn read_end_lf(
        buf: &mut BytesMut,
        trailers_buf: &mut Option<BytesMut>,
        limit: usize,
    ) -> io::Result<Step> {
        let byte = byte!(buf);
        match byte {
            b'\n' => {
                if let Some(trailers_buf) = trailers_buf {
                    put_u8!(trailers_buf, byte, limit);
                }
                Ok(Step::Next(ChunkedState::End))
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Invalid chunk end LF",
            )),
        }
    }
}

fn decode_trailers(buf: &mut BytesMut, count: usize) -> io::Result<HeaderMap> {
    let mut trailers = HeaderMap::new();
    let mut headers = vec![httparse::EMPTY_HEADER; count];
    let res = httparse::parse_headers(buf, &mut headers);
    match res {
        Ok(httparse::Status::Complete((_, headers))) => {
            for header in headers.iter() {
                let name = HeaderName::from_bytes(header.name.as_bytes())
                    .map_err(|_| invalid_trailer())?;
                let value =
                    HeaderValue::from_bytes(header.value).map_err(|_| invalid_trailer())?;
                trailers.append(name, value);
            }
            Ok(trailers)
        }
        Ok(httparse::Status::Partial) => Err(invalid_trailer()),
        Err(_) => Err(invalid_trailer()),
    }
}

fn invalid_trailer() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "invalid trailer")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(decoder: &mut Decoder, raw: &[u8]) -> (Vec<u8>, Option<HeaderMap>) {
        let mut buf = BytesMut::from(raw);
        let mut body = Vec::new();
        loop {
            match decoder.decode(&mut buf).expect("decode") {
                Some(Decoded::Data(data)) => body.extend_from_slice(&data),
                Some(Decoded::Complete(trailers)) => return (body, trailers),
                None => panic!("decoder starved with {} bytes left", buf.len()),
            }
        }
    }

    #[test]
    fn test_read_sized_early_eof() {
        let mut buf = BytesMut::from(&b"foo bar"[..]);
        let mut decoder = Decoder::length(10);
        match decoder.decode(&mut buf).unwrap() {
            Some(Decoded::Data(data)) => assert_eq!(data.len(), 7),
            other => panic!("unexpected: {:?}", other),
        }
        // buffer is dry, more is needed
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert!(!decoder.is_eof());
    }

    #[test]
    fn test_read_sized_stops_at_length() {
        let mut decoder = Decoder::length(5);
        let (body, trailers) = drain(&mut decoder, b"helloGET /next");
        assert_eq!(body, b"hello");
        assert!(trailers.is_none());
        assert!(decoder.is_eof());
    }

    #[test]
    fn test_read_chunked_single_read() {
        let mut decoder = Decoder::chunked(1024);
        let (body, _) = drain(&mut decoder, b"10\r\n1234567890abcdef\r\n0\r\n\r\n");
        assert_eq!(body, b"1234567890abcdef");
        assert!(decoder.is_eof());
    }

    #[test]
    fn test_read_chunked_extensions_ignored() {
        let mut decoder = Decoder::chunked(1024);
        let (body, _) = drain(&mut decoder, b"5;ext=1\r\nhello\r\n0\r\n\r\n");
        assert_eq!(body, b"hello");
    }

    #[test]
    fn test_read_chunked_byte_at_a_time() {
        let raw = b"5\r\nhello\r\n0\r\n\r\n";
        let mut decoder = Decoder::chunked(1024);
        let mut buf = BytesMut::new();
        let mut body = Vec::new();
        let mut done = false;
        for &b in raw.iter() {
            buf.extend_from_slice(&[b]);
            while let Some(decoded) = decoder.decode(&mut buf).unwrap() {
                match decoded {
                    Decoded::Data(data) => body.extend_from_slice(&data),
                    Decoded::Complete(_) => {
                        done = true;
                        break;
                    }
                }
            }
            if done {
                break;
            }
        }
        assert!(done);
        assert_eq!(body, b"hello");
    }

    #[test]
    fn test_read_chunked_trailers() {
        let mut decoder = Decoder::chunked(1024);
        let (body, trailers) =
            drain(&mut decoder, b"5\r\nhello\r\n0\r\nExpires: never\r\nX-Sum: 9\r\n\r\n");
        assert_eq!(body, b"hello");
        let trailers = trailers.expect("trailers");
        assert_eq!(trailers["expires"], "never");
        assert_eq!(trailers["x-sum"], "9");
    }

    #[test]
    fn test_read_chunked_bad_size() {
        let mut decoder = Decoder::chunked(1024);
        let mut buf = BytesMut::from(&b"xyz\r\n"[..]);
        decoder.decode(&mut buf).unwrap_err();
    }

    #[test]
    fn test_read_chunked_size_overflow() {
        let mut decoder = Decoder::chunked(1024);
        let mut buf = BytesMut::from(&b"fffffffffffffffff\r\n"[..]);
        decoder.decode(&mut buf).unwrap_err();
    }

    #[test]
    fn test_trailer_bytes_over_limit() {
        let mut decoder = Decoder::chunked(16);
        let mut raw = Vec::from(&b"0\r\n"[..]);
        raw.extend_from_slice(b"X-Padding: ");
        raw.extend(std::iter::repeat(b'a').take(64));
        raw.extend_from_slice(b"\r\n\r\n");
        let mut buf = BytesMut::from(&raw[..]);
        decoder.decode(&mut buf).unwrap_err();
    }

    #[test]
    fn test_empty_body_is_immediately_complete() {
        let mut decoder = Decoder::empty();
        let mut buf = BytesMut::from(&b"GET /pipelined HTTP/1.1\r\n"[..]);
        assert_eq!(
            decoder.decode(&mut buf).unwrap(),
            Some(Decoded::Complete(None))
        );
        // pipelined bytes untouched
        assert_eq!(buf.len(), 25);
    }
}
