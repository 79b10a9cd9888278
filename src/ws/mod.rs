//! WebSocket support: the RFC 6455 handshake and the framed channel an
//! accepted upgrade turns into.

mod frame;

use bytes::{Buf, Bytes, BytesMut};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use http::header::{
    HeaderValue, CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL,
    SEC_WEBSOCKET_VERSION, UPGRADE,
};
use http::{HeaderMap, Method, StatusCode};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace};

use self::frame::{close_payload, parse_frame, protocol_error, write_frame, Opcode};
use crate::context::Context;
use crate::error::Upgrade;
use crate::proto::{EncodeKind, ResponseHead};
use crate::upgrade::Upgraded;

/// The GUID appended to the client key, fixed by RFC 6455 §1.3.
const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// A message received from or sent to the peer.
///
/// Ping and pong frames never surface here; the channel answers pings on
/// its own while receiving.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
    Close(Option<CloseFrame>),
}

/// Code and reason of a close frame.
#[derive(Clone, Debug, PartialEq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

/// Computes the `Sec-WebSocket-Accept` value for a client key.
pub(crate) fn accept_key(key: &[u8]) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key);
    sha1.update(WS_GUID);
    BASE64.encode(sha1.finalize())
}

/// Validates the handshake and relinquishes the connection.
pub(crate) async fn accept(
    mut ctx: Context,
    subprotocol: Option<&str>,
) -> crate::Result<WebSocket> {
    let key = match handshake_key(&ctx.request.method, &ctx.request.headers) {
        Some(key) => key,
        None => {
            debug!("malformed websocket handshake");
            let _ = ctx.response.send_status(StatusCode::BAD_REQUEST).await;
            return Err(crate::Error::new_upgrade(Upgrade::Handshake));
        }
    };

    let chosen = match subprotocol {
        Some(wanted) => {
            if offered_protocols(&ctx.request.headers)
                .any(|offered| offered.eq_ignore_ascii_case(wanted))
            {
                Some(wanted.to_owned())
            } else {
                debug!(wanted, "requested websocket sub-protocol was not offered");
                let _ = ctx.response.send_status(StatusCode::UPGRADE_REQUIRED).await;
                return Err(crate::Error::new_upgrade(Upgrade::Protocol));
            }
        }
        None => None,
    };

    let accept = accept_key(&key);
    let mut headers = HeaderMap::new();
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(
        SEC_WEBSOCKET_ACCEPT,
        HeaderValue::from_str(&accept).map_err(|_| crate::Error::new_upgrade(Upgrade::Handshake))?,
    );
    if let Some(protocol) = &chosen {
        headers.insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_str(protocol)
                .map_err(|_| crate::Error::new_upgrade(Upgrade::Protocol))?,
        );
    }

    let head = ResponseHead {
        status: StatusCode::SWITCHING_PROTOCOLS,
        reason: None,
        headers,
        keep_alive: true,
        encode: EncodeKind::Empty,
    };

    let upgraded_rx = ctx.response.send_upgrade(head).await?;
    let upgraded = upgraded_rx
        .await
        .map_err(|_| crate::Error::new_closed())?;
    trace!("websocket handshake complete");
    Ok(WebSocket::new(upgraded, chosen))
}

/// Extracts the client key when every required handshake header checks
/// out; `None` means 400.
fn handshake_key(method: &Method, headers: &HeaderMap) -> Option<Vec<u8>> {
    if method != Method::GET {
        return None;
    }
    let upgrade_ok = headers
        .get_all(UPGRADE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("websocket"));
    if !upgrade_ok || !crate::proto::h1::connection_has(headers, "upgrade") {
        return None;
    }
    if headers.get(SEC_WEBSOCKET_VERSION)?.as_bytes() != b"13" {
        return None;
    }
    let key = headers.get(SEC_WEBSOCKET_KEY)?;
    let decoded = BASE64.decode(key.as_bytes()).ok()?;
    if decoded.len() != 16 {
        return None;
    }
    Some(key.as_bytes().to_vec())
}

fn offered_protocols(headers: &HeaderMap) -> impl Iterator<Item = &str> {
    headers
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
}

/// A framed duplex channel over an upgraded connection.
pub struct WebSocket {
    io: Upgraded,
    read_buf: BytesMut,
    fragment: Option<(Opcode, BytesMut)>,
    subprotocol: Option<String>,
    close_sent: bool,
    close_received: bool,
}

impl WebSocket {
    fn new(io: Upgraded, subprotocol: Option<String>) -> WebSocket {
        WebSocket {
            io,
            read_buf: BytesMut::with_capacity(4096),
            fragment: None,
            subprotocol,
            close_sent: false,
            close_received: false,
        }
    }

    /// The sub-protocol agreed on during the handshake.
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// Receives the next text, binary or close message.
    ///
    /// Pings are answered with pongs transparently; a close from the peer
    /// is echoed before being surfaced.
    pub async fn recv(&mut self) -> crate::Result<Message> {
        if self.close_received {
            return Err(crate::Error::new_closed());
        }
        loop {
            while let Some(frame) =
                parse_frame(&mut self.read_buf).map_err(crate::Error::new_io)?
            {
                if let Some(message) = self.handle_frame(frame).await? {
                    return Ok(message);
                }
            }
            let n = self
                .io
                .read_buf(&mut self.read_buf)
                .await
                .map_err(crate::Error::new_io)?;
            if n == 0 {
                return Err(crate::Error::new_aborted());
            }
        }
    }

    async fn handle_frame(&mut self, frame: frame::Frame) -> crate::Result<Option<Message>> {
        match frame.opcode {
            Opcode::Ping => {
                trace!("answering ping with pong");
                self.write(Opcode::Pong, &frame.payload).await?;
                Ok(None)
            }
            Opcode::Pong => Ok(None),
            Opcode::Close => {
                let close = parse_close(&frame.payload)?;
                self.close_received = true;
                if !self.close_sent {
                    self.close_sent = true;
                    let payload = match &close {
                        Some(frame) => close_payload(frame.code, ""),
                        None => Vec::new(),
                    };
                    self.write(Opcode::Close, &payload).await?;
                }
                Ok(Some(Message::Close(close)))
            }
            Opcode::Text | Opcode::Binary => {
                if self.fragment.is_some() {
                    return Err(crate::Error::new_io(protocol_error(
                        "data frame interleaved with fragmented message",
                    )));
                }
                if frame.fin {
                    Ok(Some(into_message(frame.opcode, frame.payload)?))
                } else {
                    self.fragment = Some((frame.opcode, BytesMut::from(&frame.payload[..])));
                    Ok(None)
                }
            }
            Opcode::Continuation => {
                let (opcode, mut buffered) = self
                    .fragment
                    .take()
                    .ok_or_else(|| {
                        crate::Error::new_io(protocol_error("continuation without a start frame"))
                    })?;
                if (buffered.len() + frame.payload.len()) as u64 > frame::MAX_MESSAGE_SIZE {
                    return Err(crate::Error::new_io(protocol_error(
                        "fragmented message over limit",
                    )));
                }
                buffered.extend_from_slice(&frame.payload);
                if frame.fin {
                    Ok(Some(into_message(opcode, buffered.freeze())?))
                } else {
                    self.fragment = Some((opcode, buffered));
                    Ok(None)
                }
            }
        }
    }

    pub async fn send_text(&mut self, text: &str) -> crate::Result<()> {
        self.send_data(Opcode::Text, text.as_bytes()).await
    }

    pub async fn send_binary(&mut self, data: &[u8]) -> crate::Result<()> {
        self.send_data(Opcode::Binary, data).await
    }

    /// Sends an unsolicited ping.
    pub async fn ping(&mut self, payload: &[u8]) -> crate::Result<()> {
        self.send_data(Opcode::Ping, payload).await
    }

    /// Sends a close frame. Receiving may continue until the peer echoes
    /// the close.
    pub async fn close(&mut self, code: u16, reason: &str) -> crate::Result<()> {
        if self.close_sent {
            return Ok(());
        }
        self.close_sent = true;
        let payload = close_payload(code, reason);
        self.write(Opcode::Close, &payload).await
    }

    async fn send_data(&mut self, opcode: Opcode, payload: &[u8]) -> crate::Result<()> {
        if self.close_sent {
            return Err(crate::Error::new_closed());
        }
        self.write(opcode, payload).await
    }

    async fn write(&mut self, opcode: Opcode, payload: &[u8]) -> crate::Result<()> {
        let mut dst = Vec::with_capacity(payload.len() + 10);
        write_frame(&mut dst, opcode, payload);
        self.io
            .write_all(&dst)
            .await
            .map_err(crate::Error::new_io)?;
        self.io.flush().await.map_err(crate::Error::new_io)
    }
}

impl std::fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocket")
            .field("subprotocol", &self.subprotocol)
            .field("close_sent", &self.close_sent)
            .finish()
    }
}

fn into_message(opcode: Opcode, payload: Bytes) -> crate::Result<Message> {
    match opcode {
        Opcode::Text => {
            let text = String::from_utf8(payload.to_vec())
                .map_err(|_| crate::Error::new_io(protocol_error("text frame is not UTF-8")))?;
            Ok(Message::Text(text))
        }
        Opcode::Binary => Ok(Message::Binary(payload)),
        other => Err(crate::Error::new_io(protocol_error(format!(
            "unexpected data opcode {:?}",
            other
        )))),
    }
}

fn parse_close(payload: &[u8]) -> crate::Result<Option<CloseFrame>> {
    if payload.is_empty() {
        return Ok(None);
    }
    if payload.len() < 2 {
        return Err(crate::Error::new_io(protocol_error(
            "close frame with one-byte payload",
        )));
    }
    let mut payload = payload;
    let code = payload.get_u16();
    let reason = String::from_utf8(payload.to_vec())
        .map_err(|_| crate::Error::new_io(protocol_error("close reason is not UTF-8")))?;
    Ok(Some(CloseFrame { code, reason }))
}
