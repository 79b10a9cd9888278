use bytes::Bytes;
use futures_channel::mpsc;
use futures_util::SinkExt;
use http::header::CONTENT_LENGTH;
use http::{HeaderMap, StatusCode, Version};
use tracing::debug;

use crate::body::Command;
use crate::error::User;
use crate::proto::{EncodeKind, ResponseHead};

/// The outgoing half of an exchange.
///
/// Status, reason and headers are freely mutable until the first body byte
/// is committed; from then on the head is on the wire and mutations fail.
/// A response is either streamed with [`write`](Response::write) +
/// [`finish`](Response::finish), or sent in one piece with
/// [`send_full`](Response::send_full).
pub struct Response {
    status: StatusCode,
    reason: Option<Box<str>>,
    headers: HeaderMap,
    keep_alive: bool,
    chunked: Option<bool>,
    state: WriteState,
    cmd_tx: mpsc::Sender<Command>,
    client_version: Version,
}

enum WriteState {
    Unsent,
    Streaming { remaining: Option<u64> },
    Finished,
}

impl Response {
    pub(crate) fn new(cmd_tx: mpsc::Sender<Command>, client_version: Version) -> Response {
        Response {
            status: StatusCode::OK,
            reason: None,
            headers: HeaderMap::new(),
            keep_alive: true,
            chunked: None,
            state: WriteState::Unsent,
            cmd_tx,
            client_version,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) -> crate::Result<()> {
        self.check_unsent()?;
        self.status = status;
        Ok(())
    }

    /// Overrides the canonical reason phrase of the status line.
    pub fn set_reason(&mut self, reason: impl Into<Box<str>>) -> crate::Result<()> {
        self.check_unsent()?;
        self.reason = Some(reason.into());
        Ok(())
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable access to the response headers.
    ///
    /// Fails once the head has been written to the wire.
    pub fn headers_mut(&mut self) -> crate::Result<&mut HeaderMap> {
        self.check_unsent()?;
        Ok(&mut self.headers)
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Requests that the connection close after this response.
    pub fn set_keep_alive(&mut self, keep_alive: bool) -> crate::Result<()> {
        self.check_unsent()?;
        self.keep_alive = keep_alive;
        Ok(())
    }

    /// Forces chunked transfer coding on or off. Without a call, chunked is
    /// used whenever no `Content-Length` is set and the client speaks 1.1.
    pub fn set_chunked(&mut self, chunked: bool) -> crate::Result<()> {
        self.check_unsent()?;
        self.chunked = Some(chunked);
        Ok(())
    }

    /// Streams one chunk of body data, committing the head on the first
    /// call.
    ///
    /// With a declared `Content-Length` the writer enforces the total:
    /// bytes past the declared length are truncated and an error is
    /// returned.
    pub async fn write(&mut self, data: impl Into<Bytes>) -> crate::Result<()> {
        let mut data = data.into();
        if let WriteState::Unsent = self.state {
            let head = self.snapshot_head()?;
            let remaining = match head.encode {
                EncodeKind::Length(len) => Some(len),
                _ => None,
            };
            self.send(Command::Head(head)).await?;
            self.state = WriteState::Streaming { remaining };
        }
        let remaining = match self.state {
            WriteState::Streaming { ref mut remaining } => remaining,
            WriteState::Finished => {
                return Err(crate::Error::new_user(User::ResponseCompleted))
            }
            WriteState::Unsent => unreachable!("head was just committed"),
        };
        if data.is_empty() {
            return Ok(());
        }
        let mut overflow = false;
        if let Some(remaining) = remaining {
            if data.len() as u64 > *remaining {
                debug!("response body write past content-length, truncating");
                data.truncate(*remaining as usize);
                overflow = true;
            }
            *remaining -= data.len() as u64;
        }
        if !data.is_empty() {
            self.send(Command::Data(data)).await?;
        }
        if overflow {
            return Err(crate::Error::new_user(User::BodyOverflow));
        }
        Ok(())
    }

    /// Sends the whole response in one piece, setting `Content-Length`
    /// when the application did not.
    pub async fn send_full(&mut self, body: impl Into<Bytes>) -> crate::Result<()> {
        let body = body.into();
        if !matches!(self.state, WriteState::Unsent) {
            return Err(crate::Error::new_user(User::ResponseCompleted));
        }
        let mut head = self.snapshot_head()?;
        match head.encode {
            EncodeKind::Length(len) if len != body.len() as u64 => {
                return Err(crate::Error::new_user(if len < body.len() as u64 {
                    User::BodyOverflow
                } else {
                    User::BodyUnderflow
                }));
            }
            EncodeKind::Length(_) => {}
            _ => head.encode = EncodeKind::Length(body.len() as u64),
        }
        self.send(Command::Full(head, body)).await?;
        self.state = WriteState::Finished;
        Ok(())
    }

    /// Sends an empty response with the given status.
    pub async fn send_status(&mut self, status: StatusCode) -> crate::Result<()> {
        self.set_status(status)?;
        self.finish().await
    }

    /// Completes the response.
    ///
    /// Commits the head first when nothing was written yet. Finishing a
    /// streamed response short of its declared `Content-Length` is an
    /// error, and the connection will close without keep-alive.
    pub async fn finish(&mut self) -> crate::Result<()> {
        match self.state {
            WriteState::Finished => Ok(()),
            WriteState::Unsent => {
                let mut head = self.snapshot_head()?;
                match head.encode {
                    EncodeKind::Length(0) | EncodeKind::Empty => {
                        head.encode = EncodeKind::Empty;
                    }
                    EncodeKind::Length(missing) => {
                        debug!(missing, "response finished before declared content-length");
                        self.state = WriteState::Finished;
                        let _ = self.send(Command::Abort).await;
                        return Err(crate::Error::new_user(User::BodyUnderflow));
                    }
                    _ => head.encode = EncodeKind::Empty,
                }
                self.send(Command::Full(head, Bytes::new())).await?;
                self.state = WriteState::Finished;
                Ok(())
            }
            WriteState::Streaming { remaining } => {
                self.state = WriteState::Finished;
                match remaining {
                    Some(missing) if missing > 0 => {
                        debug!(missing, "response finished before declared content-length");
                        let _ = self.send(Command::Abort).await;
                        Err(crate::Error::new_user(User::BodyUnderflow))
                    }
                    _ => {
                        self.send(Command::End).await?;
                        Ok(())
                    }
                }
            }
        }
    }

    /// Whether the head has been committed to the wire.
    pub fn is_started(&self) -> bool {
        !matches!(self.state, WriteState::Unsent)
    }

    /// Whether the response has been completed.
    pub fn is_finished(&self) -> bool {
        matches!(self.state, WriteState::Finished)
    }

    pub(crate) async fn send_upgrade(
        &mut self,
        head: ResponseHead,
    ) -> crate::Result<futures_channel::oneshot::Receiver<crate::upgrade::Upgraded>> {
        if !matches!(self.state, WriteState::Unsent) {
            return Err(crate::Error::new_user(User::ResponseCompleted));
        }
        let (tx, rx) = futures_channel::oneshot::channel();
        self.send(Command::Upgrade(head, tx)).await?;
        self.state = WriteState::Finished;
        Ok(rx)
    }

    pub(crate) fn snapshot_head(&self) -> crate::Result<ResponseHead> {
        // close-delimited framing forces the close on the connection side
        Ok(ResponseHead {
            status: self.status,
            reason: self.reason.clone(),
            headers: self.headers.clone(),
            keep_alive: self.keep_alive,
            encode: self.encode_kind()?,
        })
    }

    /// Framing decision for the response body, mirroring the request-side
    /// rules: a declared `Content-Length` wins, then the explicit chunked
    /// toggle, then chunked-by-default on HTTP/1.1 and close-delimited on
    /// HTTP/1.0. Statuses (and HEAD exchanges) that forbid a body always
    /// encode as empty downstream.
    fn encode_kind(&self) -> crate::Result<EncodeKind> {
        if let Some(value) = self.headers.get(CONTENT_LENGTH) {
            let len = value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .ok_or_else(|| crate::Error::new_user(User::InvalidContentLength))?;
            return Ok(EncodeKind::Length(len));
        }
        match self.chunked {
            Some(true) => Ok(EncodeKind::Chunked),
            Some(false) => Ok(EncodeKind::CloseDelimited),
            None if self.client_version == Version::HTTP_11 => Ok(EncodeKind::Chunked),
            None => Ok(EncodeKind::CloseDelimited),
        }
    }

    async fn send(&mut self, command: Command) -> crate::Result<()> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| crate::Error::new_closed())
    }

    fn check_unsent(&self) -> crate::Result<()> {
        if matches!(self.state, WriteState::Unsent) {
            Ok(())
        } else {
            Err(crate::Error::new_user(User::HeadersAlreadySent))
        }
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("keep_alive", &self.keep_alive)
            .field("started", &self.is_started())
            .finish()
    }
}
