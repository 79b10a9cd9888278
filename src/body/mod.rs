//! Streaming bodies and the connection/application handoff channels.
//!
//! Each exchange owns two channels. Request body frames flow from the
//! connection worker into a bounded [`BodyReader`]; response commands flow
//! from the [`Response`](crate::Response) back to the worker. Both are
//! small-capacity channels so a slow consumer stalls the worker, which in
//! turn stops reading the socket — backpressure ends up at the TCP layer.

use bytes::Bytes;
use futures_channel::{mpsc, oneshot};
use futures_util::StreamExt;
use http::HeaderMap;

use crate::proto::ResponseHead;
use crate::upgrade::Upgraded;

/// Body frames travelling from the connection to the reader.
#[derive(Debug)]
pub(crate) enum BodyFrame {
    Data(Bytes),
    /// The wire body is complete; chunked bodies may carry trailers.
    End { trailers: Option<HeaderMap> },
}

/// Response commands travelling from the application to the connection.
pub(crate) enum Command {
    /// Commit the head; streamed data follows.
    Head(ResponseHead),
    Data(Bytes),
    /// Head plus entire body plus end, committed atomically.
    Full(ResponseHead, Bytes),
    End,
    /// The application hit an unrecoverable write error; the connection
    /// must close without keep-alive.
    Abort,
    /// Write this 101 head, then hand the transport over.
    Upgrade(ResponseHead, oneshot::Sender<Upgraded>),
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Head(head) => f.debug_tuple("Head").field(&head.status).finish(),
            Command::Data(data) => f.debug_tuple("Data").field(&data.len()).finish(),
            Command::Full(head, data) => f
                .debug_tuple("Full")
                .field(&head.status)
                .field(&data.len())
                .finish(),
            Command::End => f.write_str("End"),
            Command::Abort => f.write_str("Abort"),
            Command::Upgrade(head, _) => f.debug_tuple("Upgrade").field(&head.status).finish(),
        }
    }
}

pub(crate) struct BodySender {
    pub(crate) tx: mpsc::Sender<BodyFrame>,
    /// Fired by the reader's first `data()` call; drives `100 Continue`.
    pub(crate) demand_rx: oneshot::Receiver<()>,
}

/// Creates the request-body channel pair for one exchange.
pub(crate) fn body_channel() -> (BodySender, BodyReader) {
    let (tx, rx) = mpsc::channel(0);
    let (demand_tx, demand_rx) = oneshot::channel();
    (
        BodySender { tx, demand_rx },
        BodyReader {
            rx,
            demand: Some(demand_tx),
            state: ReadState::Streaming,
            trailers: None,
        },
    )
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum ReadState {
    Streaming,
    Eof,
    Aborted,
}

/// A lazy, single-pass stream over the request body.
///
/// Yields the body exactly as framed on the wire — at most `Content-Length`
/// bytes for sized bodies, de-chunked data for chunked ones. After the last
/// frame `data()` keeps returning `None`; after a connection abort it keeps
/// returning an error.
pub struct BodyReader {
    rx: mpsc::Receiver<BodyFrame>,
    demand: Option<oneshot::Sender<()>>,
    state: ReadState,
    trailers: Option<HeaderMap>,
}

impl BodyReader {
    /// Resolves with the next chunk of body data, or `None` at the end of
    /// the body.
    pub async fn data(&mut self) -> Option<crate::Result<Bytes>> {
        self.next().await
    }

    /// Trailer fields of a chunked body, available once `data()` has
    /// returned `None`.
    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.trailers.as_ref()
    }

    pub(crate) fn take_trailers(&mut self) -> Option<HeaderMap> {
        self.trailers.take()
    }
}

impl futures_core::Stream for BodyReader {
    type Item = crate::Result<Bytes>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        use std::task::Poll;

        if let Some(demand) = self.demand.take() {
            let _ = demand.send(());
        }
        match self.state {
            ReadState::Eof => return Poll::Ready(None),
            ReadState::Aborted => return Poll::Ready(Some(Err(crate::Error::new_aborted()))),
            ReadState::Streaming => {}
        }
        loop {
            match futures_util::ready!(std::pin::Pin::new(&mut self.rx).poll_next(cx)) {
                Some(BodyFrame::Data(data)) => {
                    if !data.is_empty() {
                        return Poll::Ready(Some(Ok(data)));
                    }
                }
                Some(BodyFrame::End { trailers }) => {
                    self.trailers = trailers;
                    self.state = ReadState::Eof;
                    return Poll::Ready(None);
                }
                None => {
                    self.state = ReadState::Aborted;
                    return Poll::Ready(Some(Err(crate::Error::new_aborted())));
                }
            }
        }
    }
}

impl std::fmt::Debug for BodyReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodyReader").field("state", &self.state).finish()
    }
}
