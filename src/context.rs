use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

use crate::request::Request;
use crate::response::Response;
use crate::ws::WebSocket;

/// One HTTP exchange: the parsed request, the response under construction,
/// and the lifecycle signals tying both to their connection.
///
/// A context is delivered to exactly one consumer, via
/// [`Engine::get_context`](crate::Engine::get_context) or the installed
/// handler. Completing the response (explicitly or by
/// [`Response::send_full`]) lets the connection move on to its next
/// request; dropping an incomplete context makes the engine answer `500`
/// for the application.
pub struct Context {
    pub(crate) request: Request,
    pub(crate) response: Response,
    pub(crate) abort_rx: watch::Receiver<bool>,
    pub(crate) bytes_in: Arc<AtomicU64>,
    pub(crate) bytes_out: Arc<AtomicU64>,
}

impl Context {
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Mutable request access, required to stream the body.
    pub fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut Response {
        &mut self.response
    }

    /// Splits the context into its request and response halves.
    pub fn into_parts(self) -> (Request, Response) {
        (self.request, self.response)
    }

    /// Whether the exchange has been aborted by a client disconnect or an
    /// engine stop.
    pub fn is_aborted(&self) -> bool {
        *self.abort_rx.borrow()
    }

    /// A signal that fires when the exchange is aborted. Never fires for
    /// exchanges that complete normally.
    pub fn aborted(&self) -> AbortSignal {
        AbortSignal {
            rx: self.abort_rx.clone(),
        }
    }

    /// Completes response processing. Implicit when the response body is
    /// finished; this explicit form exists for error paths.
    pub async fn complete_processing(&mut self) -> crate::Result<()> {
        self.response.finish().await
    }

    /// Performs the RFC 6455 handshake and relinquishes the connection.
    ///
    /// `subprotocol` is echoed only when the client offered it; a mismatch
    /// answers `426 Upgrade Required` and fails.
    pub async fn accept_websocket(
        self,
        subprotocol: Option<&str>,
    ) -> crate::Result<WebSocket> {
        crate::ws::accept(self, subprotocol).await
    }

    /// Bytes received on this connection so far, including the head.
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    /// Bytes written to this connection so far.
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("request", &self.request)
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

/// An owned, awaitable view of a context's abort state.
#[derive(Clone, Debug)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when the exchange aborts; pends forever when it completes
    /// normally instead.
    pub async fn aborted(mut self) {
        if *self.rx.borrow() {
            return;
        }
        loop {
            if self.rx.changed().await.is_err() {
                // the connection finished without aborting
                std::future::pending::<()>().await;
            }
            if *self.rx.borrow() {
                return;
            }
        }
    }
}
