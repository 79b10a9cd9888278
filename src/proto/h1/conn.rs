//! The per-connection worker.
//!
//! One task owns one socket for the socket's whole life: it parses request
//! heads, hands Contexts to the queue, pumps decoded body frames toward the
//! application, and writes response commands back to the wire. Requests on
//! one connection are served strictly in arrival order; keep-alive loops
//! back to head parsing, everything else falls through to the close path.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_channel::mpsc;
use futures_util::future::poll_fn;
use futures_util::StreamExt;
use http::{HeaderMap, Method, StatusCode, Version};
use rustls_pki_types::CertificateDer;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, trace};
use uuid::Uuid;

use super::{can_have_body, parse_request, Buffered, Decoded, Decoder, Encoder, ParseConfig};
use crate::body::{body_channel, BodyFrame, Command};
use crate::config::ServerConfig;
use crate::context::Context;
use crate::proto::{BodyLength, EncodeKind, ResponseHead};
use crate::queue::QueueSender;
use crate::request::Request;
use crate::response::Response;
use crate::upgrade::Upgraded;

const CONTINUE_LINE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Everything a connection worker shares with its listener.
pub(crate) struct ConnParams {
    pub(crate) config: Arc<ServerConfig>,
    pub(crate) queue: QueueSender,
    pub(crate) shutdown: watch::Receiver<bool>,
    pub(crate) remote_addr: SocketAddr,
    pub(crate) local_addr: SocketAddr,
    pub(crate) is_secure: bool,
    pub(crate) client_certificate: Option<CertificateDer<'static>>,
}

enum Next {
    KeepAlive,
    Close,
    Upgrade(futures_channel::oneshot::Sender<Upgraded>),
}

enum HeadOutcome {
    Head(super::RequestHead),
    Eof,
    Shutdown,
    TimedOut,
    Fatal(crate::Error),
}

/// Serves HTTP/1.1 on `io` until the connection ends one way or another.
pub(crate) async fn serve<T>(io: T, mut params: ConnParams)
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut io = Buffered::new(io);
    let parse_config = ParseConfig {
        accept_bare_lf: params.config.accept_bare_lf,
        max_request_line_bytes: params.config.max_request_line_bytes,
        max_headers_bytes: params.config.max_headers_bytes,
    };
    let idle = params.config.idle_connection_timeout;

    loop {
        let head = match read_head(&mut io, &parse_config, idle, &mut params.shutdown).await {
            HeadOutcome::Head(head) => head,
            HeadOutcome::Eof => {
                trace!("connection closed by peer between requests");
                break;
            }
            HeadOutcome::Shutdown => {
                trace!("engine stopping, closing idle connection");
                break;
            }
            HeadOutcome::TimedOut => {
                debug!("idle connection timed out");
                break;
            }
            HeadOutcome::Fatal(err) => {
                if let Some(status) = err.reject_status() {
                    debug!(%status, "rejecting malformed request: {}", err);
                    write_reject(&mut io, status, idle).await;
                } else {
                    debug!("connection failed reading head: {}", err);
                }
                break;
            }
        };

        match exchange(&mut io, head, &mut params).await {
            Next::KeepAlive => continue,
            Next::Close => break,
            Next::Upgrade(tx) => {
                let (io, leftover) = io.into_parts();
                let _ = tx.send(Upgraded::new(Box::new(io), leftover));
                return;
            }
        }
    }

    let _ = io.shutdown().await;
}

/// Reads and parses the next request head, policing the idle deadline and
/// the engine shutdown signal while the connection has nothing in flight.
async fn read_head<T>(
    io: &mut Buffered<T>,
    parse_config: &ParseConfig,
    idle: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> HeadOutcome
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    if *shutdown.borrow() {
        return HeadOutcome::Shutdown;
    }
    let deadline = sleep(idle);
    tokio::pin!(deadline);

    loop {
        match parse_request(io.read_buf(), parse_config) {
            Ok(Some(head)) => return HeadOutcome::Head(head),
            Ok(None) => {}
            Err(err) => return HeadOutcome::Fatal(err),
        }

        tokio::select! {
            res = io.fill() => match res {
                Ok(0) => {
                    return if io.has_buffered() {
                        HeadOutcome::Fatal(crate::Error::new_incomplete())
                    } else {
                        HeadOutcome::Eof
                    };
                }
                Ok(_) => {}
                Err(err) => {
                    debug!("read error while parsing head: {}", err);
                    return HeadOutcome::Eof;
                }
            },
            _ = &mut deadline => return HeadOutcome::TimedOut,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return HeadOutcome::Shutdown;
                }
            }
        }
    }
}

/// Best-effort error response for requests that never become a Context.
async fn write_reject<T>(io: &mut Buffered<T>, status: StatusCode, idle: Duration)
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let head = ResponseHead {
        status,
        reason: None,
        headers: HeaderMap::new(),
        keep_alive: false,
        encode: EncodeKind::Empty,
    };
    let mut buf = Vec::new();
    Encoder::encode_head(&mut buf, &head, false, Version::HTTP_11, None);
    if timeout(idle, io.write_all(&buf)).await.is_ok() {
        let _ = io.flush().await;
    }
}

#[derive(PartialEq)]
enum BodyPhase {
    /// `Expect: 100-continue` — wait for the reader before touching the
    /// wire body.
    AwaitDemand,
    Pumping,
    /// The reader was dropped; stop pumping, leave wire bytes unread.
    Abandoned,
}

/// Runs one request/response exchange to completion.
async fn exchange<T>(
    io: &mut Buffered<T>,
    head: super::RequestHead,
    params: &mut ConnParams,
) -> Next
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let config = &params.config;
    let idle = config.idle_connection_timeout;
    let version = head.version;
    let method = head.method.clone();
    let expect_continue = head.expect_continue;
    let mut keep_alive = head.keep_alive;

    let mut decoder = match head.body_len {
        BodyLength::Known(len) => Decoder::length(len),
        BodyLength::Chunked => Decoder::chunked(config.max_headers_bytes),
        BodyLength::Empty => Decoder::empty(),
    };

    let (body_sender, body_reader) = body_channel();
    let mut body_tx = body_sender.tx;
    let mut demand_rx = body_sender.demand_rx;
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(0);
    let (abort_tx, abort_rx) = watch::channel(false);
    let (bytes_in, bytes_out) = io.counters();

    let request = Request {
        method: method.clone(),
        raw_path: head.raw_path,
        version,
        headers: head.headers,
        content_length: match head.body_len {
            BodyLength::Known(len) => Some(len),
            _ => None,
        },
        trace_id: Uuid::new_v4(),
        remote_addr: params.remote_addr,
        local_addr: params.local_addr,
        is_secure: params.is_secure,
        client_certificate: params.client_certificate.clone(),
        body: body_reader,
        merge_trailers: config.allow_trailer_merge,
    };
    let response = Response::new(cmd_tx, version);
    let context = Context {
        request,
        response,
        abort_rx,
        bytes_in,
        bytes_out,
    };

    // Backpressure point: a full queue suspends this worker, which stops
    // it from reading more requests off this socket.
    tokio::select! {
        res = params.queue.send(context) => {
            if res.is_err() {
                trace!("context queue closed, dropping connection");
                return Next::Close;
            }
        }
        _ = shutdown_signal(&mut params.shutdown) => return Next::Close,
    }

    let mut body_phase = if expect_continue {
        BodyPhase::AwaitDemand
    } else {
        BodyPhase::Pumping
    };
    let mut pending: Option<BodyFrame> = None;
    let mut wire_done = false;
    let mut encoder: Option<Encoder> = None;
    let mut head_written = false;
    let mut continue_written = false;
    let mut response_done = false;
    let mut force_close = false;
    let mut aborted = false;

    let mut grace_armed = *params.shutdown.borrow();
    if grace_armed {
        keep_alive = false;
    }
    let grace_sleep = sleep(config.shutdown_grace);
    tokio::pin!(grace_sleep);

    let deadline = sleep(idle);
    tokio::pin!(deadline);

    while !response_done {
        // decode whatever is already buffered before touching the socket
        if body_phase == BodyPhase::Pumping && pending.is_none() && !wire_done {
            match decoder.decode(io.read_buf()) {
                Ok(Some(Decoded::Data(data))) => pending = Some(BodyFrame::Data(data)),
                Ok(Some(Decoded::Complete(trailers))) => {
                    wire_done = true;
                    let trailers = if config.allow_trailer_merge {
                        trailers
                    } else {
                        None
                    };
                    pending = Some(BodyFrame::End { trailers });
                }
                Ok(None) => {}
                Err(err) => {
                    debug!("malformed request body: {}", err);
                    aborted = true;
                    force_close = true;
                    break;
                }
            }
        }
        let want_fill = body_phase == BodyPhase::Pumping && pending.is_none() && !wire_done;

        tokio::select! {
            biased;

            cmd = cmd_rx.next() => {
                match handle_command(
                    io,
                    cmd,
                    &mut encoder,
                    &mut head_written,
                    &mut keep_alive,
                    &mut force_close,
                    &mut response_done,
                    version,
                    &method,
                    config,
                    grace_armed,
                ).await {
                    Ok(None) => {}
                    Ok(Some(upgrade_tx)) => return Next::Upgrade(upgrade_tx),
                    Err(err) => {
                        debug!("write error mid-response: {}", err);
                        aborted = true;
                        force_close = true;
                        break;
                    }
                }
                deadline.as_mut().reset(Instant::now() + idle);
            }

            res = poll_fn(|cx| body_tx.poll_ready(cx)), if pending.is_some() => {
                match res {
                    Ok(()) => {
                        let frame = pending.take().expect("pending frame");
                        let was_end = matches!(frame, BodyFrame::End { .. });
                        if body_tx.start_send(frame).is_err() {
                            body_phase = BodyPhase::Abandoned;
                        } else if was_end {
                            body_phase = BodyPhase::Abandoned;
                        }
                    }
                    Err(_) => {
                        trace!("body reader dropped, abandoning body pump");
                        pending = None;
                        body_phase = BodyPhase::Abandoned;
                    }
                }
                deadline.as_mut().reset(Instant::now() + idle);
            }

            demanded = &mut demand_rx, if body_phase == BodyPhase::AwaitDemand => {
                match demanded {
                    Ok(()) => {
                        if expect_continue && !continue_written && !head_written {
                            trace!("answering 100-continue before body read");
                            continue_written = true;
                            if write_wire(io, CONTINUE_LINE, idle).await.is_err() {
                                aborted = true;
                                force_close = true;
                                break;
                            }
                        }
                        body_phase = BodyPhase::Pumping;
                    }
                    // the reader is gone; the body stays unread on the wire
                    Err(_) => body_phase = BodyPhase::Abandoned,
                }
                deadline.as_mut().reset(Instant::now() + idle);
            }

            res = io.fill(), if want_fill => {
                match res {
                    Ok(0) => {
                        debug!("peer disconnected mid-body");
                        aborted = true;
                        force_close = true;
                        break;
                    }
                    Ok(_) => {
                        deadline.as_mut().reset(Instant::now() + idle);
                    }
                    Err(err) => {
                        debug!("read error mid-body: {}", err);
                        aborted = true;
                        force_close = true;
                        break;
                    }
                }
            }

            _ = shutdown_signal(&mut params.shutdown), if !grace_armed => {
                trace!("engine stopping, granting in-flight exchange its grace");
                keep_alive = false;
                grace_armed = true;
                grace_sleep.as_mut().reset(Instant::now() + config.shutdown_grace);
            }

            _ = &mut grace_sleep, if grace_armed => {
                debug!("shutdown grace elapsed, aborting exchange");
                aborted = true;
                force_close = true;
                break;
            }

            _ = &mut deadline => {
                debug!("exchange timed out");
                aborted = true;
                force_close = true;
                break;
            }
        }
    }

    if aborted {
        let _ = abort_tx.send(true);
        return Next::Close;
    }

    let close_delimited = encoder.as_ref().is_some_and(Encoder::is_close_delimited);
    if keep_alive && wire_done && !force_close && !close_delimited && !*params.shutdown.borrow() {
        Next::KeepAlive
    } else {
        Next::Close
    }
}

/// Applies one response command to the wire.
///
/// Returns the upgrade sender when the application switched protocols.
#[allow(clippy::too_many_arguments)]
async fn handle_command<T>(
    io: &mut Buffered<T>,
    cmd: Option<Command>,
    encoder: &mut Option<Encoder>,
    head_written: &mut bool,
    keep_alive: &mut bool,
    force_close: &mut bool,
    response_done: &mut bool,
    version: Version,
    method: &Method,
    config: &ServerConfig,
    shutting_down: bool,
) -> std::io::Result<Option<futures_channel::oneshot::Sender<Upgraded>>>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let idle = config.idle_connection_timeout;
    match cmd {
        Some(Command::Head(head)) => {
            apply_head_policy(&head, keep_alive, config, shutting_down);
            let mut buf = Vec::new();
            Encoder::encode_head(&mut buf, &head, *keep_alive, version, config.server_header.as_deref());
            *encoder = Some(Encoder::new(head.encode, suppress_body(method, head.status)));
            *head_written = true;
            write_wire(io, &buf, idle).await?;
        }
        Some(Command::Data(data)) => {
            let encoder = encoder.as_mut().expect("data before head");
            let mut buf = Vec::new();
            encoder.encode_data(&mut buf, &data);
            if !buf.is_empty() {
                write_wire(io, &buf, idle).await?;
            }
        }
        Some(Command::End) => {
            let encoder = encoder.as_mut().expect("end before head");
            let mut buf = Vec::new();
            if encoder.end(&mut buf).is_err() {
                debug!("response underflowed its content-length, closing");
                *force_close = true;
            }
            if !buf.is_empty() {
                write_wire(io, &buf, idle).await?;
            }
            *response_done = true;
        }
        Some(Command::Full(head, body)) => {
            apply_head_policy(&head, keep_alive, config, shutting_down);
            let mut buf = Vec::new();
            Encoder::encode_head(&mut buf, &head, *keep_alive, version, config.server_header.as_deref());
            let mut enc = Encoder::new(head.encode, suppress_body(method, head.status));
            if !body.is_empty() {
                enc.encode_data(&mut buf, &body);
            }
            if enc.end(&mut buf).is_err() {
                *force_close = true;
            }
            *encoder = Some(enc);
            *head_written = true;
            write_wire(io, &buf, idle).await?;
            *response_done = true;
        }
        Some(Command::Abort) => {
            debug!("application aborted the response");
            *force_close = true;
            *response_done = true;
        }
        Some(Command::Upgrade(head, tx)) => {
            let mut buf = Vec::new();
            Encoder::encode_head(&mut buf, &head, true, version, config.server_header.as_deref());
            write_wire(io, &buf, idle).await?;
            return Ok(Some(tx));
        }
        None => {
            // The application dropped the context without completing it.
            if !*head_written {
                debug!("context dropped before a response, emitting 500");
                let head = ResponseHead {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    reason: None,
                    headers: HeaderMap::new(),
                    keep_alive: *keep_alive,
                    encode: EncodeKind::Empty,
                };
                apply_head_policy(&head, keep_alive, config, shutting_down);
                let mut buf = Vec::new();
                Encoder::encode_head(&mut buf, &head, *keep_alive, version, config.server_header.as_deref());
                *head_written = true;
                write_wire(io, &buf, idle).await?;
            } else if !*response_done {
                debug!("context dropped mid-body, force closing");
                *force_close = true;
            }
            *response_done = true;
        }
    }
    Ok(None)
}

fn apply_head_policy(
    head: &ResponseHead,
    keep_alive: &mut bool,
    config: &ServerConfig,
    shutting_down: bool,
) {
    if !head.keep_alive
        || shutting_down
        || head.encode == EncodeKind::CloseDelimited
        || (config.close_on_server_errors && head.status.is_server_error())
    {
        *keep_alive = false;
    }
}

fn suppress_body(method: &Method, status: StatusCode) -> bool {
    method == Method::HEAD || !can_have_body(status)
}

/// Writes and flushes under the write deadline. The flush matters for
/// buffering transports (TLS); on plain TCP it is a no-op.
async fn write_wire<T>(io: &mut Buffered<T>, buf: &[u8], idle: Duration) -> std::io::Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let write = async {
        io.write_all(buf).await?;
        io.flush().await
    };
    match timeout(idle, write).await {
        Ok(res) => res,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "write deadline elapsed",
        )),
    }
}

async fn shutdown_signal(shutdown: &mut watch::Receiver<bool>) {
    if *shutdown.borrow() {
        return;
    }
    loop {
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
        if *shutdown.borrow() {
            return;
        }
    }
}
