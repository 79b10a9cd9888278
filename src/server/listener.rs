//! Accept loops, one task per configured endpoint.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, trace};

use crate::config::{Endpoint, Scheme, ServerConfig};
use crate::proto::h1::conn::{self, ConnParams};
use crate::queue::QueueSender;
use crate::server::shutdown::Watcher;

/// A bound socket on one endpoint, not yet accepting.
pub(crate) struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
    is_secure: bool,
    tls: Option<TlsAcceptor>,
    config: Arc<ServerConfig>,
    queue: QueueSender,
}

impl Listener {
    /// Resolves the endpoint host (first successful address wins) and
    /// binds it. Resolution and bind failures are fatal start errors.
    pub(crate) async fn bind(
        endpoint: &Endpoint,
        tls: Option<TlsAcceptor>,
        config: Arc<ServerConfig>,
        queue: QueueSender,
    ) -> crate::Result<Listener> {
        let is_secure = endpoint.scheme == Scheme::Https;
        if is_secure && tls.is_none() {
            return Err(crate::Error::new_listen(io::Error::new(
                io::ErrorKind::InvalidInput,
                "https endpoint configured without tls options",
            )));
        }

        let authority = endpoint.authority();
        let mut addrs = lookup_host(&authority)
            .await
            .map_err(crate::Error::new_listen)?;
        let addr = addrs.next().ok_or_else(|| {
            crate::Error::new_listen(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address found for {}", authority),
            ))
        })?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(crate::Error::new_listen)?;
        let local_addr = listener.local_addr().map_err(crate::Error::new_listen)?;
        trace!(%local_addr, "listener bound");

        Ok(Listener {
            listener,
            local_addr,
            is_secure,
            tls: if is_secure { tls } else { None },
            config,
            queue,
        })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts until the engine stops. Connection-level accept errors are
    /// skipped; resource errors (EMFILE and friends) are logged and
    /// retried after a one-second sleep instead of spinning.
    pub(crate) async fn run(self, watcher: Watcher) {
        let mut signal = watcher.signal.clone();
        loop {
            let accepted = tokio::select! {
                res = self.listener.accept() => res,
                _ = wait_for_signal(&mut signal) => {
                    trace!(addr = %self.local_addr, "listener stopping");
                    return;
                }
            };

            match accepted {
                Ok((socket, remote_addr)) => {
                    self.configure_socket(&socket);
                    let local_addr = self.local_addr;
                    let config = self.config.clone();
                    let queue = self.queue.clone();
                    let tls = self.tls.clone();
                    let is_secure = self.is_secure;
                    let conn_watcher = watcher.clone();
                    tokio::spawn(async move {
                        handle_connection(
                            socket,
                            remote_addr,
                            local_addr,
                            is_secure,
                            tls,
                            config,
                            queue,
                            conn_watcher,
                        )
                        .await;
                    });
                }
                Err(err) => {
                    if is_connection_error(&err) {
                        debug!("accepted connection already errored: {}", err);
                        continue;
                    }
                    error!("accept error: {}", err);
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        _ = wait_for_signal(&mut signal) => return,
                    }
                }
            }
        }
    }

    fn configure_socket(&self, socket: &TcpStream) {
        if let Err(err) = socket.set_nodelay(self.config.tcp_nodelay) {
            trace!("error trying to set TCP nodelay: {}", err);
        }
        if let Some(time) = self.config.tcp_keepalive {
            let keepalive = TcpKeepalive::new().with_time(time);
            let sock_ref = SockRef::from(socket);
            if let Err(err) = sock_ref.set_tcp_keepalive(&keepalive) {
                trace!("error trying to set TCP keepalive: {}", err);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_connection(
    socket: TcpStream,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    is_secure: bool,
    tls: Option<TlsAcceptor>,
    config: Arc<ServerConfig>,
    queue: QueueSender,
    watcher: Watcher,
) {
    let handshake_deadline = config.idle_connection_timeout;
    let mut params = ConnParams {
        config,
        queue,
        shutdown: watcher.signal.clone(),
        remote_addr,
        local_addr,
        is_secure,
        client_certificate: None,
    };

    match tls {
        Some(acceptor) => {
            let stream = match timeout(handshake_deadline, acceptor.accept(socket)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => {
                    debug!(%remote_addr, "TLS handshake failed: {}", err);
                    return;
                }
                Err(_) => {
                    debug!(%remote_addr, "TLS handshake timed out");
                    return;
                }
            };
            params.client_certificate = stream
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|certs| certs.first().cloned());
            conn::serve(stream, params).await;
        }
        None => conn::serve(socket, params).await,
    }
    drop(watcher);
}

/// Errors that concern only the connection that failed to accept; the next
/// accept may well succeed immediately.
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

async fn wait_for_signal(signal: &mut tokio::sync::watch::Receiver<bool>) {
    if *signal.borrow() {
        return;
    }
    loop {
        if signal.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
        if *signal.borrow() {
            return;
        }
    }
}
