//! Engine configuration.
//!
//! A [`ServerConfig`] is handed to [`Engine::new`](crate::Engine::new) and is
//! immutable once the engine has started. Every knob has a default chosen to
//! match common reverse-proxy-fronted deployments; the only field without a
//! usable default is the endpoint list.

use std::time::Duration;

use rustls_pki_types::{CertificateDer, CertificateRevocationListDer, PrivateKeyDer};

/// Default inactivity deadline for reads, writes and inter-request idling.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Default grace period granted to in-flight exchanges during `stop`.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Default cap on the request line, in bytes.
pub const DEFAULT_MAX_REQUEST_LINE_BYTES: usize = 8 * 1024;

/// Default cap on the complete message head, in bytes.
pub const DEFAULT_MAX_HEADERS_BYTES: usize = 64 * 1024;

/// Context-queue slots granted per unit of available parallelism.
const QUEUE_SLOTS_PER_CORE: usize = 512;

/// The transport scheme of one listening endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scheme {
    /// Plain TCP.
    Http,
    /// TCP wrapped in TLS; requires [`ServerConfig::tls`].
    Https,
}

/// One address the engine listens on.
///
/// The host may be an IP literal or a DNS name; names are resolved once, at
/// engine start, and the first address that resolves wins.
#[derive(Clone, Debug)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn http(host: impl Into<String>, port: u16) -> Endpoint {
        Endpoint {
            scheme: Scheme::Http,
            host: host.into(),
            port,
        }
    }

    pub fn https(host: impl Into<String>, port: u16) -> Endpoint {
        Endpoint {
            scheme: Scheme::Https,
            host: host.into(),
            port,
        }
    }

    pub(crate) fn authority(&self) -> String {
        if self.host.contains(':') {
            // bare IPv6 literal
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Client-certificate policy for TLS endpoints.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ClientCertPolicy {
    /// Never request a client certificate.
    #[default]
    None,
    /// Request one, but accept connections without it.
    Optional,
    /// Refuse handshakes that do not present a valid certificate.
    Required,
}

/// TLS material and policy shared by all `https` endpoints.
pub struct TlsOptions {
    /// Leaf certificate first, then intermediates.
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
    pub client_cert: ClientCertPolicy,
    /// Trust anchors used to verify client certificates. Required when
    /// `client_cert` is not `None`.
    pub client_ca_roots: Vec<CertificateDer<'static>>,
    /// Revocation lists checked during client-certificate verification.
    pub revocation_lists: Vec<CertificateRevocationListDer<'static>>,
}

impl TlsOptions {
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> TlsOptions {
        TlsOptions {
            cert_chain,
            private_key,
            client_cert: ClientCertPolicy::None,
            client_ca_roots: Vec::new(),
            revocation_lists: Vec::new(),
        }
    }
}

impl std::fmt::Debug for TlsOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsOptions")
            .field("cert_chain", &self.cert_chain.len())
            .field("client_cert", &self.client_cert)
            .finish()
    }
}

/// Complete engine configuration.
#[derive(Debug)]
pub struct ServerConfig {
    /// Endpoints to bind at start. At least one is required.
    pub endpoints: Vec<Endpoint>,
    /// Per-connection inactivity deadline, applied to reads, writes and the
    /// idle gap between keep-alive requests.
    pub idle_connection_timeout: Duration,
    /// Bound of the context queue. `None` sizes it to
    /// `512 × available_parallelism`.
    pub context_queue_capacity: Option<usize>,
    /// Tolerate bare LF line endings in message heads.
    pub accept_bare_lf: bool,
    /// Merge chunked-body trailers into the request headers once the body
    /// has been read to its end.
    pub allow_trailer_merge: bool,
    pub max_request_line_bytes: usize,
    pub max_headers_bytes: usize,
    /// Force `Connection: close` on responses with 5xx statuses.
    pub close_on_server_errors: bool,
    /// How long in-flight exchanges may run after `stop` before their
    /// contexts are aborted.
    pub shutdown_grace: Duration,
    pub tcp_nodelay: bool,
    /// TCP-level keepalive probe time for accepted sockets.
    pub tcp_keepalive: Option<Duration>,
    /// Advertised `Server` header; `None` sends none.
    pub server_header: Option<String>,
    pub tls: Option<TlsOptions>,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            endpoints: Vec::new(),
            idle_connection_timeout: DEFAULT_IDLE_TIMEOUT,
            context_queue_capacity: None,
            accept_bare_lf: false,
            allow_trailer_merge: false,
            max_request_line_bytes: DEFAULT_MAX_REQUEST_LINE_BYTES,
            max_headers_bytes: DEFAULT_MAX_HEADERS_BYTES,
            close_on_server_errors: false,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            tcp_nodelay: true,
            tcp_keepalive: None,
            server_header: None,
            tls: None,
        }
    }
}

impl ServerConfig {
    pub(crate) fn queue_capacity(&self) -> usize {
        self.context_queue_capacity
            .unwrap_or_else(|| {
                let cores = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1);
                cores * QUEUE_SLOTS_PER_CORE
            })
            .max(1)
    }
}
