//! The engine facade.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tracing::{debug, trace};

use crate::config::{Endpoint, ServerConfig};
use crate::context::Context;
use crate::queue::{self, QueueReceiver, QueueSender};
use crate::server::listener::Listener;
use crate::server::shutdown::Shutdown;
use crate::server::tls;

type Handler =
    Arc<dyn Fn(Context) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync + 'static>;

/// An embeddable HTTP/1.1 server engine.
///
/// The engine is an ordinary value with an explicit lifecycle: configure,
/// [`start`](Engine::start), consume contexts, [`stop`](Engine::stop).
/// Contexts are consumed either by awaiting
/// [`get_context`](Engine::get_context) in a loop, or by installing a
/// handler before start. Cloning shares the same engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<ServerConfig>,
    endpoints: std::sync::Mutex<Vec<Endpoint>>,
    queue_tx: QueueSender,
    queue_rx: QueueReceiver,
    shutdown_rx: watch::Receiver<bool>,
    state: Mutex<State>,
    handler: std::sync::Mutex<Option<Handler>>,
}

struct State {
    phase: Phase,
    shutdown: Shutdown,
    local_addrs: Vec<SocketAddr>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Phase {
    Idle,
    Running,
    Stopped,
}

impl Engine {
    pub fn new(config: ServerConfig) -> Engine {
        let (queue_tx, queue_rx) = queue::channel(config.queue_capacity());
        let shutdown = Shutdown::new();
        let endpoints = config.endpoints.clone();
        Engine {
            inner: Arc::new(Inner {
                config: Arc::new(config),
                endpoints: std::sync::Mutex::new(endpoints),
                queue_tx,
                queue_rx,
                shutdown_rx: shutdown.subscribe(),
                state: Mutex::new(State {
                    phase: Phase::Idle,
                    shutdown,
                    local_addrs: Vec::new(),
                }),
                handler: std::sync::Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Replaces the set of listening endpoints. Only valid before `start`.
    pub async fn set_listening_endpoints(&self, endpoints: Vec<Endpoint>) -> crate::Result<()> {
        let state = self.inner.state.lock().await;
        if state.phase != Phase::Idle {
            return Err(crate::Error::new_listen(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "listening endpoints can only change before start",
            )));
        }
        *self.inner.endpoints.lock().unwrap() = endpoints;
        Ok(())
    }

    /// Installs a dispatch function invoked on its own task per context.
    ///
    /// Optional — callers may prefer pulling contexts with
    /// [`get_context`](Engine::get_context). Takes effect at `start`.
    pub fn set_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |ctx| Box::pin(handler(ctx)));
        *self.inner.handler.lock().unwrap() = Some(handler);
    }

    /// Resolves and binds every configured endpoint, then starts
    /// accepting. Idempotent; a second call is a no-op.
    pub async fn start(&self) -> crate::Result<()> {
        let mut state = self.inner.state.lock().await;
        match state.phase {
            Phase::Running | Phase::Stopped => return Ok(()),
            Phase::Idle => {}
        }

        let tls_acceptor = match self.inner.config.tls.as_ref() {
            Some(options) => Some(tls::build_acceptor(options)?),
            None => None,
        };

        let endpoints = self.inner.endpoints.lock().unwrap().clone();
        let mut listeners = Vec::with_capacity(endpoints.len());
        for endpoint in &endpoints {
            let listener = Listener::bind(
                endpoint,
                tls_acceptor.clone(),
                self.inner.config.clone(),
                self.inner.queue_tx.clone(),
            )
            .await?;
            listeners.push(listener);
        }

        state.local_addrs = listeners.iter().map(Listener::local_addr).collect();
        for listener in listeners {
            let watcher = state.shutdown.watcher();
            tokio::spawn(listener.run(watcher));
        }

        let handler = self.inner.handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            let engine = self.clone();
            let watcher = state.shutdown.watcher();
            tokio::spawn(async move {
                trace!("handler dispatch loop started");
                loop {
                    match engine.get_context().await {
                        Ok(context) => {
                            tokio::spawn(handler(context));
                        }
                        Err(err) => {
                            debug!("handler dispatch loop ending: {}", err);
                            break;
                        }
                    }
                }
                drop(watcher);
            });
        }

        state.phase = Phase::Running;
        Ok(())
    }

    /// The addresses actually bound, in endpoint order. Useful when an
    /// endpoint was configured with port 0.
    pub async fn local_addrs(&self) -> Vec<SocketAddr> {
        self.inner.state.lock().await.local_addrs.clone()
    }

    /// Suspends until the next context is available.
    ///
    /// Fails with a cancellation error — distinguishable via
    /// [`Error::is_canceled`](crate::Error::is_canceled) — once the engine
    /// stops.
    pub async fn get_context(&self) -> crate::Result<Context> {
        let mut shutdown = self.inner.shutdown_rx.clone();
        tokio::select! {
            biased;
            context = self.inner.queue_rx.recv() => {
                context.ok_or_else(crate::Error::new_canceled)
            }
            _ = wait_true(&mut shutdown) => Err(crate::Error::new_canceled()),
        }
    }

    /// Stops accepting, waits for in-flight exchanges (bounded by the
    /// configured grace period), then returns. Idempotent; calling before
    /// `start` is a no-op.
    pub async fn stop(&self) {
        let mut state = self.inner.state.lock().await;
        if state.phase != Phase::Running {
            state.phase = Phase::Stopped;
            return;
        }
        state.phase = Phase::Stopped;
        trace!("engine stopping");
        state.shutdown.shutdown().await;
        self.inner.queue_rx.close().await;
        trace!("engine stopped");
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("endpoints", &self.inner.config.endpoints)
            .finish()
    }
}

async fn wait_true(signal: &mut watch::Receiver<bool>) {
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
