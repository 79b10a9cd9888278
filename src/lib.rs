#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(rust_2018_idioms))]

//! # cadente
//!
//! cadente is an embeddable HTTP/1.1 server **engine**: it accepts TCP (and
//! optionally TLS) connections, parses requests, and hands each exchange to
//! the application as a [`Context`] pulled from a bounded queue.
//!
//! ## Design
//!
//! - One task per connection; requests on a connection are served strictly
//!   in arrival order.
//! - Request and response bodies stream — `Content-Length` and chunked
//!   transfer are enforced at the engine layer, including trailers.
//! - [`Context::accept_websocket`] performs the RFC 6455 handshake and
//!   relinquishes the connection as a framed [`ws::WebSocket`] channel.
//! - Routing, body interpretation, authentication and the like are layers
//!   *above* this crate; they consume only [`Engine::get_context`] and the
//!   [`Context`] surface.
//!
//! ## Example
//!
//! ```no_run
//! use cadente::{Endpoint, Engine, ServerConfig};
//!
//! # async fn run() -> cadente::Result<()> {
//! let engine = Engine::new(ServerConfig {
//!     endpoints: vec![Endpoint::http("127.0.0.1", 8080)],
//!     ..ServerConfig::default()
//! });
//! engine.start().await?;
//!
//! loop {
//!     let mut ctx = engine.get_context().await?;
//!     ctx.response_mut().send_full("Hello").await?;
//! }
//! # }
//! ```

mod body;
mod common;
mod config;
mod context;
mod engine;
mod error;
mod proto;
mod queue;
mod request;
mod response;
mod server;
mod upgrade;
pub mod ws;

pub use crate::body::BodyReader;
pub use crate::config::{
    ClientCertPolicy, Endpoint, Scheme, ServerConfig, TlsOptions, DEFAULT_IDLE_TIMEOUT,
};
pub use crate::context::{AbortSignal, Context};
pub use crate::engine::Engine;
pub use crate::error::{Error, Result};
pub use crate::request::Request;
pub use crate::response::Response;
pub use crate::upgrade::Upgraded;

// The HTTP vocabulary types are the `http` crate's; re-exported so
// embedders do not need a direct dependency to speak to the engine.
pub use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
