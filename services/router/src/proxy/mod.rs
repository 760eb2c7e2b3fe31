//! Proxy and endpoint implementation.
//!
//! This module provides:
//! - Endpoints owning proxies keyed by listen port
//! - Proxy listeners for `http`, `https`, `tcp` and `tls`
//! - Target path parsing and backend resolution through the rack
//! - HTTP, WebSocket and raw TCP forwarding
//!
//! ## Architecture
//!
//! ```text
//! Client -> ProxyListener -> [TLS] -> HttpForwarder ----> BackendResolver -> Rack tunnel
//!                                  \-> WebSocketForwarder /                \-> direct dial
//!                                  \-> TcpForwarder -----/
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use rackgate_router::proxy::{BackendResolver, Endpoint, ProxySettings};
//!
//! let resolver = Arc::new(BackendResolver::new(rack));
//! let endpoint = Endpoint::new("app.example.test", resolver, authority, ProxySettings::default());
//! let proxy = endpoint.create_proxy(listen, target)?;
//! proxy.serve().await?;
//! ```

mod backend;
mod endpoint;
mod headers;
mod http;
mod listener;
mod pump;
mod target;
mod tcp;
mod websocket;

pub use backend::{select_instance, target_addr, BackendResolver, BackendStream};
pub use endpoint::Endpoint;
pub use headers::{Forwarded, HeaderFilter};
pub use http::{is_websocket_upgrade, BackendTransport, HttpForwarder, LoggedTransport, ProxyBody, RoundTrip};
pub use listener::{
    ListenScheme, ListenerStats, Proxy, ProxyListener, ProxySettings, DEFAULT_MAX_CONNECTIONS,
};
pub use pump::{pump, Direction, PumpError, PumpStats};
pub use target::{is_rack_target, TargetDescriptor, TargetError, TargetKind, RACK_HOST};
pub use tcp::TcpForwarder;
pub use websocket::WebSocketForwarder;
