pub mod config;
pub mod error;
pub mod proxy;
pub mod router;
pub mod tls;

pub use error::{Result, RouterError};
pub use proxy::{
    BackendResolver, Endpoint, HttpForwarder, ListenScheme, ListenerStats, Proxy, ProxyListener,
    ProxySettings, TargetDescriptor, TargetError, TargetKind, TcpForwarder, WebSocketForwarder,
};
pub use router::Router;
pub use tls::{CertificateIssuer, IssuedCertificate, LocalAuthority};
