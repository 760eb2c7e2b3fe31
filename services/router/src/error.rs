//! Error types for the router.

use rackgate_rack::RackError;
use thiserror::Error;

use crate::proxy::TargetError;

/// Router errors with standardized reason codes.
#[derive(Debug, Error)]
pub enum RouterError {
    /// A proxy already listens on this port within the endpoint.
    #[error("proxy already exists for port: {0}")]
    PortConflict(u16),

    /// Listen URL has no numeric port.
    #[error("invalid listen port in {0}")]
    InvalidListenPort(String),

    /// Listen scheme is not http, https, tcp or tls.
    #[error("unknown listener scheme: {0}")]
    UnsupportedScheme(String),

    /// An endpoint already exists for this host.
    #[error("endpoint already exists for host: {0}")]
    EndpointExists(String),

    /// The owning endpoint was dropped while a proxy still referenced it.
    #[error("endpoint for proxy {0} is gone")]
    EndpointGone(String),

    /// Target path could not be parsed.
    #[error("invalid target: {0}")]
    Target(#[from] TargetError),

    /// The rack listed no live processes for the service.
    #[error("no processes available for service: {app}/{service}")]
    NoInstancesAvailable { app: String, service: String },

    /// The rack could not open a tunnel.
    #[error("tunnel failed: {0}")]
    TunnelFailure(#[source] RackError),

    /// Any other rack failure (discovery).
    #[error("rack error: {0}")]
    Rack(#[source] RackError),

    /// Direct dial to the target host failed.
    #[error("dial {addr} failed: {detail}")]
    DialFailure { addr: String, detail: String },

    /// Inbound WebSocket upgrade request was unusable.
    #[error("websocket upgrade failed: {0}")]
    UpgradeFailure(String),

    /// Outbound HTTP or WebSocket handshake with the backend failed.
    #[error("backend handshake failed: {0}")]
    HandshakeFailure(String),

    /// No certificate could be issued for the endpoint host.
    #[error("certificate issuance failed for {host}: {detail}")]
    CertificateIssuanceFailure { host: String, detail: String },

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RouterError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            RouterError::PortConflict(_) => "port_conflict",
            RouterError::InvalidListenPort(_) => "invalid_listen_port",
            RouterError::UnsupportedScheme(_) => "unsupported_scheme",
            RouterError::EndpointExists(_) => "endpoint_exists",
            RouterError::EndpointGone(_) => "endpoint_gone",
            RouterError::Target(e) => e.reason_code(),
            RouterError::NoInstancesAvailable { .. } => "no_instances_available",
            RouterError::TunnelFailure(_) => "tunnel_failure",
            RouterError::Rack(_) => "rack_error",
            RouterError::DialFailure { .. } => "dial_failure",
            RouterError::UpgradeFailure(_) => "upgrade_failure",
            RouterError::HandshakeFailure(_) => "handshake_failure",
            RouterError::CertificateIssuanceFailure { .. } => "certificate_issuance_failure",
            RouterError::Io(_) => "io_error",
        }
    }
}

pub type Result<T, E = RouterError> = std::result::Result<T, E>;
