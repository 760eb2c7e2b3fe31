//! Rack capability boundary.
//!
//! The router never talks to the control plane directly. Everything it needs
//! from "the rack" goes through the [`Rack`] trait:
//! - listing the live processes of a service
//! - opening a byte tunnel to one process's port
//! - opening a byte tunnel to a named resource
//!
//! Implementations must be safe to call concurrently from many connections.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

mod error;
mod local;

pub use error::RackError;
pub use local::{LocalApp, LocalProcess, LocalRack};

/// A live process as reported by the rack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    /// Process ID, unique within the app.
    pub id: String,
    /// App the process belongs to.
    pub app: String,
    /// Service the process runs.
    pub service: String,
}

/// Any bidirectional byte stream a tunnel can be backed by.
pub trait TunnelIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> TunnelIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// An open tunnel to a process port or resource.
pub type Tunnel = Box<dyn TunnelIo>;

/// Control-plane operations consumed by the router.
#[async_trait]
pub trait Rack: Send + Sync {
    /// List the live processes of `service` in `app`. An empty list is not an error.
    async fn process_list(&self, app: &str, service: &str) -> Result<Vec<Process>, RackError>;

    /// Open a tunnel to `port` on process `pid` of `app`.
    async fn process_tunnel(&self, app: &str, pid: &str, port: u16) -> Result<Tunnel, RackError>;

    /// Open a tunnel to resource `resource` of `app`.
    async fn resource_tunnel(&self, app: &str, resource: &str) -> Result<Tunnel, RackError>;
}
