//! Backend resolution and connection.
//!
//! A backend is either a literal host dialed over the network, or a rack
//! workload reached through a tunnel:
//! - services: list the live processes, pick one uniformly at random, open a
//!   process tunnel to the requested port
//! - resources: open a resource tunnel
//!
//! Rack tunnels are presented to forwarding code as an in-memory duplex pipe.
//! One end is returned to the caller; a relay task pumps the other end to the
//! tunnel until either side closes. Nothing is cached: every call resolves
//! afresh, so concurrent connections may land on different processes.
//!
//! There are no retries. An empty process list fails immediately.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use rackgate_rack::{Process, Rack, Tunnel};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, Instrument};
use url::Url;

use super::pump::pump;
use super::target::{is_rack_target, TargetDescriptor, TargetKind};
use crate::error::{Result, RouterError};

/// Default connect timeout for direct backend dials.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// In-memory pipe capacity between a caller and its tunnel relay.
const TUNNEL_BUFFER: usize = 64 * 1024;

/// A connection to a backend, whatever carries it.
pub enum BackendStream {
    /// Direct TCP connection.
    Tcp(TcpStream),
    /// Local end of a pipe relayed to a rack tunnel.
    Tunnel(DuplexStream),
    /// TLS session over another backend stream.
    Tls(Box<tokio_rustls::client::TlsStream<BackendStream>>),
}

impl std::fmt::Debug for BackendStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendStream::Tcp(s) => f.debug_tuple("Tcp").field(&s.peer_addr().ok()).finish(),
            BackendStream::Tunnel(_) => f.write_str("Tunnel"),
            BackendStream::Tls(_) => f.write_str("Tls"),
        }
    }
}

impl AsyncRead for BackendStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            BackendStream::Tunnel(s) => Pin::new(s).poll_read(cx, buf),
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BackendStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            BackendStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            BackendStream::Tunnel(s) => Pin::new(s).poll_write(cx, buf),
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            BackendStream::Tunnel(s) => Pin::new(s).poll_flush(cx),
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            BackendStream::Tunnel(s) => Pin::new(s).poll_shutdown(cx),
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Pick one process uniformly at random.
pub fn select_instance<'a, R>(instances: &'a [Process], rng: &mut R) -> Option<&'a Process>
where
    R: Rng + ?Sized,
{
    if instances.is_empty() {
        return None;
    }
    Some(&instances[rng.random_range(0..instances.len())])
}

/// Format `host:port` for a URL, bracketing IPv6 hosts.
pub fn target_addr(url: &Url) -> Result<String> {
    let host = url
        .host()
        .ok_or_else(|| RouterError::DialFailure {
            addr: url.to_string(),
            detail: "missing host".to_string(),
        })?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| RouterError::DialFailure {
            addr: url.to_string(),
            detail: "missing port".to_string(),
        })?;
    Ok(format!("{}:{}", host, port))
}

/// Resolves targets to connected backend streams.
pub struct BackendResolver {
    rack: Arc<dyn Rack>,
    connect_timeout: Duration,
    idle_timeout: Option<Duration>,
    rng: Mutex<StdRng>,
}

impl BackendResolver {
    /// Create a resolver with an OS-seeded random source.
    pub fn new(rack: Arc<dyn Rack>) -> Self {
        Self::with_rng(rack, StdRng::from_os_rng())
    }

    /// Create a resolver with an explicit random source.
    pub fn with_rng(rack: Arc<dyn Rack>, rng: StdRng) -> Self {
        Self {
            rack,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: None,
            rng: Mutex::new(rng),
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Idle timeout applied to relays and pumps started for this resolver.
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Connect to a target URL: through the rack for rack-backed targets,
    /// directly otherwise.
    pub async fn connect(&self, target: &Url) -> Result<BackendStream> {
        if is_rack_target(target) {
            let descriptor = TargetDescriptor::from_url(target)?;
            self.resolve(&descriptor).await
        } else {
            self.dial(&target_addr(target)?).await
        }
    }

    /// Connect to a target URL and start a TLS session over the connection.
    pub async fn connect_tls(
        &self,
        target: &Url,
        connector: &TlsConnector,
        server_name: &str,
    ) -> Result<BackendStream> {
        let stream = self.connect(target).await?;
        let name = crate::tls::server_name(server_name)?;

        let tls = connector
            .connect(name, stream)
            .await
            .map_err(|e| RouterError::HandshakeFailure(format!("tls: {}", e)))?;

        Ok(BackendStream::Tls(Box::new(tls)))
    }

    /// Dial a literal `host:port`.
    pub async fn dial(&self, addr: &str) -> Result<BackendStream> {
        debug!(backend_addr = %addr, "Connecting to backend");

        let failure = |detail: String| RouterError::DialFailure {
            addr: addr.to_string(),
            detail,
        };

        let stream = match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(failure(e.to_string())),
            Err(_) => return Err(failure("connect timeout".to_string())),
        };
        let _ = stream.set_nodelay(true);

        Ok(BackendStream::Tcp(stream))
    }

    /// Resolve a rack-backed target to a tunnel.
    pub async fn resolve(&self, target: &TargetDescriptor) -> Result<BackendStream> {
        let tunnel = match target.kind {
            TargetKind::Service => {
                let port = target.port.ok_or_else(|| {
                    crate::proxy::TargetError::MalformedInstanceSelector {
                        kind: target.kind.to_string(),
                        selector: target.name.clone(),
                    }
                })?;

                let processes = self
                    .rack
                    .process_list(&target.app, &target.name)
                    .await
                    .map_err(RouterError::Rack)?;

                let process = {
                    let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
                    select_instance(&processes, &mut *rng).cloned()
                };

                let Some(process) = process else {
                    return Err(RouterError::NoInstancesAvailable {
                        app: target.app.clone(),
                        service: target.name.clone(),
                    });
                };

                debug!(
                    app = %target.app,
                    service = %target.name,
                    process_id = %process.id,
                    candidates = processes.len(),
                    port = port,
                    "Selected process"
                );

                self.rack
                    .process_tunnel(&target.app, &process.id, port)
                    .await
                    .map_err(RouterError::TunnelFailure)?
            }
            TargetKind::Resource => self
                .rack
                .resource_tunnel(&target.app, &target.name)
                .await
                .map_err(RouterError::TunnelFailure)?,
        };

        Ok(BackendStream::Tunnel(self.relay(tunnel, target)))
    }

    /// Bridge a tunnel to an in-memory pipe and return the caller's end.
    fn relay(&self, tunnel: Tunnel, target: &TargetDescriptor) -> DuplexStream {
        let (local, remote) = tokio::io::duplex(TUNNEL_BUFFER);
        let idle_timeout = self.idle_timeout;

        tokio::spawn(
            async move {
                match pump(remote, tunnel, idle_timeout).await {
                    Ok(stats) => debug!(
                        bytes_to_tunnel = stats.to_b,
                        bytes_from_tunnel = stats.from_b,
                        "Tunnel closed"
                    ),
                    Err(e) => debug!(
                        bytes_to_tunnel = e.stats.to_b,
                        bytes_from_tunnel = e.stats.from_b,
                        error = %e,
                        "Tunnel relay error"
                    ),
                }
            }
            .instrument(tracing::debug_span!(
                "tunnel",
                app = %target.app,
                kind = %target.kind,
                name = %target.name
            )),
        );

        local
    }
}
