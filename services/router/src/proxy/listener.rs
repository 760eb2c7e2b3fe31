//! Proxy lifecycle: construction, binding, and the accept loop.
//!
//! A [`Proxy`] is created (and its port reserved) by its [`Endpoint`]. `bind`
//! opens the socket, fetches the endpoint certificate for `https` and `tls`
//! listeners, and builds the forwarder for the listen scheme. `run` accepts
//! connections until the listener fails; each connection is handled in its own
//! task and its errors never reach the loop.

use std::convert::Infallible;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn, Instrument};
use url::Url;

use super::endpoint::Endpoint;
use super::http::HttpForwarder;
use super::tcp::TcpForwarder;
use crate::error::{Result, RouterError};
use crate::tls;

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Tunables shared by every proxy of a router.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Maximum concurrent connections per listener.
    pub max_connections: usize,
    /// Timeout for direct backend dials.
    pub connect_timeout: Duration,
    /// Idle timeout per pump direction. None disables it.
    pub idle_timeout: Option<Duration>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connect_timeout: super::backend::DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: None,
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Total connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Backend resolution or round trip failures.
    pub backend_failed: AtomicU64,
    /// Bytes proxied to backend (TCP listeners).
    pub bytes_to_backend: AtomicU64,
    /// Bytes proxied from backend (TCP listeners).
    pub bytes_from_backend: AtomicU64,
}

/// Supported listen schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenScheme {
    Http,
    Https,
    Tcp,
    Tls,
}

impl ListenScheme {
    pub fn parse(scheme: &str) -> Result<Self> {
        match scheme {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            "tcp" => Ok(Self::Tcp),
            "tls" => Ok(Self::Tls),
            other => Err(RouterError::UnsupportedScheme(other.to_string())),
        }
    }

    /// ALPN protocols to advertise, or None for plaintext listeners.
    fn alpn(&self) -> Option<&'static [&'static [u8]]> {
        match self {
            ListenScheme::Https => Some(tls::ALPN_HTTPS),
            ListenScheme::Tls => Some(tls::ALPN_NONE),
            ListenScheme::Http | ListenScheme::Tcp => None,
        }
    }
}

/// One listener forwarding to one target.
pub struct Proxy {
    listen: Url,
    target: Url,
    scheme: ListenScheme,
    port: u16,
    endpoint: Weak<Endpoint>,
}

impl Proxy {
    /// Validate a listen/target pair. Registration is the endpoint's job.
    pub(crate) fn new(endpoint: Weak<Endpoint>, listen: Url, target: Url) -> Result<Self> {
        let scheme = ListenScheme::parse(listen.scheme())?;
        let port = listen
            .port_or_known_default()
            .ok_or_else(|| RouterError::InvalidListenPort(listen.to_string()))?;

        Ok(Self {
            listen,
            target,
            scheme,
            port,
            endpoint,
        })
    }

    pub fn listen(&self) -> &Url {
        &self.listen
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    pub fn scheme(&self) -> ListenScheme {
        self.scheme
    }

    /// Listen port; the key of this proxy within its endpoint.
    pub fn port(&self) -> u16 {
        self.port
    }

    fn bind_addr(&self) -> String {
        format!("{}:{}", self.listen.host_str().unwrap_or("0.0.0.0"), self.port)
    }

    /// `<scheme>://<host>:<port>` with the port always written out.
    pub fn listen_addr(&self) -> String {
        format!("{}://{}", self.listen.scheme(), self.bind_addr())
    }

    /// Open the listener and prepare TLS and the forwarder.
    pub async fn bind(self: &Arc<Self>) -> Result<ProxyListener> {
        let endpoint = self
            .endpoint
            .upgrade()
            .ok_or_else(|| RouterError::EndpointGone(self.listen.to_string()))?;

        let listener = TcpListener::bind(self.bind_addr()).await?;
        let local_addr = listener.local_addr()?;

        let tls = match self.scheme.alpn() {
            Some(alpn) => {
                let cert = endpoint.certificate(endpoint.host())?;
                Some(TlsAcceptor::from(tls::server_config(&cert, alpn)?))
            }
            None => None,
        };

        let stats = Arc::new(ListenerStats::default());
        let forwarder = match self.scheme {
            ListenScheme::Http | ListenScheme::Https => Forwarder::Http(Arc::new(HttpForwarder::new(
                self.listen.clone(),
                self.target.clone(),
                endpoint.host(),
                endpoint.resolver(),
                Arc::clone(&stats),
            )?)),
            ListenScheme::Tcp | ListenScheme::Tls => Forwarder::Tcp(Arc::new(TcpForwarder::new(
                self.target.clone(),
                endpoint.resolver(),
                Arc::clone(&stats),
            ))),
        };

        let max_connections = endpoint.settings().max_connections;

        info!(
            host = %endpoint.host(),
            listen = %self.listen,
            target = %self.target,
            bind_addr = %local_addr,
            max_connections = max_connections,
            "Proxy bound"
        );

        Ok(ProxyListener {
            proxy: Arc::clone(self),
            listener,
            local_addr,
            tls,
            forwarder,
            conn_semaphore: Arc::new(Semaphore::new(max_connections)),
            stats,
        })
    }

    /// Bind and run until the listener fails.
    pub async fn serve(self: &Arc<Self>) -> Result<()> {
        self.bind().await?.run().await
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("listen", &self.listen_addr())
            .field("target", &self.target.as_str())
            .finish()
    }
}

impl Serialize for Proxy {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Proxy", 2)?;
        state.serialize_field("listen", &self.listen_addr())?;
        state.serialize_field("target", self.target.as_str())?;
        state.end()
    }
}

/// Handles accepted connections for one scheme.
#[derive(Clone)]
enum Forwarder {
    Http(Arc<HttpForwarder>),
    Tcp(Arc<TcpForwarder>),
}

impl Forwarder {
    async fn serve<S>(self, stream: S, peer: SocketAddr, local_port: u16) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        match self {
            Forwarder::Tcp(tcp) => tcp.forward(stream).await.map(|_| ()),
            Forwarder::Http(http) => {
                let service = service_fn(move |req| {
                    let http = Arc::clone(&http);
                    async move { Ok::<_, Infallible>(http.handle(req, peer, local_port).await) }
                });

                auto::Builder::new(TokioExecutor::new())
                    .serve_connection_with_upgrades(TokioIo::new(stream), service)
                    .await
                    .map_err(|e| RouterError::Io(io::Error::other(e)))
            }
        }
    }
}

/// A bound proxy, ready to accept.
pub struct ProxyListener {
    proxy: Arc<Proxy>,
    listener: TcpListener,
    local_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    forwarder: Forwarder,
    conn_semaphore: Arc<Semaphore>,
    stats: Arc<ListenerStats>,
}

impl ProxyListener {
    /// Address actually bound; differs from the listen URL for port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Accept connections until the listener fails. The socket is closed on return.
    pub async fn run(self) -> Result<()> {
        let listen = self.proxy.listen.clone();
        info!(listen = %listen, bind_addr = %self.local_addr, "Proxy serving");

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(listen = %listen, error = %e, "Accept error");
                    return Err(e.into());
                }
            };

            let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    self.stats
                        .connections_rejected
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                    continue;
                }
            };

            self.stats
                .connections_accepted
                .fetch_add(1, Ordering::Relaxed);
            self.stats
                .connections_active
                .fetch_add(1, Ordering::Relaxed);

            let _ = stream.set_nodelay(true);
            let tls = self.tls.clone();
            let forwarder = self.forwarder.clone();
            let stats = Arc::clone(&self.stats);
            let local_port = self.local_addr.port();

            tokio::spawn(
                async move {
                    let result = match tls {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(stream) => forwarder.serve(stream, peer_addr, local_port).await,
                            Err(e) => Err(e.into()),
                        },
                        None => forwarder.serve(stream, peer_addr, local_port).await,
                    };

                    if let Err(e) = result {
                        debug!(
                            peer_addr = %peer_addr,
                            reason = e.reason_code(),
                            error = %e,
                            "Connection error"
                        );
                    }

                    stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                    stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                    drop(permit);
                }
                .instrument(tracing::info_span!("connection", peer = %peer_addr, listen = %listen)),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn proxy(listen: &str) -> Result<Proxy> {
        Proxy::new(
            Weak::new(),
            Url::parse(listen).unwrap(),
            Url::parse("tcp://rack/myapp/service/web:3000").unwrap(),
        )
    }

    #[test]
    fn test_listen_scheme_parse() {
        assert_eq!(ListenScheme::parse("https").unwrap(), ListenScheme::Https);
        assert_eq!(ListenScheme::parse("tls").unwrap(), ListenScheme::Tls);
        assert_eq!(
            ListenScheme::parse("udp").unwrap_err().reason_code(),
            "unsupported_scheme"
        );
    }

    #[test]
    fn test_proxy_ports() {
        assert_eq!(proxy("tcp://0.0.0.0:5000").unwrap().port(), 5000);
        assert_eq!(proxy("https://0.0.0.0").unwrap().port(), 443);
        assert_eq!(proxy("http://0.0.0.0").unwrap().port(), 80);

        assert_eq!(
            proxy("tcp://0.0.0.0").unwrap_err().reason_code(),
            "invalid_listen_port"
        );
        assert_eq!(
            proxy("ftp://0.0.0.0:21").unwrap_err().reason_code(),
            "unsupported_scheme"
        );
    }

    #[test]
    fn test_bind_addr_brackets_ipv6() {
        assert_eq!(proxy("tcp://[::1]:5000").unwrap().bind_addr(), "[::1]:5000");
        assert_eq!(proxy("tcp://0.0.0.0:5000").unwrap().bind_addr(), "0.0.0.0:5000");
    }

    #[rstest]
    #[case("tcp://0.0.0.0:5000", "tcp://0.0.0.0:5000")]
    #[case("https://0.0.0.0:443", "https://0.0.0.0:443")]
    #[case("https://0.0.0.0", "https://0.0.0.0:443")]
    #[case("http://0.0.0.0:80", "http://0.0.0.0:80")]
    #[case("http://0.0.0.0:8080", "http://0.0.0.0:8080")]
    #[case("tls://[::1]:8443", "tls://[::1]:8443")]
    fn test_proxy_json(#[case] listen: &str, #[case] expected: &str) {
        let p = proxy(listen).unwrap();
        assert_eq!(
            serde_json::to_string(&p).unwrap(),
            format!(
                r#"{{"listen":"{}","target":"tcp://rack/myapp/service/web:3000"}}"#,
                expected
            )
        );
    }

    #[tokio::test]
    async fn test_bind_without_endpoint() {
        let p = Arc::new(proxy("tcp://127.0.0.1:0").unwrap());
        let err = p.bind().await.err().unwrap();
        assert_eq!(err.reason_code(), "endpoint_gone");
    }

    #[test]
    fn test_listener_stats() {
        let stats = ListenerStats::default();
        stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 1);
    }
}
