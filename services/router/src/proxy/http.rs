//! HTTP reverse proxy.
//!
//! Each outbound round trip opens a fresh backend connection through the
//! [`BackendResolver`], so rack-backed targets pick a new process per request.
//! WebSocket upgrade requests bypass the round trip and go to the
//! [`WebSocketForwarder`], which needs the raw connection.
//!
//! Resolution failures never reach the client as a dropped connection: no live
//! processes answers 503, anything else answers 502.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Body, Incoming};
use hyper::client::conn::http1::SendRequest;
use hyper::header::{HeaderValue, HOST, UPGRADE};
use hyper::{Method, Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};
use url::Url;

use super::backend::{BackendResolver, BackendStream};
use super::headers::{Forwarded, HeaderFilter};
use super::listener::ListenerStats;
use super::target::{is_rack_target, TargetDescriptor};
use super::websocket::WebSocketForwarder;
use crate::error::{Result, RouterError};

/// Response body type produced by the forwarders.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// One outbound request/response exchange.
#[async_trait]
pub trait RoundTrip: Send + Sync {
    async fn round_trip(&self, req: Request<Incoming>) -> Result<Response<Incoming>>;
}

/// Opens a backend connection per request and speaks HTTP/1.1 over it.
pub struct BackendTransport {
    resolver: Arc<BackendResolver>,
    target: Url,
    /// Present for `https` targets.
    tls: Option<(TlsConnector, String)>,
}

impl BackendTransport {
    pub fn new(resolver: Arc<BackendResolver>, target: Url, tls: Option<(TlsConnector, String)>) -> Self {
        Self { resolver, target, tls }
    }

    async fn open(&self) -> Result<BackendStream> {
        match &self.tls {
            Some((connector, server_name)) => {
                self.resolver
                    .connect_tls(&self.target, connector, server_name)
                    .await
            }
            None => self.resolver.connect(&self.target).await,
        }
    }
}

#[async_trait]
impl RoundTrip for BackendTransport {
    async fn round_trip(&self, req: Request<Incoming>) -> Result<Response<Incoming>> {
        let stream = self.open().await?;
        let mut sender = client_handshake(stream).await?;

        sender
            .send_request(req)
            .await
            .map_err(|e| RouterError::HandshakeFailure(e.to_string()))
    }
}

/// Logs every round trip without altering it.
pub struct LoggedTransport<T> {
    inner: T,
}

impl<T: RoundTrip> LoggedTransport<T> {
    pub fn new(inner: T) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<T: RoundTrip> RoundTrip for LoggedTransport<T> {
    async fn round_trip(&self, req: Request<Incoming>) -> Result<Response<Incoming>> {
        let method = req.method().clone();
        let uri = req.uri().clone();
        let host = req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let start = Instant::now();

        match self.inner.round_trip(req).await {
            Ok(resp) => {
                info!(
                    method = %method,
                    host = %host,
                    uri = %uri,
                    status = resp.status().as_u16(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Proxied request"
                );
                Ok(resp)
            }
            Err(e) => {
                warn!(
                    method = %method,
                    host = %host,
                    uri = %uri,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    reason = e.reason_code(),
                    error = %e,
                    "Proxy round trip failed"
                );
                Err(e)
            }
        }
    }
}

/// Perform an HTTP/1.1 client handshake and drive the connection in the background.
pub(crate) async fn client_handshake<B>(stream: BackendStream) -> Result<SendRequest<B>>
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| RouterError::HandshakeFailure(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!(error = %e, "Backend connection error");
        }
    });

    Ok(sender)
}

/// How outbound request paths are derived.
#[derive(Debug, Clone)]
enum Director {
    /// Keep the inbound path; the target path names the rack workload.
    Rack,
    /// Prefix the inbound path with the target path and merge queries.
    Direct { base_path: String, base_query: Option<String> },
}

impl Director {
    fn path_and_query(&self, uri: &Uri) -> String {
        match self {
            Director::Rack => uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
            Director::Direct {
                base_path,
                base_query,
            } => {
                let mut out = join_paths(base_path, uri.path());
                let query = match (base_query.as_deref(), uri.query()) {
                    (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => {
                        Some(format!("{}&{}", a, b))
                    }
                    (Some(a), _) if !a.is_empty() => Some(a.to_string()),
                    (_, Some(b)) if !b.is_empty() => Some(b.to_string()),
                    _ => None,
                };
                if let Some(query) = query {
                    out.push('?');
                    out.push_str(&query);
                }
                out
            }
        }
    }
}

/// Join two paths with exactly one slash between them.
fn join_paths(a: &str, b: &str) -> String {
    match (a.ends_with('/'), b.starts_with('/')) {
        (true, true) => format!("{}{}", a, &b[1..]),
        (false, false) => format!("{}/{}", a, b),
        _ => format!("{}{}", a, b),
    }
}

/// Returns true for `GET` requests asking to upgrade to WebSocket.
pub fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    req.method() == Method::GET
        && req
            .headers()
            .get_all(UPGRADE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| {
                v.split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("websocket"))
            })
}

/// Forwards HTTP requests for one proxy.
pub struct HttpForwarder {
    listen: Url,
    director: Director,
    transport: Box<dyn RoundTrip>,
    websocket: WebSocketForwarder,
    stats: Arc<ListenerStats>,
}

impl HttpForwarder {
    /// Build a forwarder. Rack-backed targets are validated here.
    pub fn new(
        listen: Url,
        target: Url,
        host: &str,
        resolver: Arc<BackendResolver>,
        stats: Arc<ListenerStats>,
    ) -> Result<Self> {
        let rack_backed = is_rack_target(&target);

        let director = if rack_backed {
            TargetDescriptor::from_url(&target)?;
            Director::Rack
        } else {
            Director::Direct {
                base_path: target.path().to_string(),
                base_query: target.query().map(str::to_string),
            }
        };

        // Rack workloads present certificates nobody can vouch for; direct
        // upstreams must chain to a public root.
        let tls = match target.scheme() {
            "https" | "wss" if rack_backed => {
                Some((crate::tls::insecure_connector()?, host.to_string()))
            }
            "https" | "wss" => {
                let server_name = target.host_str().unwrap_or(host).to_string();
                let connector = crate::tls::verifying_connector(crate::tls::public_roots())?;
                Some((connector, server_name))
            }
            _ => None,
        };

        let websocket = WebSocketForwarder::new(target.clone(), host, Arc::clone(&resolver))?;
        let transport = LoggedTransport::new(BackendTransport::new(resolver, target, tls));

        Ok(Self {
            listen,
            director,
            transport: Box::new(transport),
            websocket,
            stats,
        })
    }

    /// Handle one inbound request.
    pub async fn handle(
        &self,
        req: Request<Incoming>,
        peer: SocketAddr,
        local_port: u16,
    ) -> Response<ProxyBody> {
        let forwarded = Forwarded {
            peer,
            port: local_port,
            proto: self.listen.scheme().to_string(),
        };

        if is_websocket_upgrade(&req) {
            let path = self.director.path_and_query(req.uri());
            return self.websocket.forward(req, path, &forwarded).await;
        }

        let req = self.direct(req, &forwarded);

        match self.transport.round_trip(req).await {
            Ok(resp) => {
                let (mut parts, body) = resp.into_parts();
                HeaderFilter::HOP_BY_HOP.strip(&mut parts.headers);
                Response::from_parts(parts, body.boxed())
            }
            Err(e) => {
                self.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                error_response(&e)
            }
        }
    }

    /// Rewrite an inbound request for the backend.
    fn direct(&self, req: Request<Incoming>, forwarded: &Forwarded) -> Request<Incoming> {
        let (mut parts, body) = req.into_parts();

        if !parts.headers.contains_key(HOST) {
            if let Some(authority) = parts.uri.authority() {
                if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
                    parts.headers.insert(HOST, value);
                }
            }
        }

        let path_and_query = self.director.path_and_query(&parts.uri);
        parts.uri = path_and_query
            .parse()
            .unwrap_or_else(|_| Uri::from_static("/"));
        parts.version = Version::HTTP_11;

        HeaderFilter::HOP_BY_HOP.strip(&mut parts.headers);
        forwarded.apply(&mut parts.headers);

        Request::from_parts(parts, body)
    }
}

/// Map a forwarding failure to a client response.
pub fn error_response(err: &RouterError) -> Response<ProxyBody> {
    let status = match err {
        RouterError::NoInstancesAvailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        RouterError::UpgradeFailure(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::BAD_GATEWAY,
    };
    text_response(status, status.canonical_reason().unwrap_or_default())
}

pub(crate) fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
    let mut resp = Response::new(
        Full::new(Bytes::from(format!("{}\n", body)))
            .map_err(|never| match never {})
            .boxed(),
    );
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn direct(base: &str) -> Director {
        let url = Url::parse(base).unwrap();
        Director::Direct {
            base_path: url.path().to_string(),
            base_query: url.query().map(str::to_string),
        }
    }

    #[rstest]
    #[case("http://backend:8080", "/users?id=1", "/users?id=1")]
    #[case("http://backend:8080/api", "/users", "/api/users")]
    #[case("http://backend:8080/api/", "/users", "/api/users")]
    #[case("http://backend:8080/api?v=2", "/users?id=1", "/api/users?v=2&id=1")]
    #[case("http://backend:8080/api?v=2", "/users", "/api/users?v=2")]
    fn test_direct_path_and_query(#[case] base: &str, #[case] inbound: &str, #[case] expected: &str) {
        let uri: Uri = inbound.parse().unwrap();
        assert_eq!(direct(base).path_and_query(&uri), expected);
    }

    #[test]
    fn test_rack_director_keeps_inbound_path() {
        let uri: Uri = "http://app.example.test/chat?room=1".parse().unwrap();
        assert_eq!(Director::Rack.path_and_query(&uri), "/chat?room=1");
    }

    #[test]
    fn test_is_websocket_upgrade() {
        let req = Request::get("/ws")
            .header("upgrade", "WebSocket")
            .header("connection", "Upgrade")
            .body(())
            .unwrap();
        assert!(is_websocket_upgrade(&req));

        let post = Request::post("/ws")
            .header("upgrade", "websocket")
            .body(())
            .unwrap();
        assert!(!is_websocket_upgrade(&post));

        let h2c = Request::get("/").header("upgrade", "h2c").body(()).unwrap();
        assert!(!is_websocket_upgrade(&h2c));
    }

    #[test]
    fn test_error_response_status() {
        let none = RouterError::NoInstancesAvailable {
            app: "myapp".to_string(),
            service: "web".to_string(),
        };
        assert_eq!(error_response(&none).status(), StatusCode::SERVICE_UNAVAILABLE);

        let dial = RouterError::DialFailure {
            addr: "127.0.0.1:1".to_string(),
            detail: "connection refused".to_string(),
        };
        assert_eq!(error_response(&dial).status(), StatusCode::BAD_GATEWAY);

        let upgrade = RouterError::UpgradeFailure("missing key".to_string());
        assert_eq!(error_response(&upgrade).status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_construction_rejects_malformed_rack_target() {
        let rack = Arc::new(rackgate_rack::LocalRack::new());
        let resolver = Arc::new(BackendResolver::new(rack));

        let err = HttpForwarder::new(
            Url::parse("http://0.0.0.0:80").unwrap(),
            Url::parse("http://rack/myapp/service").unwrap(),
            "app.example.test",
            resolver,
            Arc::new(ListenerStats::default()),
        )
        .err()
        .unwrap();

        assert_eq!(err.reason_code(), "malformed_target_path");
    }
}
