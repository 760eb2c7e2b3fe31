//! WebSocket bridging.
//!
//! The backend handshake happens before the client is answered, so a dead
//! backend yields a 502 instead of an upgraded connection that closes at once.
//! After both sides have switched protocols the two raw connections are
//! handed to the pump; frames are never parsed.

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::header::{
    HeaderMap, HeaderValue, CONNECTION, HOST, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_VERSION, UPGRADE,
};
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn, Instrument};
use tungstenite::handshake::client::generate_key;
use tungstenite::handshake::derive_accept_key;
use url::Url;

use super::backend::BackendResolver;
use super::headers::{Forwarded, HeaderFilter};
use super::http::{client_handshake, error_response, ProxyBody};
use super::pump::pump;
use super::target::is_rack_target;
use crate::error::{Result, RouterError};

const WEBSOCKET_VERSION: &str = "13";

/// Bridges WebSocket upgrades to one target.
pub struct WebSocketForwarder {
    target: Url,
    /// Endpoint host, sent as the outbound `Host`.
    host: String,
    resolver: Arc<BackendResolver>,
    /// Present when the backend hop is `wss`.
    tls: Option<TlsConnector>,
}

impl WebSocketForwarder {
    /// Rack-backed targets always use `wss` with an unverified inner hop.
    /// Direct targets use `wss` only for `https` or `wss` target schemes.
    pub fn new(target: Url, host: &str, resolver: Arc<BackendResolver>) -> Result<Self> {
        let secure = is_rack_target(&target) || matches!(target.scheme(), "https" | "wss");
        let tls = if secure {
            Some(crate::tls::insecure_connector()?)
        } else {
            None
        };

        Ok(Self {
            target,
            host: host.to_string(),
            resolver,
            tls,
        })
    }

    /// Handle one inbound upgrade request.
    ///
    /// `path` is the outbound path and query, derived the same way as for plain
    /// requests on this proxy.
    pub async fn forward(
        &self,
        mut req: Request<Incoming>,
        path: String,
        forwarded: &Forwarded,
    ) -> Response<ProxyBody> {
        let accept = match inbound_accept_key(req.headers()) {
            Ok(accept) => accept,
            Err(e) => {
                debug!(error = %e, "Rejected websocket upgrade");
                return error_response(&e);
            }
        };

        let headers = outbound_headers(req.headers(), forwarded, &self.host);

        let backend = match self.dial(&path, headers).await {
            Ok(backend) => backend,
            Err(e) => {
                warn!(
                    path = %path,
                    reason = e.reason_code(),
                    error = %e,
                    "Websocket dial failed"
                );
                return error_response(&e);
            }
        };

        let on_upgrade = hyper::upgrade::on(&mut req);
        let idle_timeout = self.resolver.idle_timeout();

        tokio::spawn(
            async move {
                let frontend = match on_upgrade.await {
                    Ok(upgraded) => upgraded,
                    Err(e) => {
                        warn!(error = %e, "Websocket upgrade failed");
                        return;
                    }
                };

                match pump(TokioIo::new(frontend), TokioIo::new(backend), idle_timeout).await {
                    Ok(stats) => info!(
                        bytes_to_backend = stats.to_b,
                        bytes_from_backend = stats.from_b,
                        "Websocket closed"
                    ),
                    Err(e) => debug!(
                        bytes_to_backend = e.stats.to_b,
                        bytes_from_backend = e.stats.from_b,
                        error = %e,
                        "Websocket pump error"
                    ),
                }
            }
            .instrument(tracing::info_span!("websocket", path = %path)),
        );

        switching_protocols(&accept)
    }

    /// Open the backend hop and complete its opening handshake.
    async fn dial(&self, path: &str, mut headers: HeaderMap) -> Result<Upgraded> {
        let stream = match &self.tls {
            Some(connector) => {
                let server_name = if is_rack_target(&self.target) {
                    self.host.as_str()
                } else {
                    self.target.host_str().unwrap_or(self.host.as_str())
                };
                self.resolver
                    .connect_tls(&self.target, connector, server_name)
                    .await?
            }
            None => self.resolver.connect(&self.target).await?,
        };

        let key = generate_key();
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(SEC_WEBSOCKET_VERSION, HeaderValue::from_static(WEBSOCKET_VERSION));
        headers.insert(
            SEC_WEBSOCKET_KEY,
            HeaderValue::from_str(&key).map_err(|e| RouterError::HandshakeFailure(e.to_string()))?,
        );

        let uri: Uri = path
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| RouterError::HandshakeFailure(e.to_string()))?;
        let mut outbound = Request::get(uri)
            .body(Empty::<Bytes>::new())
            .map_err(|e| RouterError::HandshakeFailure(e.to_string()))?;
        *outbound.headers_mut() = headers;

        let mut sender = client_handshake(stream).await?;
        let mut resp = sender
            .send_request(outbound)
            .await
            .map_err(|e| RouterError::HandshakeFailure(e.to_string()))?;

        if resp.status() != StatusCode::SWITCHING_PROTOCOLS {
            return Err(RouterError::HandshakeFailure(format!(
                "backend answered {}",
                resp.status()
            )));
        }

        let expected = derive_accept_key(key.as_bytes());
        let accepted = resp
            .headers()
            .get(SEC_WEBSOCKET_ACCEPT)
            .and_then(|v| v.to_str().ok());
        if accepted != Some(expected.as_str()) {
            return Err(RouterError::HandshakeFailure(
                "backend sent a bad Sec-WebSocket-Accept".to_string(),
            ));
        }

        hyper::upgrade::on(&mut resp)
            .await
            .map_err(|e| RouterError::HandshakeFailure(e.to_string()))
    }
}

/// Validate an inbound opening handshake and compute its accept key.
fn inbound_accept_key(headers: &HeaderMap) -> Result<String> {
    let version = headers
        .get(SEC_WEBSOCKET_VERSION)
        .and_then(|v| v.to_str().ok());
    if version != Some(WEBSOCKET_VERSION) {
        return Err(RouterError::UpgradeFailure(format!(
            "unsupported websocket version: {}",
            version.unwrap_or("none")
        )));
    }

    let key = headers
        .get(SEC_WEBSOCKET_KEY)
        .ok_or_else(|| RouterError::UpgradeFailure("missing Sec-WebSocket-Key".to_string()))?;

    Ok(derive_accept_key(key.as_bytes()))
}

/// Headers for the backend handshake: everything inbound except the negotiation
/// headers, with `Host` replaced and forwarding headers appended.
fn outbound_headers(inbound: &HeaderMap, forwarded: &Forwarded, host: &str) -> HeaderMap {
    let mut headers = HeaderFilter::WEBSOCKET.apply(inbound);
    headers.remove(HOST);
    if let Ok(value) = HeaderValue::from_str(host) {
        headers.insert(HOST, value);
    }
    forwarded.apply(&mut headers);
    headers
}

fn switching_protocols(accept: &str) -> Response<ProxyBody> {
    let mut resp = Response::new(Empty::new().map_err(|never| match never {}).boxed());
    *resp.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = resp.headers_mut();
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    if let Ok(value) = HeaderValue::from_str(accept) {
        headers.insert(SEC_WEBSOCKET_ACCEPT, value);
    }
    resp
}
