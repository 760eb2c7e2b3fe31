//! Header set transformations applied on every forwarded hop.

use std::net::SocketAddr;

use hyper::header::{HeaderMap, HeaderName, HeaderValue};

/// Hop-by-hop headers that never cross a proxy (RFC 9110 section 7.6.1).
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// WebSocket negotiation headers regenerated by the outbound handshake.
pub const WEBSOCKET_NEGOTIATION: &[&str] = &[
    "upgrade",
    "connection",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
    "sec-websocket-protocol",
];

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED_PORT: &str = "x-forwarded-port";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// A deny-list of header names.
#[derive(Debug, Clone, Copy)]
pub struct HeaderFilter {
    deny: &'static [&'static str],
}

impl HeaderFilter {
    pub const HOP_BY_HOP: HeaderFilter = HeaderFilter { deny: HOP_BY_HOP };
    pub const WEBSOCKET: HeaderFilter = HeaderFilter {
        deny: WEBSOCKET_NEGOTIATION,
    };

    /// Returns true if `name` passes the filter. Matching ignores case.
    pub fn allows(&self, name: &str) -> bool {
        !self.deny.iter().any(|d| d.eq_ignore_ascii_case(name))
    }

    /// Copy every allowed header, keeping repeated values.
    pub fn apply(&self, headers: &HeaderMap) -> HeaderMap {
        let mut out = HeaderMap::with_capacity(headers.len());
        for (name, value) in headers {
            if self.allows(name.as_str()) {
                out.append(name.clone(), value.clone());
            }
        }
        out
    }

    /// Remove denied headers in place, including any named by `Connection`.
    pub fn strip(&self, headers: &mut HeaderMap) {
        let named: Vec<HeaderName> = headers
            .get_all(hyper::header::CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
            .collect();

        for name in named {
            headers.remove(name);
        }
        for name in self.deny {
            headers.remove(*name);
        }
    }
}

/// Forwarding metadata describing the inbound hop.
#[derive(Debug, Clone)]
pub struct Forwarded {
    /// Remote address of the client.
    pub peer: SocketAddr,
    /// Listener port the client connected to.
    pub port: u16,
    /// Listener scheme.
    pub proto: String,
}

impl Forwarded {
    /// Append the `X-Forwarded-*` headers.
    pub fn apply(&self, headers: &mut HeaderMap) {
        let values = [
            (X_FORWARDED_FOR, self.peer.ip().to_string()),
            (X_FORWARDED_PORT, self.port.to_string()),
            (X_FORWARDED_PROTO, self.proto.clone()),
        ];

        for (name, value) in values {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.append(name, value);
            }
        }
    }
}
