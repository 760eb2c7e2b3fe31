//! Endpoints: one hostname, its proxies, and its certificates.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use serde::ser::{SerializeMap, SerializeStruct};
use serde::{Serialize, Serializer};
use tracing::{debug, info};
use url::Url;

use super::backend::BackendResolver;
use super::listener::{Proxy, ProxySettings};
use crate::error::{Result, RouterError};
use crate::tls::{CertificateIssuer, IssuedCertificate};

/// A virtual host owning proxies keyed by listen port.
pub struct Endpoint {
    host: String,
    proxies: Mutex<BTreeMap<u16, Arc<Proxy>>>,
    resolver: Arc<BackendResolver>,
    issuer: Arc<dyn CertificateIssuer>,
    settings: ProxySettings,
    /// Issued certificates by hostname; read lock-free by every listener.
    certificates: ArcSwap<HashMap<String, Arc<IssuedCertificate>>>,
}

impl Endpoint {
    pub fn new(
        host: impl Into<String>,
        resolver: Arc<BackendResolver>,
        issuer: Arc<dyn CertificateIssuer>,
        settings: ProxySettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            host: host.into(),
            proxies: Mutex::new(BTreeMap::new()),
            resolver,
            issuer,
            settings,
            certificates: ArcSwap::from_pointee(HashMap::new()),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    pub(crate) fn resolver(&self) -> Arc<BackendResolver> {
        Arc::clone(&self.resolver)
    }

    /// Create a proxy and reserve its listen port.
    ///
    /// Fails with `PortConflict` if the port is taken; the existing proxy is
    /// left untouched.
    pub fn create_proxy(self: &Arc<Self>, listen: Url, target: Url) -> Result<Arc<Proxy>> {
        let proxy = Arc::new(Proxy::new(Arc::downgrade(self), listen, target)?);
        let port = proxy.port();

        let mut proxies = self.proxies.lock().unwrap_or_else(|e| e.into_inner());
        match proxies.entry(port) {
            std::collections::btree_map::Entry::Occupied(_) => {
                return Err(RouterError::PortConflict(port));
            }
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&proxy));
            }
        }

        info!(
            host = %self.host,
            listen = %proxy.listen(),
            target = %proxy.target(),
            "Proxy created"
        );

        Ok(proxy)
    }

    pub fn proxy(&self, port: u16) -> Option<Arc<Proxy>> {
        self.proxies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&port)
            .cloned()
    }

    /// Snapshot of all proxies, ordered by port.
    pub fn proxies(&self) -> Vec<Arc<Proxy>> {
        self.proxies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Certificate for `hostname`, issued on first use and cached.
    pub fn certificate(&self, hostname: &str) -> Result<Arc<IssuedCertificate>> {
        if let Some(cert) = self.certificates.load().get(hostname) {
            return Ok(Arc::clone(cert));
        }

        let issued = Arc::new(self.issuer.issue(hostname)?);
        debug!(hostname = %hostname, "Issued certificate");

        self.certificates.rcu(|current| {
            let mut next = (**current).clone();
            next.entry(hostname.to_string())
                .or_insert_with(|| Arc::clone(&issued));
            next
        });

        Ok(self
            .certificates
            .load()
            .get(hostname)
            .cloned()
            .unwrap_or(issued))
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("host", &self.host)
            .field("proxies", &self.proxies())
            .finish()
    }
}

/// Serializes proxies as a map keyed by port.
struct Proxies(Vec<Arc<Proxy>>);

impl Serialize for Proxies {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for proxy in &self.0 {
            map.serialize_entry(&proxy.port(), proxy.as_ref())?;
        }
        map.end()
    }
}

impl Serialize for Endpoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Endpoint", 2)?;
        state.serialize_field("host", &self.host)?;
        state.serialize_field("proxies", &Proxies(self.proxies()))?;
        state.end()
    }
}
