//! Endpoint registry.
//!
//! Uses ArcSwap for lock-free reads; writers serialize on a mutex and publish
//! a new snapshot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use rackgate_rack::Rack;
use serde::ser::SerializeSeq;
use serde::{Serialize, Serializer};
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::error::{Result, RouterError};
use crate::proxy::{BackendResolver, Endpoint, ProxySettings};
use crate::tls::CertificateIssuer;

/// Owns every endpoint served by this process.
pub struct Router {
    resolver: Arc<BackendResolver>,
    issuer: Arc<dyn CertificateIssuer>,
    settings: ProxySettings,
    endpoints: ArcSwap<HashMap<String, Arc<Endpoint>>>,
    write_lock: Mutex<()>,
}

impl Router {
    pub fn new(rack: Arc<dyn Rack>, issuer: Arc<dyn CertificateIssuer>, settings: ProxySettings) -> Self {
        let resolver = BackendResolver::new(rack)
            .with_connect_timeout(settings.connect_timeout)
            .with_idle_timeout(settings.idle_timeout);

        Self {
            resolver: Arc::new(resolver),
            issuer,
            settings,
            endpoints: ArcSwap::from_pointee(HashMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Create an endpoint for `host`. Hosts are unique.
    pub fn create_endpoint(&self, host: &str) -> Result<Arc<Endpoint>> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let current = self.endpoints.load();
        if current.contains_key(host) {
            return Err(RouterError::EndpointExists(host.to_string()));
        }

        let endpoint = Endpoint::new(
            host,
            Arc::clone(&self.resolver),
            Arc::clone(&self.issuer),
            self.settings.clone(),
        );

        let mut next = (**current).clone();
        next.insert(host.to_string(), Arc::clone(&endpoint));
        self.endpoints.store(Arc::new(next));

        info!(host = %host, "Endpoint created");
        Ok(endpoint)
    }

    pub fn endpoint(&self, host: &str) -> Option<Arc<Endpoint>> {
        self.endpoints.load().get(host).cloned()
    }

    /// Snapshot of all endpoints, ordered by host.
    pub fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        let mut endpoints: Vec<_> = self.endpoints.load().values().cloned().collect();
        endpoints.sort_by(|a, b| a.host().cmp(b.host()));
        endpoints
    }

    /// Serve every proxy of every endpoint. Returns when the first proxy stops.
    pub async fn serve(&self) -> Result<()> {
        let mut tasks = JoinSet::new();

        for endpoint in self.endpoints() {
            for proxy in endpoint.proxies() {
                let host = endpoint.host().to_string();
                tasks.spawn(async move {
                    let result = proxy.serve().await;
                    (host, proxy, result)
                });
            }
        }

        let Some(joined) = tasks.join_next().await else {
            info!("No proxies configured");
            return Ok(());
        };

        match joined {
            Ok((host, proxy, Err(e))) => {
                error!(
                    host = %host,
                    listen = %proxy.listen(),
                    reason = e.reason_code(),
                    error = %e,
                    "Proxy stopped"
                );
                Err(e)
            }
            Ok((host, proxy, Ok(()))) => {
                info!(host = %host, listen = %proxy.listen(), "Proxy stopped");
                Ok(())
            }
            Err(e) => Err(RouterError::Io(std::io::Error::other(e))),
        }
    }
}

impl Serialize for Router {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let endpoints = self.endpoints();
        let mut seq = serializer.serialize_seq(Some(endpoints.len()))?;
        for endpoint in &endpoints {
            seq.serialize_element(endpoint.as_ref())?;
        }
        seq.end()
    }
}
