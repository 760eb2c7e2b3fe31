//! File-described rack.
//!
//! `LocalRack` answers discovery from a static description and satisfies
//! tunnels by dialing plain TCP addresses. It backs the router binary in
//! development and the integration tests.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tracing::debug;

use crate::{Process, Rack, RackError, Tunnel};

/// A process entry in a local rack description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalProcess {
    pub id: String,
    pub service: String,
    /// Host the process listens on; tunnels dial `host:port`.
    pub host: String,
}

/// One app in a local rack description.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalApp {
    #[serde(default)]
    pub processes: Vec<LocalProcess>,
    /// Resource name to `host:port`.
    #[serde(default)]
    pub resources: HashMap<String, String>,
}

/// A rack backed by a static description.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRack {
    #[serde(default)]
    apps: HashMap<String, LocalApp>,
}

impl LocalRack {
    /// Create an empty rack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a rack description from JSON.
    pub fn from_json(json: &str) -> Result<Self, RackError> {
        serde_json::from_str(json).map_err(|e| RackError::Description(e.to_string()))
    }

    /// Load a rack description from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RackError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| RackError::Description(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }

    /// Add or replace an app.
    pub fn with_app(mut self, name: impl Into<String>, app: LocalApp) -> Self {
        self.apps.insert(name.into(), app);
        self
    }

    fn app(&self, app: &str) -> Result<&LocalApp, RackError> {
        self.apps
            .get(app)
            .ok_or_else(|| RackError::NotFound(format!("app {}", app)))
    }

    async fn dial(target: String) -> Result<Tunnel, RackError> {
        debug!(target = %target, "Dialing local tunnel");
        match TcpStream::connect(&target).await {
            Ok(stream) => Ok(Box::new(stream)),
            Err(e) => Err(RackError::Tunnel {
                target,
                detail: e.to_string(),
            }),
        }
    }
}

#[async_trait]
impl Rack for LocalRack {
    async fn process_list(&self, app: &str, service: &str) -> Result<Vec<Process>, RackError> {
        let local = self.app(app)?;
        Ok(local
            .processes
            .iter()
            .filter(|p| p.service == service)
            .map(|p| Process {
                id: p.id.clone(),
                app: app.to_string(),
                service: p.service.clone(),
            })
            .collect())
    }

    async fn process_tunnel(&self, app: &str, pid: &str, port: u16) -> Result<Tunnel, RackError> {
        let process = self
            .app(app)?
            .processes
            .iter()
            .find(|p| p.id == pid)
            .ok_or_else(|| RackError::NotFound(format!("process {}/{}", app, pid)))?;

        let host = if process.host.contains(':') && !process.host.starts_with('[') {
            format!("[{}]", process.host)
        } else {
            process.host.clone()
        };

        Self::dial(format!("{}:{}", host, port)).await
    }

    async fn resource_tunnel(&self, app: &str, resource: &str) -> Result<Tunnel, RackError> {
        let addr = self
            .app(app)?
            .resources
            .get(resource)
            .ok_or_else(|| RackError::NotFound(format!("resource {}/{}", app, resource)))?;

        Self::dial(addr.clone()).await
    }
}
