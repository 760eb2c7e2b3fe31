//! Router configuration.
//!
//! Process settings come from the environment; the endpoints to serve come
//! from a JSON file named by `ROUTER_CONFIG`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use url::Url;

use crate::proxy::{ProxySettings, DEFAULT_MAX_CONNECTIONS};

/// Router configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Endpoints file.
    pub endpoints_file: PathBuf,

    /// Optional local rack description.
    pub rack_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Maximum concurrent connections per listener.
    pub max_connections: usize,

    /// Direct backend dial timeout.
    pub connect_timeout: Duration,

    /// Idle timeout per pump direction.
    pub idle_timeout: Option<Duration>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let endpoints_file = var("ROUTER_CONFIG")
            .map(PathBuf::from)
            .context("Missing endpoints file. Set ROUTER_CONFIG.")?;

        let rack_file = var("ROUTER_RACK_FILE").map(PathBuf::from);

        let log_level = var("ROUTER_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let max_connections: usize = var("ROUTER_MAX_CONNECTIONS")
            .map(|v| v.parse())
            .transpose()
            .context("ROUTER_MAX_CONNECTIONS must be an integer.")?
            .unwrap_or(DEFAULT_MAX_CONNECTIONS)
            .max(1);

        let connect_timeout_ms: u64 = var("ROUTER_CONNECT_TIMEOUT_MS")
            .map(|v| v.parse())
            .transpose()
            .context("ROUTER_CONNECT_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(2000);
        let connect_timeout = Duration::from_millis(connect_timeout_ms.max(50));

        let idle_timeout = var("ROUTER_IDLE_TIMEOUT_MS")
            .map(|v| v.parse::<u64>())
            .transpose()
            .context("ROUTER_IDLE_TIMEOUT_MS must be an integer (milliseconds).")?
            .map(Duration::from_millis);

        Ok(Self {
            endpoints_file,
            rack_file,
            log_level,
            max_connections,
            connect_timeout,
            idle_timeout,
        })
    }

    pub fn proxy_settings(&self) -> ProxySettings {
        ProxySettings {
            max_connections: self.max_connections,
            connect_timeout: self.connect_timeout,
            idle_timeout: self.idle_timeout,
        }
    }
}

/// Contents of the endpoints file.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointsFile {
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub host: String,
    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    pub listen: Url,
    pub target: Url,
}

impl EndpointsFile {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Invalid endpoints file")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read endpoints file {}", path.display()))?;
        Self::from_json(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[("ROUTER_CONFIG", "/etc/router.json")])).unwrap();

        assert_eq!(config.endpoints_file, PathBuf::from("/etc/router.json"));
        assert!(config.rack_file.is_none());
        assert_eq!(config.log_level, "info");
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.connect_timeout, Duration::from_secs(2));
        assert!(config.idle_timeout.is_none());
    }

    #[test]
    fn test_missing_endpoints_file() {
        assert!(Config::from_lookup(lookup(&[])).is_err());
    }

    #[test]
    fn test_overrides_and_clamps() {
        let config = Config::from_lookup(lookup(&[
            ("ROUTER_CONFIG", "router.json"),
            ("ROUTER_RACK_FILE", "rack.json"),
            ("ROUTER_MAX_CONNECTIONS", "0"),
            ("ROUTER_CONNECT_TIMEOUT_MS", "10"),
            ("ROUTER_IDLE_TIMEOUT_MS", "30000"),
        ]))
        .unwrap();

        assert_eq!(config.rack_file, Some(PathBuf::from("rack.json")));
        assert_eq!(config.max_connections, 1);
        assert_eq!(config.connect_timeout, Duration::from_millis(50));
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(30)));

        let settings = config.proxy_settings();
        assert_eq!(settings.max_connections, 1);
    }

    #[test]
    fn test_rejects_non_numeric() {
        let result = Config::from_lookup(lookup(&[
            ("ROUTER_CONFIG", "router.json"),
            ("ROUTER_MAX_CONNECTIONS", "many"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_endpoints_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"endpoints":[{{"host":"app.example.test","proxies":[
                {{"listen":"https://0.0.0.0:443","target":"https://rack/myapp/service/web:3000"}},
                {{"listen":"tcp://0.0.0.0:5432","target":"tcp://rack/myapp/resource/db:5432"}}
            ]}}]}}"#
        )
        .unwrap();

        let parsed = EndpointsFile::load(file.path()).unwrap();
        assert_eq!(parsed.endpoints.len(), 1);
        assert_eq!(parsed.endpoints[0].host, "app.example.test");
        assert_eq!(parsed.endpoints[0].proxies[1].listen.port(), Some(5432));
    }

    #[test]
    fn test_invalid_endpoints_file() {
        assert!(EndpointsFile::from_json(r#"{"endpoints":[{"host":"a","proxies":[{"listen":"not a url"}]}]}"#).is_err());
    }
}
