//! Target descriptor parsing.
//!
//! Rack-backed targets carry their backend in the URL path:
//!
//! ```text
//! tcp://rack/{app}/{kind}/{name}:{port}
//! ```
//!
//! where `kind` is `service` or `resource`. The port is required for services
//! and must be present (but is not used) for resources. Malformed paths are
//! rejected, never defaulted.

use std::fmt;

use thiserror::Error;
use url::Url;

/// Hostname that marks a target as rack-backed.
pub const RACK_HOST: &str = "rack";

/// Target path parse errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TargetError {
    /// Fewer than four `/`-delimited segments, or an empty app.
    #[error("invalid rack endpoint: {0}")]
    MalformedPath(String),

    /// Selector is not `{name}:{port}`.
    #[error("invalid {kind} endpoint: {selector}")]
    MalformedInstanceSelector { kind: String, selector: String },

    /// Kind is neither `service` nor `resource`.
    #[error("unknown proxy type: {0}")]
    UnknownKind(String),
}

impl TargetError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            TargetError::MalformedPath(_) => "malformed_target_path",
            TargetError::MalformedInstanceSelector { .. } => "malformed_instance_selector",
            TargetError::UnknownKind(_) => "unknown_kind",
        }
    }
}

/// What a rack-backed target points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// Processes of a service, reached on a port.
    Service,
    /// A named resource.
    Resource,
}

impl TargetKind {
    fn parse(kind: &str) -> Option<Self> {
        match kind {
            "service" => Some(Self::Service),
            "resource" => Some(Self::Resource),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Service => "service",
            TargetKind::Resource => "resource",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed form of a rack-backed target path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDescriptor {
    pub app: String,
    pub kind: TargetKind,
    pub name: String,
    /// Always set for services; set for resources only when numeric.
    pub port: Option<u16>,
}

impl TargetDescriptor {
    /// Parse a target path such as `/myapp/service/web:3000`.
    pub fn parse(path: &str) -> Result<Self, TargetError> {
        let parts: Vec<&str> = path.split('/').collect();

        if parts.len() < 4 || parts[1].is_empty() {
            return Err(TargetError::MalformedPath(path.to_string()));
        }

        let app = parts[1];
        let kind = TargetKind::parse(parts[2])
            .ok_or_else(|| TargetError::UnknownKind(parts[2].to_string()))?;

        let selector = parts[3];
        let tokens: Vec<&str> = selector.split(':').collect();

        let malformed = || TargetError::MalformedInstanceSelector {
            kind: kind.to_string(),
            selector: selector.to_string(),
        };

        if tokens.len() < 2 || tokens[0].is_empty() {
            return Err(malformed());
        }

        let port = match kind {
            TargetKind::Service => Some(tokens[1].parse::<u16>().map_err(|_| malformed())?),
            TargetKind::Resource => tokens[1].parse::<u16>().ok(),
        };

        Ok(Self {
            app: app.to_string(),
            kind,
            name: tokens[0].to_string(),
            port,
        })
    }

    /// Parse the path of a target URL.
    pub fn from_url(target: &Url) -> Result<Self, TargetError> {
        Self::parse(target.path())
    }
}

/// Returns true if the target host is the rack indirection marker.
pub fn is_rack_target(target: &Url) -> bool {
    target.host_str() == Some(RACK_HOST)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[test]
    fn test_parse_service() {
        let target = TargetDescriptor::parse("/myapp/service/web:3000").unwrap();
        assert_eq!(
            target,
            TargetDescriptor {
                app: "myapp".to_string(),
                kind: TargetKind::Service,
                name: "web".to_string(),
                port: Some(3000),
            }
        );
    }

    #[test]
    fn test_parse_resource() {
        let target = TargetDescriptor::parse("/myapp/resource/db:5432").unwrap();
        assert_eq!(target.kind, TargetKind::Resource);
        assert_eq!(target.name, "db");
        assert_eq!(target.port, Some(5432));

        let target = TargetDescriptor::parse("/myapp/resource/db:any").unwrap();
        assert_eq!(target.port, None);
    }

    #[test]
    fn test_extra_segments_are_ignored() {
        let target = TargetDescriptor::parse("/myapp/service/web:3000/extra").unwrap();
        assert_eq!(target.name, "web");
    }

    #[rstest]
    #[case("")]
    #[case("/")]
    #[case("/myapp")]
    #[case("/myapp/service")]
    #[case("//service/web:3000")]
    fn test_malformed_path(#[case] path: &str) {
        assert!(matches!(
            TargetDescriptor::parse(path),
            Err(TargetError::MalformedPath(_))
        ));
    }

    #[rstest]
    #[case("/myapp/service/web")]
    #[case("/myapp/service/:3000")]
    #[case("/myapp/service/web:http")]
    #[case("/myapp/service/web:99999")]
    #[case("/myapp/resource/db")]
    fn test_malformed_selector(#[case] path: &str) {
        assert!(matches!(
            TargetDescriptor::parse(path),
            Err(TargetError::MalformedInstanceSelector { .. })
        ));
    }

    #[test]
    fn test_unknown_kind() {
        assert_eq!(
            TargetDescriptor::parse("/myapp/process/web:3000"),
            Err(TargetError::UnknownKind("process".to_string()))
        );
    }

    #[test]
    fn test_from_url() {
        let url = Url::parse("tcp://rack/myapp/service/web:3000").unwrap();
        assert!(is_rack_target(&url));
        assert_eq!(TargetDescriptor::from_url(&url).unwrap().port, Some(3000));

        let direct = Url::parse("tcp://127.0.0.1:9000").unwrap();
        assert!(!is_rack_target(&direct));
    }

    proptest! {
        #[test]
        fn short_paths_are_malformed(segments in prop::collection::vec("[a-z0-9:]{0,8}", 0..3)) {
            let path = segments.join("/");
            prop_assert!(matches!(
                TargetDescriptor::parse(&path),
                Err(TargetError::MalformedPath(_))
            ));
        }

        #[test]
        fn unknown_kinds_are_rejected(
            app in "[a-z]{1,8}",
            kind in "[a-z]{1,10}",
            selector in "[a-z0-9:]{0,12}",
        ) {
            prop_assume!(kind != "service" && kind != "resource");
            let path = format!("/{}/{}/{}", app, kind, selector);
            prop_assert_eq!(TargetDescriptor::parse(&path), Err(TargetError::UnknownKind(kind)));
        }

        #[test]
        fn services_round_trip(name in "[a-z][a-z0-9-]{0,10}", port in any::<u16>()) {
            let path = format!("/app/service/{}:{}", name, port);
            let target = TargetDescriptor::parse(&path).unwrap();
            prop_assert_eq!(target.name, name);
            prop_assert_eq!(target.port, Some(port));
        }
    }
}
