//! Port to service-name resolution backed by the services(5) registry

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

/// Name returned for ports the registry does not know
pub const PORT_NAME_FALLBACK: &str = "uncommon";

const SYSTEM_SERVICES_PATH: &str = "/etc/services";

static SYSTEM_REGISTRY: LazyLock<ServiceRegistry> =
    LazyLock::new(|| ServiceRegistry::from_file(Path::new(SYSTEM_SERVICES_PATH)));

/// Well-known service names keyed by (port, protocol)
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    services: HashMap<(u16, String), String>,
}

impl ServiceRegistry {
    /// Parse services(5) formatted text. The first name listed for a
    /// port/protocol pair wins.
    pub fn parse(text: &str) -> Self {
        let mut services = HashMap::new();

        for line in text.lines() {
            let line = line.split('#').next().unwrap_or_default();
            let mut fields = line.split_whitespace();
            let (Some(name), Some(port_proto)) = (fields.next(), fields.next()) else {
                continue;
            };
            let Some((port, proto)) = port_proto.split_once('/') else {
                continue;
            };
            let Ok(port) = port.parse::<u16>() else {
                continue;
            };

            services
                .entry((port, proto.to_lowercase()))
                .or_insert_with(|| name.to_string());
        }

        Self { services }
    }

    /// Load a registry file; an unreadable file gives an empty registry
    pub fn from_file(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Service registry unavailable");
                Self::default()
            }
        }
    }

    /// The host's registry, read once per process
    pub fn system() -> &'static Self {
        &SYSTEM_REGISTRY
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn lookup(&self, port: u16, protocol: &str) -> Option<&str> {
        self.services
            .get(&(port, protocol.to_lowercase()))
            .map(String::as_str)
    }
}

/// Maps ports to human-readable service names
#[derive(Debug, Clone, Copy)]
pub struct PortNameResolver<'a> {
    registry: &'a ServiceRegistry,
}

impl PortNameResolver<'static> {
    /// Resolver over the host's service registry
    pub fn system() -> Self {
        Self::new(ServiceRegistry::system())
    }
}

impl<'a> PortNameResolver<'a> {
    pub fn new(registry: &'a ServiceRegistry) -> Self {
        Self { registry }
    }

    /// Service name for `port`/`protocol`, or [`PORT_NAME_FALLBACK`]
    pub fn resolve(&self, port: i64, protocol: &str) -> String {
        u16::try_from(port)
            .ok()
            .and_then(|port| self.registry.lookup(port, protocol))
            .unwrap_or(PORT_NAME_FALLBACK)
            .to_string()
    }

    pub fn resolve_tcp(&self, port: i64) -> String {
        self.resolve(port, "tcp")
    }
}
