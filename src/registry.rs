//! Domain to supervisor mapping shared by the router, the reconciler and
//! the reload consumer

use crate::supervisor::{BackendSupervisor, SupervisorSettings, SupervisorStatus};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Longest accepted routing key: a DNS name plus a `:port` suffix
const MAX_DOMAIN_LEN: usize = 253 + 6;

/// Canonical routing key for a mapping domain or a Host header value.
///
/// Keys are trimmed and lowercased. Printable ASCII other than `,` and `/`
/// is kept as is, including `_` and a `:port` suffix, so any key accepted
/// from the mapping file can be matched by a Host header.
pub fn normalize_domain(raw: &str) -> Option<String> {
    let domain = raw.trim();
    if domain.is_empty() || domain.len() > MAX_DOMAIN_LEN {
        return None;
    }

    if !domain
        .chars()
        .all(|c| c.is_ascii_graphic() && c != ',' && c != '/')
    {
        return None;
    }

    Some(domain.to_ascii_lowercase())
}

/// Host name with a trailing `:port` removed, if there is one
fn strip_port(host: &str) -> Option<&str> {
    let (name, port) = host.rsplit_once(':')?;
    if name.is_empty() || port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    // IPv6 literals only carry a port after the closing bracket
    if name.contains(':') && !name.ends_with(']') {
        return None;
    }

    Some(name)
}

/// Owns one [`BackendSupervisor`] per domain.
///
/// Entries are only ever inserted, never removed: a domain dropped from the
/// mapping keeps its supervisor and its last process.
pub struct ServiceRegistry {
    services: DashMap<String, Arc<BackendSupervisor>>,
    settings: SupervisorSettings,
}

impl ServiceRegistry {
    pub fn new(settings: SupervisorSettings) -> Arc<Self> {
        Arc::new(Self {
            services: DashMap::new(),
            settings,
        })
    }

    /// Return the supervisor for `domain`, creating an unconfigured one if absent
    pub fn get_or_create(&self, domain: &str) -> Arc<BackendSupervisor> {
        if let Some(existing) = self.services.get(domain) {
            return Arc::clone(existing.value());
        }

        let entry = self.services.entry(domain.to_string()).or_insert_with(|| {
            debug!(domain, "Creating backend supervisor");
            BackendSupervisor::new(domain, self.settings.clone())
        });
        Arc::clone(entry.value())
    }

    /// Return the supervisor for `domain` without creating one
    pub fn get(&self, domain: &str) -> Option<Arc<BackendSupervisor>> {
        self.services.get(domain).map(|s| Arc::clone(s.value()))
    }

    /// Port of the backend routed for `domain`, if it has been configured
    pub fn port_for(&self, domain: &str) -> Option<u16> {
        self.services.get(domain).and_then(|s| s.port())
    }

    /// Domain and port serving a Host header value.
    ///
    /// The whole normalized value is tried first, so `host:port` mapping
    /// keys win; then the host name without its port.
    pub fn route(&self, host: &str) -> Option<(String, u16)> {
        let key = normalize_domain(host)?;
        if let Some(port) = self.port_for(&key) {
            return Some((key, port));
        }

        let bare = strip_port(&key)?;
        self.port_for(bare).map(|port| (bare.to_string(), port))
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Stop every backend and wait for the children to exit
    pub async fn stop_all(&self) {
        let supervisors: Vec<Arc<BackendSupervisor>> =
            self.services.iter().map(|entry| Arc::clone(entry.value())).collect();

        // Signal all children first so they shut down in parallel
        let monitors: Vec<_> = supervisors.iter().filter_map(|s| s.stop()).collect();
        debug!(count = monitors.len(), "Waiting for backend processes to exit");

        for monitor in monitors {
            let _ = monitor.await;
        }
    }

    /// Status of every supervisor, sorted by domain
    pub fn list(&self) -> Vec<SupervisorStatus> {
        let mut statuses: Vec<SupervisorStatus> =
            self.services.iter().map(|entry| entry.value().status()).collect();
        statuses.sort_by(|a, b| a.domain.cmp(&b.domain));
        statuses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_does_not_create() {
        let registry = ServiceRegistry::new(SupervisorSettings::default());

        assert!(registry.get("a.test").is_none());
        assert!(registry.port_for("a.test").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_get_or_create_returns_same_supervisor() {
        let registry = ServiceRegistry::new(SupervisorSettings::default());

        let first = registry.get_or_create("a.test");
        let second = registry.get_or_create("a.test");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);

        let found = registry.get("a.test").unwrap();
        assert!(Arc::ptr_eq(&first, &found));
        assert_eq!(found.domain(), "a.test");
    }

    #[test]
    fn test_unconfigured_supervisor_has_no_port() {
        let registry = ServiceRegistry::new(SupervisorSettings::default());
        registry.get_or_create("a.test");

        assert!(registry.get("a.test").is_some());
        assert!(registry.port_for("a.test").is_none());
    }

    #[test]
    fn test_normalize_domain() {
        assert_eq!(normalize_domain("A.Test"), Some("a.test".to_string()));
        assert_eq!(normalize_domain(" my_app.test "), Some("my_app.test".to_string()));
        assert_eq!(normalize_domain("Localhost:8080"), Some("localhost:8080".to_string()));
        assert_eq!(normalize_domain(""), None);
        assert_eq!(normalize_domain("bad host"), None);
        assert_eq!(normalize_domain("a.test/path"), None);
        assert_eq!(normalize_domain("caf\u{e9}.test"), None);
        assert_eq!(normalize_domain(&"a".repeat(300)), None);
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("a.test:8080"), Some("a.test"));
        assert_eq!(strip_port("[::1]:8080"), Some("[::1]"));
        assert_eq!(strip_port("a.test"), None);
        assert_eq!(strip_port("a.test:"), None);
        assert_eq!(strip_port("a.test:http"), None);
        assert_eq!(strip_port("::1"), None);
        assert_eq!(strip_port(":80"), None);
    }

    #[tokio::test]
    async fn test_route_prefers_exact_key() {
        let dir = std::env::temp_dir();
        let registry = ServiceRegistry::new(SupervisorSettings::default());
        // Descriptors without a running child: an unknown command fails to spawn
        let command = "/nonexistent/hostmux-backend";
        registry.get_or_create("a.test").set_parameters(command, &[], &dir, 4101);
        registry.get_or_create("a.test:8080").set_parameters(command, &[], &dir, 4102);
        registry.get_or_create("my_app.test").set_parameters(command, &[], &dir, 4103);

        assert_eq!(registry.route("A.test"), Some(("a.test".to_string(), 4101)));
        assert_eq!(registry.route("a.test:8080"), Some(("a.test:8080".to_string(), 4102)));
        assert_eq!(registry.route("a.test:9090"), Some(("a.test".to_string(), 4101)));
        assert_eq!(registry.route("My_App.test:80"), Some(("my_app.test".to_string(), 4103)));
        assert_eq!(registry.route("b.test"), None);
        assert_eq!(registry.route("bad host"), None);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_list_is_sorted() {
        let registry = ServiceRegistry::new(SupervisorSettings::default());
        registry.get_or_create("c.test");
        registry.get_or_create("a.test");
        registry.get_or_create("b.test");

        let domains: Vec<String> = registry.list().into_iter().map(|s| s.domain).collect();
        assert_eq!(domains, vec!["a.test", "b.test", "c.test"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_all() {
        use crate::supervisor::SupervisorState;

        let dir = tempfile::tempdir().unwrap();
        let registry = ServiceRegistry::new(SupervisorSettings::default());
        let args = vec!["30".to_string()];
        registry.get_or_create("a.test").set_parameters("sleep", &args, dir.path(), 4900);
        registry.get_or_create("b.test").set_parameters("sleep", &args, dir.path(), 4901);
        registry.get_or_create("idle.test");

        tokio::time::timeout(std::time::Duration::from_secs(5), registry.stop_all())
            .await
            .unwrap();

        for status in registry.list() {
            assert_eq!(status.state, SupervisorState::Stopped);
            assert!(status.pid.is_none());
        }
    }

    #[test]
    fn test_concurrent_get_or_create_inserts_once() {
        let registry = ServiceRegistry::new(SupervisorSettings::default());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.get_or_create("shared.test"))
            })
            .collect();
        let supervisors: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(registry.len(), 1);
        for supervisor in &supervisors {
            assert!(Arc::ptr_eq(supervisor, &supervisors[0]));
        }
    }
}
