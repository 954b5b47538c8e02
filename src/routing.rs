//! Host header → mapping resolution
//!
//! Routing is driven entirely by the Host header. The rules, in order:
//!
//! 1. `<name>.system.<rest>` looks up `<name>.system`
//! 2. any other host with a dot looks up its first label
//! 3. a host with no usable label has no subdomain

use crate::mapping::{MappingEntry, Snapshot};

/// Lookup key extracted from a Host header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKey {
    NoSubdomain,
    /// First label of the host
    Labeled(String),
    /// `<name>.system`, from a `<name>.system.<rest>` host
    SystemLabeled(String),
}

impl HostKey {
    pub fn parse(host: &str) -> Self {
        let hostname = strip_port(host).trim_end_matches('.');
        if hostname.is_empty() {
            return HostKey::NoSubdomain;
        }

        let labels: Vec<&str> = hostname.split('.').collect();
        if labels.len() < 2 || labels[0].is_empty() {
            return HostKey::NoSubdomain;
        }

        if labels.len() >= 3 && labels[1].eq_ignore_ascii_case("system") && !labels[2].is_empty() {
            return HostKey::SystemLabeled(format!("{}.system", labels[0]));
        }

        HostKey::Labeled(labels[0].to_string())
    }

    pub fn lookup_key(&self) -> Option<&str> {
        match self {
            HostKey::NoSubdomain => None,
            HostKey::Labeled(key) | HostKey::SystemLabeled(key) => Some(key.as_str()),
        }
    }

    /// Number of leading host labels the key consumes
    pub fn label_count(&self) -> usize {
        match self {
            HostKey::NoSubdomain => 0,
            HostKey::Labeled(_) => 1,
            HostKey::SystemLabeled(_) => 2,
        }
    }
}

/// Drop a trailing `:port`; bracketed IPv6 literals are returned whole
pub fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return host;
    }
    host.split(':').next().unwrap_or(host)
}

/// Result of routing one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(MappingEntry),
    /// A lookup key was present but nothing is mapped to it
    Unmapped(String),
    NoSubdomain,
}

/// Resolve a request's Host header against `snapshot`
pub fn resolve(host: Option<&str>, snapshot: &Snapshot) -> Resolution {
    let key = match host.map(HostKey::parse) {
        Some(key) => key,
        None => return Resolution::NoSubdomain,
    };

    match key.lookup_key() {
        None => Resolution::NoSubdomain,
        Some(lookup) => match snapshot.resolve(lookup) {
            Some(entry) => Resolution::Resolved(entry.clone()),
            None => Resolution::Unmapped(lookup.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::Source;

    #[test]
    fn test_first_label() {
        assert_eq!(
            HostKey::parse("foo.bar.example.com"),
            HostKey::Labeled("foo".to_string())
        );
        assert_eq!(
            HostKey::parse("api.dev.localhost:8443"),
            HostKey::Labeled("api".to_string())
        );
    }

    #[test]
    fn test_system_label() {
        assert_eq!(
            HostKey::parse("svc.system.dev.example.com"),
            HostKey::SystemLabeled("svc.system".to_string())
        );
        assert_eq!(
            HostKey::parse("svc.system.localhost:80"),
            HostKey::SystemLabeled("svc.system".to_string())
        );
    }

    #[test]
    fn test_system_without_rest_is_plain_label() {
        assert_eq!(
            HostKey::parse("svc.system"),
            HostKey::Labeled("svc".to_string())
        );
    }

    #[test]
    fn test_no_subdomain() {
        assert_eq!(HostKey::parse("localhost"), HostKey::NoSubdomain);
        assert_eq!(HostKey::parse("localhost:3000"), HostKey::NoSubdomain);
        assert_eq!(HostKey::parse(""), HostKey::NoSubdomain);
        assert_eq!(HostKey::parse(".localhost"), HostKey::NoSubdomain);
        assert_eq!(HostKey::parse("[::1]:8080"), HostKey::NoSubdomain);
    }

    #[test]
    fn test_trailing_dot_is_ignored() {
        assert_eq!(
            HostKey::parse("app.localhost."),
            HostKey::Labeled("app".to_string())
        );
        assert_eq!(HostKey::parse("localhost."), HostKey::NoSubdomain);
    }

    #[test]
    fn test_label_count() {
        assert_eq!(HostKey::NoSubdomain.label_count(), 0);
        assert_eq!(HostKey::parse("a.b.c").label_count(), 1);
        assert_eq!(HostKey::parse("a.system.c").label_count(), 2);
    }

    #[test]
    fn test_resolve() {
        let snapshot: Snapshot = [
            MappingEntry::new("web", 3000, Source::General).unwrap(),
            MappingEntry::new("db.system", 5432, Source::System).unwrap(),
        ]
        .into_iter()
        .collect();

        match resolve(Some("web.dev.localhost"), &snapshot) {
            Resolution::Resolved(entry) => assert_eq!(entry.port(), 3000),
            other => panic!("unexpected: {other:?}"),
        }
        match resolve(Some("db.system.dev.localhost"), &snapshot) {
            Resolution::Resolved(entry) => assert_eq!(entry.port(), 5432),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(
            resolve(Some("api.dev.localhost"), &snapshot),
            Resolution::Unmapped("api".to_string())
        );
        assert_eq!(
            resolve(Some("db.dev.localhost"), &snapshot),
            Resolution::Unmapped("db".to_string())
        );
        assert_eq!(resolve(Some("localhost"), &snapshot), Resolution::NoSubdomain);
        assert_eq!(resolve(None, &snapshot), Resolution::NoSubdomain);
    }
}
