//! Subdomain → port mapping snapshots and change detection
//!
//! A [`Snapshot`] is the complete view produced by one discovery cycle. It is
//! never patched: the [`MappingStore`] swaps in a whole new snapshot, so a
//! request that loaded the previous one keeps seeing it unchanged.

use arc_swap::ArcSwap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Where a mapping was discovered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Default tmux server
    General,
    /// Separately named tmux server; subdomains end in `.system`
    System,
    /// Headless browser sessions; subdomains start with `browser-`
    Browser,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::General => "general",
            Source::System => "system",
            Source::Browser => "browser",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single routable service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappingEntry {
    subdomain: String,
    port: u16,
    source: Source,
}

impl MappingEntry {
    /// Returns `None` for port 0 or a subdomain that is not hostname-safe
    pub fn new(subdomain: impl Into<String>, port: u16, source: Source) -> Option<Self> {
        let subdomain = subdomain.into();
        if port == 0 || !is_routable_subdomain(&subdomain) {
            return None;
        }
        Some(Self {
            subdomain,
            port,
            source,
        })
    }

    pub fn subdomain(&self) -> &str {
        &self.subdomain
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn source(&self) -> Source {
        self.source
    }
}

/// Whether `subdomain` can appear in a Host header.
///
/// Every dot-separated label must be 1 to 63 ASCII letters, digits, `-` or
/// `_`, and may not begin or end with `-`.
pub fn is_routable_subdomain(subdomain: &str) -> bool {
    !subdomain.is_empty()
        && subdomain.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        })
}

/// Parse a port advertised by a session.
///
/// Only plain ASCII digits in `1..=65535` are accepted.
pub fn parse_port(raw: &str) -> Option<u16> {
    let raw = raw.trim();
    if raw.is_empty() || raw.len() > 5 || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match raw.parse::<u32>() {
        Ok(port @ 1..=65535) => u16::try_from(port).ok(),
        _ => None,
    }
}

/// Known subdomains grouped by source, as listed in error responses
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AvailableSubdomains {
    pub general: Vec<String>,
    pub system: Vec<String>,
    pub browser: Vec<String>,
}

impl AvailableSubdomains {
    pub fn is_empty(&self) -> bool {
        self.general.is_empty() && self.system.is_empty() && self.browser.is_empty()
    }
}

/// The world as of one completed discovery cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    entries: BTreeMap<String, MappingEntry>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry; a later insert for the same subdomain replaces it
    pub fn insert(&mut self, entry: MappingEntry) {
        self.entries.insert(entry.subdomain.clone(), entry);
    }

    pub fn get(&self, subdomain: &str) -> Option<&MappingEntry> {
        self.entries.get(subdomain)
    }

    /// Look up a request key: exact match first, then ASCII case-insensitive
    pub fn resolve(&self, key: &str) -> Option<&MappingEntry> {
        self.entries.get(key).or_else(|| {
            self.entries
                .values()
                .find(|entry| entry.subdomain.eq_ignore_ascii_case(key))
        })
    }

    pub fn contains(&self, subdomain: &str) -> bool {
        self.entries.contains_key(subdomain)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MappingEntry> {
        self.entries.values()
    }

    /// Merge another snapshot into this one, overwriting shared keys
    pub fn extend(&mut self, other: Snapshot) {
        self.entries.extend(other.entries);
    }

    pub fn available(&self) -> AvailableSubdomains {
        let mut available = AvailableSubdomains::default();
        for entry in self.iter() {
            let bucket = match entry.source {
                Source::General => &mut available.general,
                Source::System => &mut available.system,
                Source::Browser => &mut available.browser,
            };
            bucket.push(entry.subdomain.clone());
        }
        available
    }
}

impl FromIterator<MappingEntry> for Snapshot {
    fn from_iter<I: IntoIterator<Item = MappingEntry>>(iter: I) -> Self {
        let mut snapshot = Snapshot::new();
        for entry in iter {
            snapshot.insert(entry);
        }
        snapshot
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("(none)");
        }
        for (i, entry) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{} -> {}", entry.subdomain, entry.port)?;
        }
        Ok(())
    }
}

/// Difference between two snapshots
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Change {
    /// New subdomains, and existing ones whose port changed
    pub added: BTreeMap<String, MappingEntry>,
    /// Subdomains present before but gone now
    pub removed: Vec<String>,
}

impl Change {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Compute what changed going from `old` to `new`
pub fn diff(old: &Snapshot, new: &Snapshot) -> Change {
    let added = new
        .iter()
        .filter(|entry| old.get(&entry.subdomain).map(|prev| prev.port) != Some(entry.port))
        .map(|entry| (entry.subdomain.clone(), entry.clone()))
        .collect();

    let removed = old
        .iter()
        .filter(|entry| !new.contains(&entry.subdomain))
        .map(|entry| entry.subdomain.clone())
        .collect();

    Change { added, removed }
}

/// Holds the current snapshot.
///
/// Single writer (the polling scheduler), many readers (request handlers).
/// Publishing is a pointer swap, so readers never see a half-built snapshot.
pub struct MappingStore {
    current: ArcSwap<Snapshot>,
}

impl MappingStore {
    pub fn new() -> Self {
        Self::with_snapshot(Snapshot::new())
    }

    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            current: ArcSwap::from_pointee(snapshot),
        }
    }

    /// The snapshot as of the last completed cycle
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    /// Replace the current snapshot, returning the one it replaced
    pub fn publish(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        self.current.swap(Arc::new(snapshot))
    }
}

impl Default for MappingStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(subdomain: &str, port: u16, source: Source) -> MappingEntry {
        MappingEntry::new(subdomain, port, source).unwrap()
    }

    fn snapshot(entries: &[(&str, u16)]) -> Snapshot {
        entries
            .iter()
            .map(|(sub, port)| entry(sub, *port, Source::General))
            .collect()
    }

    #[test]
    fn test_entry_rejects_port_zero() {
        assert!(MappingEntry::new("app", 0, Source::General).is_none());
        assert!(MappingEntry::new("app", 1, Source::General).is_some());
        assert!(MappingEntry::new("app", 65535, Source::General).is_some());
    }

    #[test]
    fn test_entry_rejects_unroutable_subdomain() {
        assert!(MappingEntry::new("it's mine", 3000, Source::General).is_none());
        assert!(MappingEntry::new("my app", 3000, Source::General).is_none());
        assert!(MappingEntry::new("", 3000, Source::General).is_none());
        assert!(MappingEntry::new("web.system", 3000, Source::System).is_some());
    }

    #[test]
    fn test_routable_subdomain() {
        assert!(is_routable_subdomain("web"));
        assert!(is_routable_subdomain("web-00002"));
        assert!(is_routable_subdomain("my_app"));
        assert!(is_routable_subdomain("db.system"));
        assert!(is_routable_subdomain("browser-cdp-shop"));
        assert!(!is_routable_subdomain("-web"));
        assert!(!is_routable_subdomain("web-"));
        assert!(!is_routable_subdomain("web..system"));
        assert!(!is_routable_subdomain(".system"));
        assert!(!is_routable_subdomain("café"));
        assert!(!is_routable_subdomain("a/b"));
        assert!(!is_routable_subdomain(&"x".repeat(64)));
    }

    #[test]
    fn test_parse_port() {
        assert_eq!(parse_port("3000"), Some(3000));
        assert_eq!(parse_port(" 8080\n"), Some(8080));
        assert_eq!(parse_port("1"), Some(1));
        assert_eq!(parse_port("65535"), Some(65535));
        assert_eq!(parse_port("0"), None);
        assert_eq!(parse_port("65536"), None);
        assert_eq!(parse_port("99999999999"), None);
        assert_eq!(parse_port("-1"), None);
        assert_eq!(parse_port("+80"), None);
        assert_eq!(parse_port("80a"), None);
        assert_eq!(parse_port(""), None);
    }

    #[test]
    fn test_last_insert_wins() {
        let mut snap = Snapshot::new();
        snap.insert(entry("app", 3000, Source::General));
        snap.insert(entry("app", 4000, Source::General));
        assert_eq!(snap.len(), 1);
        assert_eq!(snap.get("app").unwrap().port(), 4000);
    }

    #[test]
    fn test_diff_identical_is_empty() {
        let a = snapshot(&[("alpha", 4000), ("beta", 4001)]);
        let change = diff(&a, &a);
        assert!(change.added.is_empty());
        assert!(change.removed.is_empty());
        assert!(change.is_empty());

        let empty = Snapshot::new();
        assert!(diff(&empty, &empty).is_empty());
    }

    #[test]
    fn test_diff_added_changed_removed() {
        let old = snapshot(&[("alpha", 4000), ("beta", 4001), ("gamma", 4002)]);
        let new = snapshot(&[("alpha", 4000), ("beta", 5001), ("delta", 4003)]);

        let change = diff(&old, &new);

        assert_eq!(change.added.len(), 2);
        assert_eq!(change.added["beta"].port(), 5001);
        assert_eq!(change.added["delta"].port(), 4003);
        assert!(!change.added.contains_key("alpha"));
        assert_eq!(change.removed, vec!["gamma".to_string()]);
    }

    #[test]
    fn test_diff_to_empty_removes_everything() {
        let old = snapshot(&[("alpha", 4000)]);
        let change = diff(&old, &Snapshot::new());
        assert!(change.added.is_empty());
        assert_eq!(change.removed, vec!["alpha".to_string()]);
    }

    #[test]
    fn test_diff_is_independent_of_insertion_order() {
        let a = snapshot(&[("alpha", 1), ("beta", 2), ("gamma", 3)]);
        let b = snapshot(&[("gamma", 3), ("alpha", 1), ("beta", 2)]);
        assert!(diff(&a, &b).is_empty());
    }

    #[test]
    fn test_resolve_falls_back_to_case_insensitive() {
        let snap: Snapshot = [entry("MyApp", 3000, Source::General)].into_iter().collect();
        assert_eq!(snap.resolve("MyApp").unwrap().port(), 3000);
        assert_eq!(snap.resolve("myapp").unwrap().port(), 3000);
        assert!(snap.resolve("other").is_none());
    }

    #[test]
    fn test_available_groups_by_source() {
        let snap: Snapshot = [
            entry("web", 3000, Source::General),
            entry("db.system", 5432, Source::System),
            entry("browser-cdp-web", 9222, Source::Browser),
            entry("api", 3001, Source::General),
        ]
        .into_iter()
        .collect();

        let available = snap.available();
        assert_eq!(available.general, vec!["api", "web"]);
        assert_eq!(available.system, vec!["db.system"]);
        assert_eq!(available.browser, vec!["browser-cdp-web"]);

        let json = serde_json::to_value(&available).unwrap();
        assert_eq!(json["system"][0], "db.system");
    }

    #[test]
    fn test_store_publish_swaps_whole_snapshot() {
        let store = MappingStore::new();
        let before = store.snapshot();
        assert!(before.is_empty());

        let previous = store.publish(snapshot(&[("alpha", 4000)]));
        assert!(previous.is_empty());

        // A reader holding the old snapshot is unaffected by the publish
        assert!(before.is_empty());
        assert_eq!(store.snapshot().get("alpha").unwrap().port(), 4000);
    }

    #[test]
    fn test_snapshot_display() {
        assert_eq!(Snapshot::new().to_string(), "(none)");
        let snap = snapshot(&[("beta", 2), ("alpha", 1)]);
        assert_eq!(snap.to_string(), "alpha -> 1, beta -> 2");
    }
}
