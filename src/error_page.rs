//! HTML failure pages
//!
//! Pure functions of their inputs. Every interpolated value is HTML-escaped
//! since hosts and session names come from outside the proxy.

use crate::discovery::SYSTEM_SUFFIX;
use crate::mapping::Snapshot;
use crate::routing::{strip_port, HostKey};

const STYLE: &str = "body {
  background: #000;
  color: #0f0;
  font-family: monospace;
  padding: 20px;
  line-height: 1.6;
}
a {
  color: #0ff;
}
a:hover {
  color: #fff;
}";

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// The part of `request_host` shared by every service, port included.
///
/// `api.dev.localhost:8443` → `dev.localhost:8443`,
/// `db.system.dev.localhost` → `dev.localhost`.
pub fn service_base(request_host: &str) -> String {
    let hostname = strip_port(request_host);
    let port = &request_host[hostname.len()..];

    let skip = HostKey::parse(request_host).label_count();
    let base = hostname
        .splitn(skip + 1, '.')
        .last()
        .unwrap_or(hostname);

    format!("{}{}", base, port)
}

/// URL a service is reachable at, given the shared base authority
pub fn service_url(subdomain: &str, base: &str, scheme: &str) -> String {
    match subdomain.strip_suffix(SYSTEM_SUFFIX) {
        Some(name) => format!("{}://{}{}.{}", scheme, name, SYSTEM_SUFFIX, base),
        None => format!("{}://{}.{}", scheme, subdomain, base),
    }
}

fn page(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<title>{title}</title>\n<style>\n{STYLE}\n</style>\n</head>\n<body>\n<pre>\n{body}</pre>\n</body>\n</html>\n"
    )
}

fn service_links(heading: &str, subdomains: &[String], base: &str, scheme: &str) -> String {
    if subdomains.is_empty() {
        return String::new();
    }
    let mut section = format!("{}:\n", heading);
    for subdomain in subdomains {
        let url = escape_html(&service_url(subdomain, base, scheme));
        section.push_str(&format!("  <a href=\"{url}\">{url}</a>\n"));
    }
    section.push('\n');
    section
}

/// 503 page for a lookup key with no mapping; lists everything known
pub fn render_unmapped_page(
    lookup_key: &str,
    snapshot: &Snapshot,
    request_host: &str,
    scheme: &str,
) -> String {
    let base = service_base(request_host);
    let available = snapshot.available();

    let mut services = String::new();
    services.push_str(&service_links("General services", &available.general, &base, scheme));
    services.push_str(&service_links("Browser services", &available.browser, &base, scheme));
    services.push_str(&service_links("System services", &available.system, &base, scheme));
    if services.is_empty() {
        services.push_str("No services available\n\n");
    }

    let key = escape_html(lookup_key);
    let body = format!(
        "503 Service Unavailable\n\n\
         No service found for subdomain: {key}\n\n\
         {services}\
         To start a service:\n\
         - Run it in a tmux session named '{key}'\n\
         - Set the PORT environment variable in that session\n"
    );
    page("503 Service Unavailable", &body)
}

/// 404 page for a request whose host carries no subdomain
pub fn render_no_subdomain_page(request_host: &str, scheme: &str) -> String {
    let host = escape_html(request_host);
    let body = format!(
        "404 Not Found\n\n\
         No subdomain specified in request: {host}\n\n\
         Usage:\n  \
         {scheme}://myapp.{host}\n  \
         {scheme}://api.system.{host}\n\n\
         The subdomain is the tmux session name.\n"
    );
    page("404 Not Found", &body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{MappingEntry, Source};

    fn snapshot() -> Snapshot {
        [
            MappingEntry::new("web", 3000, Source::General).unwrap(),
            MappingEntry::new("db.system", 5432, Source::System).unwrap(),
            MappingEntry::new("browser-cdp-web", 9222, Source::Browser).unwrap(),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_service_base() {
        assert_eq!(service_base("api.dev.localhost"), "dev.localhost");
        assert_eq!(service_base("api.dev.localhost:8443"), "dev.localhost:8443");
        assert_eq!(service_base("db.system.dev.localhost"), "dev.localhost");
        assert_eq!(service_base("localhost:3000"), "localhost:3000");
    }

    #[test]
    fn test_service_url() {
        assert_eq!(
            service_url("web", "dev.localhost", "https"),
            "https://web.dev.localhost"
        );
        assert_eq!(
            service_url("db.system", "dev.localhost:8080", "http"),
            "http://db.system.dev.localhost:8080"
        );
    }

    #[test]
    fn test_unmapped_page_lists_services_by_source() {
        let html = render_unmapped_page("api", &snapshot(), "api.dev.localhost", "https");

        assert!(html.contains("<title>503 Service Unavailable</title>"));
        assert!(html.contains("No service found for subdomain: api"));
        assert!(html.contains("General services:"));
        assert!(html.contains("<a href=\"https://web.dev.localhost\">"));
        assert!(html.contains("System services:"));
        assert!(html.contains("<a href=\"https://db.system.dev.localhost\">"));
        assert!(html.contains("Browser services:"));
        assert!(html.contains("https://browser-cdp-web.dev.localhost"));
        assert!(!html.contains("No services available"));
    }

    #[test]
    fn test_system_request_host_builds_correct_links() {
        let html = render_unmapped_page("cache.system", &snapshot(), "cache.system.dev.localhost", "http");
        assert!(html.contains("http://db.system.dev.localhost"));
        assert!(html.contains("http://web.dev.localhost"));
        assert!(!html.contains("system.system"));
    }

    #[test]
    fn test_unmapped_page_with_no_services() {
        let html = render_unmapped_page("api", &Snapshot::new(), "api.localhost", "http");
        assert!(html.contains("No services available"));
        assert!(!html.contains("General services:"));
    }

    #[test]
    fn test_pages_escape_input() {
        let html = render_unmapped_page("<script>", &Snapshot::new(), "x.localhost", "http");
        assert!(!html.contains("<script>"));
        assert!(html.contains("&lt;script&gt;"));

        let html = render_no_subdomain_page("\"><b>", "http");
        assert!(!html.contains("\"><b>"));
    }

    #[test]
    fn test_no_subdomain_page() {
        let html = render_no_subdomain_page("localhost:8080", "http");
        assert!(html.contains("<title>404 Not Found</title>"));
        assert!(html.contains("No subdomain specified in request: localhost:8080"));
        assert!(html.contains("http://myapp.localhost:8080"));
    }
}
