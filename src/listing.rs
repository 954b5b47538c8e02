//! Plain-text rendering of the current mappings for the `list` command

use crate::error_page::service_url;
use crate::mapping::{Snapshot, Source};
use crate::transport::Target;

/// Scheme and base authority services are reachable at on this machine.
///
/// The port is omitted when it is the scheme's default.
pub fn public_base(port: u16, tls: bool) -> (&'static str, String) {
    let (scheme, default_port) = if tls { ("https", 443) } else { ("http", 80) };
    let base = if port == default_port {
        "localhost".to_string()
    } else {
        format!("localhost:{}", port)
    };
    (scheme, base)
}

fn heading(target: &Target) -> String {
    match target {
        Target::Local => "Active Proxy Mappings".to_string(),
        Target::Remote(host) => format!("Active Proxy Mappings on {}", host.as_str()),
    }
}

fn empty_hint(target: &Target) -> String {
    let ssh_prefix = match target {
        Target::Local => String::new(),
        Target::Remote(host) => format!("ssh {} ", host.as_str()),
    };
    format!(
        "No active tmux sessions with PORT environment variable found.\n\n\
         To create a mapping:\n\
         1. Start a tmux session: {ssh_prefix}tmux new -s myapp\n\
         2. Set PORT variable: export PORT=3000\n\
         3. Start your app\n"
    )
}

/// Render every mapping as `subdomain → port` followed by its URL
pub fn render_listing(snapshot: &Snapshot, target: &Target, base: &str, scheme: &str) -> String {
    let mut out = format!("{}\n\n", heading(target));

    if snapshot.is_empty() {
        out.push_str(&empty_hint(target));
        return out;
    }

    out.push_str("Subdomain → Port\n\n");

    for (label, source) in [
        ("General", Source::General),
        ("Browser", Source::Browser),
        ("System", Source::System),
    ] {
        let mut entries = snapshot.iter().filter(|e| e.source() == source).peekable();
        if entries.peek().is_none() {
            continue;
        }

        out.push_str(&format!("{}:\n", label));
        for entry in entries {
            out.push_str(&format!("  {} → {}\n", entry.subdomain(), entry.port()));
            out.push_str(&format!(
                "    {}\n",
                service_url(entry.subdomain(), base, scheme)
            ));
        }
        out.push('\n');
    }

    let count = snapshot.len();
    out.push_str(&format!(
        "Found {} active mapping{}\n",
        count,
        if count == 1 { "" } else { "s" }
    ));
    out
}
