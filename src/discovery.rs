//! Session discovery
//!
//! Builds a [`Snapshot`] by asking the target host which sessions are live
//! and which ports they advertise. Three sources are consulted:
//!
//! - the default tmux server (`general`)
//! - a separately named tmux server (`system`, subdomains get `.system`)
//! - an optional headless-browser session lister (`browser`)
//!
//! Each source fails on its own: a broken source contributes nothing and the
//! others still count. Only an unreachable remote target skips the cycle.

use crate::config::DiscoveryConfig;
use crate::mapping::{is_routable_subdomain, parse_port, MappingEntry, Snapshot, Source};
use crate::transport::{quote, CommandRunner, TransportError};
use futures::future::BoxFuture;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Suffix appended to subdomains from the system tmux server
pub const SYSTEM_SUFFIX: &str = ".system";

/// Prefix for subdomains from browser sessions
pub const BROWSER_PREFIX: &str = "browser-";

/// Environment variable a session sets to advertise its port
const PORT_VARIABLE: &str = "PORT";

/// Session suffix that collapses to the bare project name
const FIRST_SESSION: &str = "00001";

/// Produces a fresh snapshot of the target's sessions.
pub trait Discover: Send + Sync {
    /// `None` means the cycle was skipped and the previous snapshot stands
    fn discover(&self) -> BoxFuture<'_, Option<Snapshot>>;
}

/// Map a raw session name to its subdomain label.
///
/// - `<proj>-session-00001` → `<proj>`
/// - `<proj>-session-<N>` → `<proj>-<N>`
/// - `<proj>-worktree-<N>` → `<proj>-<N>`
///
/// Anything else is returned unchanged.
pub fn normalize_session_name(name: &str) -> String {
    if let Some((project, number)) = split_numbered(name, "-session-") {
        if number == FIRST_SESSION {
            return project.to_string();
        }
        return format!("{}-{}", project, number);
    }
    if let Some((project, number)) = split_numbered(name, "-worktree-") {
        return format!("{}-{}", project, number);
    }
    name.to_string()
}

/// Split `<project><marker><digits>`, requiring both halves to be non-empty
fn split_numbered<'a>(name: &'a str, marker: &str) -> Option<(&'a str, &'a str)> {
    let (project, number) = name.rsplit_once(marker)?;
    if project.is_empty() || number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((project, number))
}

/// Whether a tmux failure just means nobody started that server
fn is_no_server(err: &TransportError) -> bool {
    err.stderr().is_some_and(|stderr| {
        stderr.contains("no server running") || stderr.contains("error connecting to")
    })
}

/// Extract the port from `show-environment` output (`PORT=<digits>`)
fn parse_port_line(output: &str) -> Option<&str> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix(PORT_VARIABLE)?.strip_prefix('='))
}

#[derive(Debug, Deserialize)]
struct BrowserSession {
    name: String,
    status: String,
    #[serde(default)]
    ports: BTreeMap<String, BrowserPort>,
}

#[derive(Debug, Deserialize)]
struct BrowserPort {
    port: serde_json::Value,
}

impl BrowserPort {
    fn port(&self) -> Option<u16> {
        match &self.port {
            serde_json::Value::Number(n) => n.as_u64().and_then(|p| parse_port(&p.to_string())),
            serde_json::Value::String(s) => parse_port(s),
            _ => None,
        }
    }
}

/// Parse the browser lister's JSON into entries, skipping stopped sessions
fn parse_browser_sessions(json: &str) -> Result<Snapshot, serde_json::Error> {
    let sessions: Vec<BrowserSession> = serde_json::from_str(json)?;
    let mut snapshot = Snapshot::new();

    for session in sessions {
        if session.status != "running" {
            continue;
        }
        let name = normalize_session_name(&session.name);
        for (port_name, port) in &session.ports {
            let subdomain = format!("{}{}-{}", BROWSER_PREFIX, port_name, name);
            if !is_routable_subdomain(&subdomain) {
                warn!(
                    session = %session.name,
                    subdomain = %subdomain,
                    "Ignoring browser session whose name is not a valid hostname label"
                );
                continue;
            }
            match port.port().and_then(|p| MappingEntry::new(&subdomain, p, Source::Browser)) {
                Some(entry) => snapshot.insert(entry),
                None => warn!(
                    session = %session.name,
                    port_name = %port_name,
                    value = %port.port,
                    "Ignoring browser session with invalid port"
                ),
            }
        }
    }

    Ok(snapshot)
}

/// A tmux server to query
struct TmuxServer<'a> {
    socket: Option<&'a str>,
    source: Source,
}

impl TmuxServer<'_> {
    fn subdomain(&self, session: &str) -> String {
        let name = normalize_session_name(session);
        match self.source {
            Source::System => format!("{}{}", name, SYSTEM_SUFFIX),
            _ => name,
        }
    }
}

/// Discovers sessions through a [`CommandRunner`]
pub struct SessionDiscovery {
    runner: Arc<dyn CommandRunner>,
    tmux_bin: String,
    system_socket: String,
    browser_list_command: Option<String>,
}

impl SessionDiscovery {
    pub fn new(runner: Arc<dyn CommandRunner>, config: &DiscoveryConfig) -> Self {
        Self {
            runner,
            tmux_bin: config.tmux_bin.clone(),
            system_socket: config.system_socket.clone(),
            browser_list_command: config.browser_list_command.clone(),
        }
    }

    /// Run every source once and merge the results.
    ///
    /// Returns `None` when the target could not be reached.
    pub async fn discover_sessions(&self) -> Option<Snapshot> {
        if let Err(e) = self.runner.check_reachable().await {
            warn!(target_host = %self.runner.target(), error = %e, "Target unreachable, skipping discovery cycle");
            return None;
        }

        let general = TmuxServer {
            socket: None,
            source: Source::General,
        };
        let system = TmuxServer {
            socket: Some(&self.system_socket),
            source: Source::System,
        };

        let (general, system, browser) = tokio::join!(
            self.query_tmux(&general),
            self.query_tmux(&system),
            self.query_browser(),
        );

        let mut snapshot = general;
        snapshot.extend(system);
        snapshot.extend(browser);
        Some(snapshot)
    }

    fn tmux_command(&self, server: &TmuxServer<'_>, args: &[&str]) -> String {
        let mut parts = vec![quote(&self.tmux_bin).into_owned()];
        if let Some(socket) = server.socket {
            parts.push("-L".to_string());
            parts.push(quote(socket).into_owned());
        }
        parts.extend(args.iter().map(|arg| quote(arg).into_owned()));
        parts.join(" ")
    }

    async fn query_tmux(&self, server: &TmuxServer<'_>) -> Snapshot {
        let mut snapshot = Snapshot::new();
        let source = server.source;

        let list = self.tmux_command(server, &["list-sessions", "-F", "#{session_name}"]);
        let output = match self.runner.execute(&list).await {
            Ok(output) => output,
            Err(e) if is_no_server(&e) => {
                debug!(%source, "No tmux server running");
                return snapshot;
            }
            Err(e) => {
                error!(%source, error = %e, "Failed to list tmux sessions");
                return snapshot;
            }
        };

        for session in output.lines().map(str::trim).filter(|s| !s.is_empty()) {
            // `=` makes tmux match the session name exactly
            let exact_target = format!("={}", session);
            let query = self.tmux_command(
                server,
                &["show-environment", "-t", &exact_target, PORT_VARIABLE],
            );

            let env = match self.runner.execute(&query).await {
                Ok(env) => env,
                Err(e) => {
                    debug!(%source, session, error = %e, "No PORT set for tmux session");
                    continue;
                }
            };

            let Some(raw_port) = parse_port_line(&env) else {
                debug!(%source, session, "No PORT set for tmux session");
                continue;
            };

            let subdomain = server.subdomain(session);
            if !is_routable_subdomain(&subdomain) {
                warn!(%source, session, subdomain = %subdomain, "Ignoring tmux session whose name is not a valid hostname label");
                continue;
            }
            match parse_port(raw_port).and_then(|port| MappingEntry::new(&subdomain, port, source)) {
                Some(entry) => {
                    debug!(%source, session, subdomain = %subdomain, port = entry.port(), "Found PORT for tmux session");
                    snapshot.insert(entry);
                }
                None => {
                    warn!(%source, session, value = raw_port, "Ignoring tmux session with invalid PORT");
                }
            }
        }

        snapshot
    }

    async fn query_browser(&self) -> Snapshot {
        let Some(command) = &self.browser_list_command else {
            return Snapshot::new();
        };

        let output = match self.runner.execute(command).await {
            Ok(output) => output,
            Err(e) if e.is_not_found() => {
                debug!(command = %command, "Browser session lister not installed");
                return Snapshot::new();
            }
            Err(e) => {
                error!(command = %command, error = %e, "Failed to list browser sessions");
                return Snapshot::new();
            }
        };

        parse_browser_sessions(&output).unwrap_or_else(|e| {
            error!(command = %command, error = %e, "Failed to parse browser session list");
            Snapshot::new()
        })
    }
}

impl Discover for SessionDiscovery {
    fn discover(&self) -> BoxFuture<'_, Option<Snapshot>> {
        Box::pin(self.discover_sessions())
    }
}
