use crate::transport::Target;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and forwarding configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Where and how sessions are discovered
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Desktop notifications for mapping changes
    #[serde(default)]
    pub notifications: NotificationConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port (default: 80)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// HTTPS port used when certificates are present (default: 443)
    #[serde(default = "default_tls_port")]
    pub tls_port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Serve HTTPS when the certificate pair exists (default: true)
    #[serde(default = "default_true")]
    pub tls: bool,

    /// Path to TLS certificate file (PEM format)
    pub tls_cert: Option<String>,

    /// Path to TLS private key file (PEM format)
    pub tls_key: Option<String>,

    /// Redirect plain HTTP to HTTPS while TLS is active (default: true)
    #[serde(default = "default_true")]
    pub force_https: bool,

    /// Host that discovered ports are dialed on (default: localhost)
    #[serde(default = "default_upstream_host")]
    pub upstream_host: String,

    /// Seconds to wait for upstream response headers (default: 60)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections per upstream (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ServerConfig {
    /// Certificate and key paths, falling back to `~/.sessiongate/certs`
    pub fn certificate_paths(&self) -> Option<(PathBuf, PathBuf)> {
        match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => Some((PathBuf::from(cert), PathBuf::from(key))),
            (None, None) => {
                let certs = config_directory()?.join("certs");
                Some((certs.join("cert.pem"), certs.join("key.pem")))
            }
            _ => None,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            tls_port: default_tls_port(),
            bind: default_bind_address(),
            tls: true,
            tls_cert: None,
            tls_key: None,
            force_https: true,
            upstream_host: default_upstream_host(),
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscoveryConfig {
    /// `local`, or a host reachable with `ssh` (default: local)
    #[serde(default = "default_target")]
    pub target: String,

    /// Milliseconds between discovery cycles (default: 3000)
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// tmux executable on the target (default: tmux)
    #[serde(default = "default_tmux_bin")]
    pub tmux_bin: String,

    /// Socket name of the system tmux server (default: tmux-composer-system)
    #[serde(default = "default_system_socket")]
    pub system_socket: String,

    /// Command printing browser sessions as JSON; unset disables the source
    pub browser_list_command: Option<String>,

    /// Seconds allowed for the ssh reachability probe (default: 5)
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Seconds allowed for each list/query command (default: 10)
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

impl DiscoveryConfig {
    pub fn target(&self) -> anyhow::Result<Target> {
        Ok(Target::parse(&self.target)?)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            target: default_target(),
            interval_ms: default_interval_ms(),
            tmux_bin: default_tmux_bin(),
            system_socket: default_system_socket(),
            browser_list_command: None,
            probe_timeout_secs: default_probe_timeout(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotificationConfig {
    /// Send desktop notifications (default: true)
    #[serde(default = "default_true")]
    pub desktop: bool,

    /// Notification program, invoked as `<command> -t <ms> <title> <body>`
    #[serde(default = "default_notify_command")]
    pub command: String,

    /// How long notifications stay visible, in milliseconds (default: 12000)
    #[serde(default = "default_notify_timeout")]
    pub timeout_ms: u32,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            desktop: true,
            command: default_notify_command(),
            timeout_ms: default_notify_timeout(),
        }
    }
}

/// Per-user state directory (`~/.sessiongate`)
pub fn config_directory() -> Option<PathBuf> {
    dirs_next::home_dir().map(|home| home.join(".sessiongate"))
}

fn default_true() -> bool {
    true
}

fn default_listen_port() -> u16 {
    80
}

fn default_tls_port() -> u16 {
    443
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_upstream_host() -> String {
    "localhost".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_target() -> String {
    "local".to_string()
}

fn default_interval_ms() -> u64 {
    3000
}

fn default_tmux_bin() -> String {
    "tmux".to_string()
}

fn default_system_socket() -> String {
    "tmux-composer-system".to_string()
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_command_timeout() -> u64 {
    10
}

fn default_notify_command() -> String {
    "notify-send".to_string()
}

fn default_notify_timeout() -> u32 {
    12000
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = Target::parse(&self.discovery.target) {
            errors.push(format!("discovery.target: {}", e));
        }
        if self.discovery.interval_ms == 0 {
            errors.push("discovery.interval_ms must be greater than 0".to_string());
        }
        if self.discovery.probe_timeout_secs == 0 {
            errors.push("discovery.probe_timeout_secs must be greater than 0".to_string());
        }
        if self.server.tls_cert.is_some() != self.server.tls_key.is_some() {
            errors.push("server.tls_cert and server.tls_key must be set together".to_string());
        }
        if self.server.request_timeout_secs == 0 {
            errors.push("server.request_timeout_secs must be greater than 0".to_string());
        }
        if self.server.upstream_host.trim().is_empty() {
            errors.push("server.upstream_host must not be empty".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 8080
bind = "127.0.0.1"
upstream_host = "127.0.0.1"
tls = false

[discovery]
target = "devbox"
interval_ms = 1000
browser_list_command = "agent-browser sessions --json"

[notifications]
desktop = false
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.upstream_host, "127.0.0.1");
        assert!(!config.server.tls);
        assert_eq!(config.discovery.target, "devbox");
        assert_eq!(config.discovery.interval(), Duration::from_secs(1));
        assert_eq!(
            config.discovery.browser_list_command.as_deref(),
            Some("agent-browser sessions --json")
        );
        assert!(!config.notifications.desktop);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.server.port, 80);
        assert_eq!(config.server.tls_port, 443);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.upstream_host, "localhost");
        assert_eq!(config.server.request_timeout(), Duration::from_secs(60));
        assert_eq!(config.discovery.target, "local");
        assert_eq!(config.discovery.interval_ms, 3000);
        assert_eq!(config.discovery.tmux_bin, "tmux");
        assert_eq!(config.discovery.system_socket, "tmux-composer-system");
        assert!(config.discovery.browser_list_command.is_none());
        assert_eq!(config.discovery.probe_timeout(), Duration::from_secs(5));
        assert_eq!(config.notifications.command, "notify-send");
        assert_eq!(config.notifications.timeout_ms, 12000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_matches_empty_file() {
        let parsed: Config = toml::from_str("").unwrap();
        let default = Config::default();
        assert_eq!(parsed.server.port, default.server.port);
        assert_eq!(parsed.server.force_https, default.server.force_https);
        assert_eq!(parsed.discovery.interval_ms, default.discovery.interval_ms);
        assert_eq!(parsed.notifications.desktop, default.notifications.desktop);
    }

    #[test]
    fn test_target_parsing() {
        let config = DiscoveryConfig::default();
        assert!(config.target().unwrap().is_local());

        let remote = DiscoveryConfig {
            target: "devbox".to_string(),
            ..DiscoveryConfig::default()
        };
        assert_eq!(remote.target().unwrap().to_string(), "devbox");
    }

    #[test]
    fn test_validate_rejects_unsafe_target() {
        let toml = r#"
[discovery]
target = "devbox; rm -rf ~"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("discovery.target"), "{err}");
        assert!(err.contains("shell metacharacter"), "{err}");
    }

    #[test]
    fn test_validate_multiple_errors() {
        let toml = r#"
[server]
tls_cert = "/tmp/cert.pem"
request_timeout_secs = 0

[discovery]
target = " "
interval_ms = 0
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("discovery.target"));
        assert!(err.contains("interval_ms must be greater than 0"));
        assert!(err.contains("must be set together"));
        assert!(err.contains("request_timeout_secs must be greater than 0"));
    }

    #[test]
    fn test_certificate_paths() {
        let explicit = ServerConfig {
            tls_cert: Some("/etc/ssl/cert.pem".to_string()),
            tls_key: Some("/etc/ssl/key.pem".to_string()),
            ..ServerConfig::default()
        };
        assert_eq!(
            explicit.certificate_paths(),
            Some((
                PathBuf::from("/etc/ssl/cert.pem"),
                PathBuf::from("/etc/ssl/key.pem")
            ))
        );

        let half = ServerConfig {
            tls_cert: Some("/etc/ssl/cert.pem".to_string()),
            ..ServerConfig::default()
        };
        assert!(half.certificate_paths().is_none());

        if let Some((cert, key)) = ServerConfig::default().certificate_paths() {
            assert!(cert.ends_with(".sessiongate/certs/cert.pem"));
            assert!(key.ends_with(".sessiongate/certs/key.pem"));
        }
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[discovery]\ninterval_ms = 500").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.discovery.interval_ms, 500);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[discovery]\ninterval_ms = 0").unwrap();

        assert!(Config::load(file.path()).is_err());
    }
}
