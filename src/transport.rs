//! Command execution against the discovery target
//!
//! Discovery commands either run on this machine through `sh -c` or on a
//! remote host through `ssh`. Remote host strings are validated once, when
//! the [`Target`] is built, so nothing downstream has to re-check them.
//! Arguments interpolated into a command must go through [`quote`] first.

use futures::future::BoxFuture;
use std::borrow::Cow;
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Characters that may never appear in a remote host string
const FORBIDDEN_HOST_CHARS: &[char] = &[';', '&', '|', '<', '>', '$', '`', '\\'];

/// Exit status `sh` reports when the executable does not exist
const EXIT_COMMAND_NOT_FOUND: i32 = 127;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid remote host {host:?}: {reason}")]
    InvalidHost { host: String, reason: &'static str },

    #[error("failed to spawn command: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("command exited with status {status}: {stderr}")]
    CommandFailed { status: i32, stderr: String },

    #[error("command timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("host {0} is unreachable")]
    Unreachable(String),
}

impl TransportError {
    /// True when the program being invoked does not exist on the target
    pub fn is_not_found(&self) -> bool {
        match self {
            TransportError::Spawn(e) => e.kind() == std::io::ErrorKind::NotFound,
            TransportError::CommandFailed { status, .. } => *status == EXIT_COMMAND_NOT_FOUND,
            _ => false,
        }
    }

    /// Standard error output of a failed command, if any
    pub fn stderr(&self) -> Option<&str> {
        match self {
            TransportError::CommandFailed { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

/// A remote hostname that is safe to hand to `ssh`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHost(String);

impl RemoteHost {
    pub fn parse(host: &str) -> Result<Self, TransportError> {
        let reject = |reason| {
            Err(TransportError::InvalidHost {
                host: host.to_string(),
                reason,
            })
        };

        if host.trim().is_empty() {
            return reject("host is empty");
        }
        if host.trim() != host {
            return reject("host has leading or trailing whitespace");
        }
        if host.contains(FORBIDDEN_HOST_CHARS) {
            return reject("host contains a shell metacharacter");
        }
        // ssh would read it as an option
        if host.starts_with('-') {
            return reject("host may not start with '-'");
        }

        Ok(Self(host.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The machine whose sessions are being discovered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Local,
    Remote(RemoteHost),
}

impl Target {
    /// Parse a configured target; `local` and `localhost` mean this machine
    pub fn parse(target: &str) -> Result<Self, TransportError> {
        match target {
            "local" | "localhost" => Ok(Target::Local),
            host => RemoteHost::parse(host).map(Target::Remote),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Target::Local)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Local => f.write_str("local"),
            Target::Remote(host) => write!(f, "{}", host),
        }
    }
}

/// Shell-escape a single argument for embedding in a command string
pub fn quote(arg: &str) -> Cow<'_, str> {
    shell_words::quote(arg)
}

/// Runs shell command strings on the discovery target.
///
/// Implemented by [`Transport`]; tests substitute scripted runners.
pub trait CommandRunner: Send + Sync {
    /// Run `command` and return its standard output
    fn execute<'a>(&'a self, command: &'a str) -> BoxFuture<'a, Result<String, TransportError>>;

    /// Check that the target can be reached at all
    fn check_reachable(&self) -> BoxFuture<'_, Result<(), TransportError>>;

    fn target(&self) -> &Target;
}

/// Executes commands locally or over ssh
#[derive(Debug, Clone)]
pub struct Transport {
    target: Target,
    command_timeout: Option<Duration>,
    probe_timeout: Duration,
}

impl Transport {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            command_timeout: None,
            probe_timeout: Duration::from_secs(5),
        }
    }

    /// Bound how long a single discovery command may run
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    /// Bound the ssh reachability probe
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    fn build_command(&self, command: &str) -> Command {
        let mut cmd = match &self.target {
            Target::Local => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(command);
                cmd
            }
            Target::Remote(host) => {
                let mut cmd = Command::new("ssh");
                cmd.args(["-o", "BatchMode=yes", "--", host.as_str(), command]);
                cmd
            }
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    async fn run(mut cmd: Command, timeout: Option<Duration>) -> Result<String, TransportError> {
        let output = match timeout {
            Some(limit) => tokio::time::timeout(limit, cmd.output())
                .await
                .map_err(|_| TransportError::Timeout(limit))??,
            None => cmd.output().await?,
        };

        if !output.status.success() {
            return Err(TransportError::CommandFailed {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl CommandRunner for Transport {
    fn execute<'a>(&'a self, command: &'a str) -> BoxFuture<'a, Result<String, TransportError>> {
        Box::pin(async move {
            debug!(target_host = %self.target, command, "Executing discovery command");
            Self::run(self.build_command(command), self.command_timeout).await
        })
    }

    fn check_reachable(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let host = match &self.target {
                Target::Local => return Ok(()),
                Target::Remote(host) => host,
            };

            let connect_timeout = format!("ConnectTimeout={}", self.probe_timeout.as_secs().max(1));
            let mut cmd = Command::new("ssh");
            cmd.args(["-o", "BatchMode=yes", "-o", &connect_timeout, "--", host.as_str(), "true"])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped());

            match Self::run(cmd, Some(self.probe_timeout)).await {
                Ok(_) => Ok(()),
                Err(e) => {
                    debug!(host = %host, error = %e, "Reachability probe failed");
                    Err(TransportError::Unreachable(host.to_string()))
                }
            }
        })
    }

    fn target(&self) -> &Target {
        &self.target
    }
}
