//! Best-effort announcements of mapping changes
//!
//! Delivery failures are reported to the caller, which logs and moves on;
//! nothing here may hold up a discovery cycle for long.

use crate::config::NotificationConfig;
use crate::mapping::MappingEntry;
use futures::future::BoxFuture;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Title shown on every desktop notification
pub const NOTIFICATION_TITLE: &str = "Proxy Mapping Update";

/// Upper bound on how long a notification command may take
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Body text announcing a new or re-ported mapping
pub fn added_message(entry: &MappingEntry) -> String {
    format!("New server: {} -> {}", entry.subdomain(), entry.port())
}

/// Body text announcing a removed mapping
pub fn removed_message(subdomain: &str, previous_port: Option<u16>) -> String {
    match previous_port {
        Some(port) => format!("Server removed: {} (was on port {})", subdomain, port),
        None => format!("Server removed: {}", subdomain),
    }
}

/// A side channel for mapping announcements
pub trait NotificationSink: Send + Sync {
    fn notify<'a>(&'a self, title: &'a str, message: &'a str) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// Shows notifications through a `notify-send` style program
pub struct DesktopNotifier {
    command: String,
    timeout_ms: u32,
}

impl DesktopNotifier {
    pub fn new(command: impl Into<String>, timeout_ms: u32) -> Self {
        Self {
            command: command.into(),
            timeout_ms,
        }
    }

    pub fn from_config(config: &NotificationConfig) -> Self {
        Self::new(config.command.clone(), config.timeout_ms)
    }
}

impl NotificationSink for DesktopNotifier {
    fn notify<'a>(&'a self, title: &'a str, message: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let mut cmd = Command::new(&self.command);
            cmd.arg("-t")
                .arg(self.timeout_ms.to_string())
                .arg(title)
                .arg(message)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped());

            let output = tokio::time::timeout(DELIVERY_TIMEOUT, cmd.output())
                .await
                .map_err(|_| anyhow::anyhow!("{} did not finish within {:?}", self.command, DELIVERY_TIMEOUT))?
                .map_err(|e| anyhow::anyhow!("Failed to run {}: {}", self.command, e))?;

            if !output.status.success() {
                anyhow::bail!(
                    "{} exited with {}: {}",
                    self.command,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            Ok(())
        })
    }
}

/// Discards every notification
pub struct SilentNotifier;

impl NotificationSink for SilentNotifier {
    fn notify<'a>(&'a self, _title: &'a str, _message: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::Source;

    #[test]
    fn test_messages() {
        let entry = MappingEntry::new("alpha", 4000, Source::General).unwrap();
        assert_eq!(added_message(&entry), "New server: alpha -> 4000");
        assert_eq!(
            removed_message("alpha", Some(4000)),
            "Server removed: alpha (was on port 4000)"
        );
        assert_eq!(removed_message("alpha", None), "Server removed: alpha");
    }

    #[tokio::test]
    async fn test_missing_program_is_an_error_not_a_panic() {
        let notifier = DesktopNotifier::new("sessiongate-no-such-notifier", 1000);
        let err = notifier.notify("title", "body").await.unwrap_err();
        assert!(err.to_string().contains("sessiongate-no-such-notifier"));
    }

    #[tokio::test]
    async fn test_successful_program() {
        // `true` ignores its arguments and exits 0
        let notifier = DesktopNotifier::new("true", 1000);
        assert!(notifier.notify("title", "body").await.is_ok());
    }

    #[tokio::test]
    async fn test_failing_program() {
        let notifier = DesktopNotifier::new("false", 1000);
        assert!(notifier.notify("title", "body").await.is_err());
    }

    #[tokio::test]
    async fn test_silent_notifier() {
        assert!(SilentNotifier.notify("title", "body").await.is_ok());
    }
}
