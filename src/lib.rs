//! Sessiongate - A wildcard-subdomain reverse proxy for local dev servers
//!
//! This library provides a reverse proxy that:
//! - Discovers tmux sessions (locally or over ssh) that advertise a `PORT`
//! - Maps each session to a subdomain and republishes the map on every change
//! - Routes HTTP and WebSocket traffic by the Host header to the mapped port
//! - Answers unknown subdomains with a listing of what is currently available
//! - Announces added and removed servers through desktop notifications
//! - Lists the discovered mappings from the command line

pub mod config;
pub mod discovery;
pub mod error;
pub mod error_page;
pub mod listing;
pub mod mapping;
pub mod notify;
pub mod pool;
pub mod proxy;
pub mod routing;
pub mod scheduler;
pub mod transport;

/// Package name from Cargo.toml
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Package version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
