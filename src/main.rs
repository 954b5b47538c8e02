use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use sessiongate::config::Config;
use sessiongate::discovery::SessionDiscovery;
use sessiongate::listing::{public_base, render_listing};
use sessiongate::mapping::MappingStore;
use sessiongate::notify::{DesktopNotifier, NotificationSink, SilentNotifier};
use sessiongate::pool::PoolConfig;
use sessiongate::proxy::{bind_listener, ProxyServer};
use sessiongate::scheduler::PollingScheduler;
use sessiongate::transport::{CommandRunner, Transport};
use sessiongate::{PKG_NAME, VERSION};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info};

/// Config file picked up from the working directory when no path is given
const DEFAULT_CONFIG_FILE: &str = "sessiongate.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let command = parse_command(&std::env::args().skip(1).collect::<Vec<_>>());

    match command {
        Command::Help => {
            print_help();
            Ok(())
        }
        Command::List { watch, config } => {
            init_tracing("sessiongate=warn");
            let config = load_config(config)?;
            list(&config, watch).await
        }
        Command::Serve { config } => {
            init_tracing("sessiongate=debug");
            let config = load_config(config)?;
            serve(config).await
        }
    }
}

enum Command {
    Serve { config: Option<PathBuf> },
    List { watch: bool, config: Option<PathBuf> },
    Help,
}

fn parse_command(args: &[String]) -> Command {
    let Some(first) = args.first() else {
        return Command::Serve { config: None };
    };

    match first.as_str() {
        "help" | "--help" | "-h" => Command::Help,
        "list" | "ls" => {
            let mut watch = false;
            let mut config = None;
            for arg in &args[1..] {
                match arg.as_str() {
                    "--watch" | "-w" => watch = true,
                    path => config = Some(PathBuf::from(path)),
                }
            }
            Command::List { watch, config }
        }
        "serve" => Command::Serve {
            config: args.get(1).map(PathBuf::from),
        },
        path => Command::Serve {
            config: Some(PathBuf::from(path)),
        },
    }
}

fn print_help() {
    println!("{} {}", PKG_NAME, VERSION);
    println!();
    println!("USAGE:");
    println!("    {} [serve] [CONFIG]          Run the proxy", PKG_NAME);
    println!("    {} list [--watch] [CONFIG]   Show discovered mappings", PKG_NAME);
    println!("    {} help                      Show this message", PKG_NAME);
    println!();
    println!("CONFIG defaults to ./{} when present.", DEFAULT_CONFIG_FILE);
}

fn init_tracing(directive: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(directive.parse().expect("valid log directive")),
        )
        .init();
}

fn session_discovery(config: &Config) -> anyhow::Result<SessionDiscovery> {
    let target = config.discovery.target()?;
    let mut transport = Transport::new(target).with_probe_timeout(config.discovery.probe_timeout());
    if config.discovery.command_timeout_secs > 0 {
        transport = transport.with_command_timeout(config.discovery.command_timeout());
    }
    let runner: Arc<dyn CommandRunner> = Arc::new(transport);
    Ok(SessionDiscovery::new(runner, &config.discovery))
}

/// Scheme a client would use, given the listeners `serve` would open
fn serving_tls(config: &Config) -> bool {
    config.server.tls
        && config
            .server
            .certificate_paths()
            .is_some_and(|(cert, key)| cert.exists() && key.exists())
}

/// Run discovery once, or every interval until Ctrl+C, and print the mappings
async fn list(config: &Config, watch: bool) -> anyhow::Result<()> {
    let discovery = session_discovery(config)?;
    let target = config.discovery.target()?;
    let tls = serving_tls(config);
    let port = if tls { config.server.tls_port } else { config.server.port };
    let (scheme, base) = public_base(port, tls);

    if !watch {
        let snapshot = discovery
            .discover_sessions()
            .await
            .ok_or_else(|| anyhow::anyhow!("Target {} is unreachable", target))?;
        print!("{}", render_listing(&snapshot, &target, &base, scheme));
        return Ok(());
    }

    let mut ticker = tokio::time::interval(config.discovery.interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                // Clear the screen and home the cursor
                print!("\x1b[2J\x1b[H");
                match discovery.discover_sessions().await {
                    Some(snapshot) => print!("{}", render_listing(&snapshot, &target, &base, scheme)),
                    None => println!("Target {} is unreachable, retrying", target),
                }
                println!("\nWatching for changes... (Press Ctrl+C to exit)");
            }
        }
    }

    Ok(())
}

async fn serve(config: Config) -> anyhow::Result<()> {
    // Load TLS configuration if the certificate pair is present
    let tls_acceptor = if config.server.tls {
        match config.server.certificate_paths() {
            Some((cert_path, key_path)) if cert_path.exists() && key_path.exists() => {
                let certs = load_certs(&cert_path)?;
                let key = load_key(&key_path)?;
                let tls_config = rustls::ServerConfig::builder()
                    .with_no_client_auth()
                    .with_single_cert(certs, key)
                    .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;
                info!(cert = %cert_path.display(), key = %key_path.display(), "TLS enabled");
                Some(TlsAcceptor::from(Arc::new(tls_config)))
            }
            Some((cert_path, _)) => {
                info!(cert = %cert_path.display(), "No certificates found, serving plain HTTP only");
                None
            }
            None => None,
        }
    } else {
        None
    };

    print_startup_banner(&config, tls_acceptor.is_some());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let store = Arc::new(MappingStore::new());

    // Bind every listener before anything else starts; failure here is fatal
    let mut servers: Vec<JoinHandle<()>> = Vec::new();
    let http_addr = socket_addr(&config.server.bind, config.server.port)?;
    let http_listener = bind_listener(http_addr).await.map_err(|e| {
        error!(addr = %http_addr, error = %e, "Failed to bind HTTP listener");
        e
    })?;

    let mut http_proxy = proxy_server(&config, http_addr, &store, &shutdown_rx);

    if let Some(acceptor) = tls_acceptor {
        let https_addr = socket_addr(&config.server.bind, config.server.tls_port)?;
        let https_listener = bind_listener(https_addr).await.map_err(|e| {
            error!(addr = %https_addr, error = %e, "Failed to bind HTTPS listener");
            e
        })?;

        let https_proxy = proxy_server(&config, https_addr, &store, &shutdown_rx).with_tls(acceptor);
        servers.push(tokio::spawn(async move {
            if let Err(e) = https_proxy.run_with_listener(https_listener).await {
                error!(error = %e, "HTTPS proxy server error");
            }
        }));

        if config.server.force_https {
            http_proxy = http_proxy.with_https_redirect(config.server.tls_port);
            info!(
                http_port = config.server.port,
                https_port = config.server.tls_port,
                "HTTP to HTTPS redirect enabled"
            );
        }
    }

    servers.push(tokio::spawn(async move {
        if let Err(e) = http_proxy.run_with_listener(http_listener).await {
            error!(error = %e, "HTTP proxy server error");
        }
    }));

    let discovery = Arc::new(session_discovery(&config)?);

    let notifier: Arc<dyn NotificationSink> = if config.notifications.desktop {
        Arc::new(DesktopNotifier::from_config(&config.notifications))
    } else {
        Arc::new(SilentNotifier)
    };

    let scheduler = PollingScheduler::new(discovery, Arc::clone(&store), notifier);
    scheduler.start(config.discovery.interval());

    wait_for_shutdown_signal().await?;

    let polling = scheduler.stop();
    let _ = shutdown_tx.send(true);

    // Wait for servers and the last discovery cycle to stop (with timeout)
    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        if let Some(handle) = polling {
            let _ = handle.await;
        }
        for handle in servers {
            let _ = handle.await;
        }
    })
    .await;

    if drained.is_err() {
        info!("Shutdown timed out, exiting anyway");
    }

    info!("Shutdown complete");
    Ok(())
}

/// The given path, else `./sessiongate.toml`, else built-in defaults
fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    let config_path = path.or_else(|| {
        let local = PathBuf::from(DEFAULT_CONFIG_FILE);
        local.exists().then_some(local)
    });

    let Some(config_path) = config_path else {
        info!("No configuration file found, using defaults");
        return Ok(Config::default());
    };

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    Ok(config)
}

fn socket_addr(bind: &str, port: u16) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", bind, port).parse().map_err(|e| {
        error!(bind, port, error = %e, "Invalid bind address");
        anyhow::anyhow!("Invalid bind address {}:{}: {}", bind, port, e)
    })
}

fn proxy_server(
    config: &Config,
    addr: SocketAddr,
    store: &Arc<MappingStore>,
    shutdown_rx: &watch::Receiver<bool>,
) -> ProxyServer {
    ProxyServer::new(addr, Arc::clone(store), shutdown_rx.clone())
        .with_pool_config(PoolConfig::from(&config.server))
        .with_upstream_host(config.server.upstream_host.clone())
        .with_request_timeout(config.server.request_timeout())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn print_startup_banner(config: &Config, tls: bool) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy server");

    let port = if tls { config.server.tls_port } else { config.server.port };
    let (scheme, base) = public_base(port, tls);

    info!(
        bind = %config.server.bind,
        http_port = config.server.port,
        https_port = if tls { Some(config.server.tls_port) } else { None },
        force_https = tls && config.server.force_https,
        upstream_host = %config.server.upstream_host,
        request_timeout_secs = config.server.request_timeout_secs,
        "Server configuration"
    );
    info!(
        target_host = %config.discovery.target,
        interval_ms = config.discovery.interval_ms,
        system_socket = %config.discovery.system_socket,
        browser_sessions = config.discovery.browser_list_command.is_some(),
        notifications = config.notifications.desktop,
        "Discovery settings"
    );
    info!(
        general = %format!("{}://<session>.{}", scheme, base),
        system = %format!("{}://<session>.system.{}", scheme, base),
        "Services are reachable at"
    );
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        anyhow::anyhow!("Failed to open certificate file {}: {}", path.display(), e)
    })?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            anyhow::anyhow!("Failed to parse certificates from {}: {}", path.display(), e)
        })?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path.display());
    }

    Ok(certs)
}

fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open key file {}: {}", path.display(), e))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| anyhow::anyhow!("Failed to parse key from {}: {}", path.display(), e))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    anyhow::bail!("No private key found in {}", path.display())
}
