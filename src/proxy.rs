use crate::error::{
    html_error_response, json_error_response, upgrade_rejection, ErrorResponse, ProxyErrorCode,
};
use crate::error_page::{render_no_subdomain_page, render_unmapped_page};
use crate::mapping::{MappingStore, Snapshot};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::routing::{resolve, strip_port, Resolution};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Upper bound on an upstream's upgrade response head
const MAX_UPGRADE_HEAD: usize = 16 * 1024;

const DEFAULT_UPSTREAM_HOST: &str = "localhost";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Bind a listener, turning the common failures into actionable messages
pub async fn bind_listener(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    TcpListener::bind(addr).await.map_err(|e| match e.kind() {
        io::ErrorKind::PermissionDenied => anyhow::anyhow!(
            "Permission denied binding {}: ports below 1024 need root or CAP_NET_BIND_SERVICE",
            addr
        ),
        io::ErrorKind::AddrInUse => anyhow::anyhow!(
            "Address {} is already in use, is another proxy already running?",
            addr
        ),
        _ => anyhow::anyhow!("Failed to bind {}: {}", addr, e),
    })
}

/// State shared by every connection a server accepts
struct Router {
    store: Arc<MappingStore>,
    pool: ConnectionPool,
    upstream_host: String,
    request_timeout: Duration,
    /// If set, redirect all plain HTTP requests to this HTTPS port
    https_redirect_port: Option<u16>,
}

impl Router {
    fn upstream_authority(&self, port: u16) -> String {
        format!("{}:{}", self.upstream_host, port)
    }
}

/// The wildcard-subdomain reverse proxy server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    store: Arc<MappingStore>,
    shutdown_rx: watch::Receiver<bool>,
    pool_config: PoolConfig,
    tls_acceptor: Option<TlsAcceptor>,
    https_redirect_port: Option<u16>,
    upstream_host: String,
    request_timeout: Duration,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        store: Arc<MappingStore>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            store,
            shutdown_rx,
            pool_config: PoolConfig::default(),
            tls_acceptor: None,
            https_redirect_port: None,
            upstream_host: DEFAULT_UPSTREAM_HOST.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_pool_config(mut self, pool_config: PoolConfig) -> Self {
        self.pool_config = pool_config;
        self
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    /// Enable HTTPS redirect: all HTTP requests will be redirected to HTTPS on the given port
    pub fn with_https_redirect(mut self, port: u16) -> Self {
        self.https_redirect_port = Some(port);
        self
    }

    /// Host that discovered ports are dialed on
    pub fn with_upstream_host(mut self, host: impl Into<String>) -> Self {
        self.upstream_host = host.into();
        self
    }

    /// Limit on waiting for an upstream's response headers
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = bind_listener(self.bind_addr).await?;
        self.run_with_listener(listener).await
    }

    /// Serve connections from an already bound listener until shutdown
    pub async fn run_with_listener(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr().unwrap_or(self.bind_addr);
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!(addr = %addr, protocol, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let tls_acceptor = self.tls_acceptor.clone();
        let router = Arc::new(Router {
            store: self.store,
            pool: ConnectionPool::new(self.pool_config),
            upstream_host: self.upstream_host,
            request_timeout: self.request_timeout,
            https_redirect_port: self.https_redirect_port,
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let router = Arc::clone(&router);
                            let tls_acceptor = tls_acceptor.clone();

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = handle_connection(tls_stream, addr, router, true).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = handle_connection(stream, addr, router, false).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!(addr = %addr, "Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    router: Arc<Router>,
    is_tls: bool,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let router = Arc::clone(&router);
        async move { handle_request(req, router, addr, is_tls).await }
    });

    // HTTP/1.1 connections can still use WebSocket upgrades
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    router: Arc<Router>,
    client_addr: SocketAddr,
    is_tls: bool,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    if let Some(redirect_port) = router.https_redirect_port {
        if !is_tls {
            return Ok(build_https_redirect(&req, redirect_port));
        }
    }

    let scheme = if is_tls { "https" } else { "http" };
    let host = request_host(&req);

    // One snapshot per request, so the whole request sees one discovery cycle
    let snapshot = router.store.snapshot();

    let entry = match resolve(host.as_deref(), &snapshot) {
        Resolution::Resolved(entry) => entry,
        Resolution::Unmapped(key) => {
            debug!(host = ?host, subdomain = %key, "No mapping for subdomain");
            return Ok(failure_response(
                &req,
                ProxyErrorCode::UnmappedSubdomain,
                Some(key.as_str()),
                host.as_deref(),
                &snapshot,
                scheme,
            ));
        }
        Resolution::NoSubdomain => {
            debug!(host = ?host, "Request without subdomain");
            return Ok(failure_response(
                &req,
                ProxyErrorCode::NoSubdomain,
                None,
                host.as_deref(),
                &snapshot,
                scheme,
            ));
        }
    };

    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let hostname = host.as_deref().map(strip_port).unwrap_or_default().to_string();
    let port = entry.port();
    let authority = router.upstream_authority(port);

    // Overwrite rather than append X-Forwarded-*: this proxy is the first hop
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(value) = host.as_deref().and_then(|h| HeaderValue::from_str(h).ok()) {
        headers.insert(X_FORWARDED_HOST, value);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(scheme));

    rewrite_upstream_headers(headers, &authority);

    debug!(
        hostname,
        subdomain = entry.subdomain(),
        port,
        method = %req.method(),
        uri = %req.uri(),
        request_id,
        "Proxying request"
    );

    if is_upgrade_request(&req) {
        return handle_upgrade(req, &router, hostname, authority, request_id).await;
    }

    let method = req.method().clone();
    let uri = req.uri().clone();
    let result = tokio::time::timeout(
        router.request_timeout,
        router.pool.send_request(req, &authority),
    )
    .await;

    match result {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => {
            error!(
                method = %method,
                uri = %uri,
                hostname,
                port,
                error = %e,
                "Failed to forward request"
            );
            Ok(ErrorResponse::new(
                ProxyErrorCode::ConnectionFailed,
                format!("Failed to connect to upstream on port {}", port),
            )
            .with_hostname(hostname)
            .into_response())
        }
        Err(_) => {
            warn!(
                method = %method,
                uri = %uri,
                hostname,
                port,
                timeout_secs = router.request_timeout.as_secs(),
                "Request timed out"
            );
            Ok(ErrorResponse::new(
                ProxyErrorCode::RequestTimeout,
                format!(
                    "Request timed out after {} seconds",
                    router.request_timeout.as_secs()
                ),
            )
            .with_hostname(hostname)
            .into_response())
        }
    }
}

/// The request's host: the Host header, else the URI authority (HTTP/2)
fn request_host<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(String::from)
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))
        .filter(|h| !h.is_empty())
}

/// Whether the caller asked for an HTML document
fn accepts_html<B>(req: &Request<B>) -> bool {
    req.headers()
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("text/html"))
}

/// Answer an unroutable request without touching any upstream
fn failure_response<B>(
    req: &Request<B>,
    code: ProxyErrorCode,
    lookup_key: Option<&str>,
    host: Option<&str>,
    snapshot: &Snapshot,
    scheme: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    if is_upgrade_request(req) {
        return upgrade_rejection(code);
    }

    if accepts_html(req) {
        let request_host = host.unwrap_or("localhost");
        let html = match lookup_key {
            Some(key) => render_unmapped_page(key, snapshot, request_host, scheme),
            None => render_no_subdomain_page(request_host, scheme),
        };
        return html_error_response(code, html);
    }

    let message = match lookup_key {
        Some(key) => format!("No service found for subdomain: {}", key),
        None => "No subdomain specified in request".to_string(),
    };
    let mut body = ErrorResponse::new(code, message).with_available(snapshot.available());
    if let Some(key) = lookup_key {
        body = body.with_subdomain(key);
    }
    if let Some(host) = host {
        body = body.with_hostname(strip_port(host));
    }
    body.into_response()
}

/// Point Host, and absolute Origin/Referer values, at the upstream
fn rewrite_upstream_headers(headers: &mut HeaderMap, authority: &str) {
    if let Ok(value) = HeaderValue::from_str(authority) {
        headers.insert(header::HOST, value);
    }

    for name in [header::ORIGIN, header::REFERER] {
        let rewritten = headers
            .get(&name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| rewrite_url_authority(v, authority))
            .and_then(|v| HeaderValue::from_str(&v).ok());
        if let Some(value) = rewritten {
            headers.insert(name, value);
        }
    }
}

/// Swap the authority of an absolute URL, keeping scheme, path and query.
///
/// Returns `None` when `value` is not an absolute URL.
fn rewrite_url_authority(value: &str, authority: &str) -> Option<String> {
    let uri: Uri = value.parse().ok()?;
    let scheme = uri.scheme_str()?;
    uri.authority()?;

    let (_, after_scheme) = value.split_once("://")?;
    let rest_start = after_scheme
        .find(|c| matches!(c, '/' | '?' | '#'))
        .unwrap_or(after_scheme.len());

    Some(format!("{}://{}{}", scheme, authority, &after_scheme[rest_start..]))
}

/// Build an HTTPS redirect response (301 Moved Permanently)
fn build_https_redirect<B>(req: &Request<B>, https_port: u16) -> Response<BoxBody<Bytes, hyper::Error>> {
    let host = request_host(req);
    let host = host.as_deref().map(strip_port).unwrap_or("localhost");

    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    let location = if https_port == 443 {
        format!("https://{}{}", host, path)
    } else {
        format!("https://{}:{}{}", host, https_port, path)
    };

    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(header::LOCATION, location)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(
            Full::new(Bytes::from("Redirecting to HTTPS"))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response builder")
}

/// Check if a request is a WebSocket upgrade request
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let has_upgrade_header = req.headers().contains_key(header::UPGRADE);

    has_upgrade_connection && has_upgrade_header
}

/// Get the value of the Upgrade header
fn get_upgrade_type<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
}

/// Forward bytes bidirectionally between client and upstream connections
async fn forward_bidirectional(
    client: Upgraded,
    upstream: TcpStream,
    buffered: Vec<u8>,
    hostname: &str,
    request_id: &str,
) {
    let mut client_io = TokioIo::new(client);
    let mut upstream_io = upstream;

    // Frames the upstream sent right behind its 101
    if !buffered.is_empty() {
        if let Err(e) = client_io.write_all(&buffered).await {
            debug!(hostname, request_id, error = %e, "Client went away before forwarding started");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await {
        Ok((client_to_upstream, upstream_to_client)) => {
            debug!(
                hostname,
                request_id,
                client_to_upstream,
                upstream_to_client,
                "WebSocket connection closed normally"
            );
        }
        Err(e) => {
            debug!(hostname, request_id, error = %e, "WebSocket connection closed with error");
        }
    }
}

/// Build the raw HTTP upgrade request to send upstream.
///
/// Headers are written as they stand, so Host must already be rewritten.
fn build_upgrade_request<B>(req: &Request<B>) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path).into_bytes();

    for (name, value) in req.headers() {
        request.extend_from_slice(name.as_str().as_bytes());
        request.extend_from_slice(b": ");
        request.extend_from_slice(value.as_bytes());
        request.extend_from_slice(b"\r\n");
    }
    request.extend_from_slice(b"\r\n");

    request
}

/// Offset just past the blank line ending a response head
fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

/// Read an upstream response head; returns it with any bytes read past it
async fn read_response_head<S>(stream: &mut S) -> io::Result<(Vec<u8>, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    loop {
        if let Some(end) = find_head_end(&buf) {
            let rest = buf.split_off(end);
            return Ok((buf, rest));
        }
        if buf.len() > MAX_UPGRADE_HEAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "upgrade response head too large",
            ));
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "upstream closed connection before responding",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Parse the HTTP response from the upstream to check for 101 Switching Protocols
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    // Status line: HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }

    let status_code: u16 = parts[1].parse().ok()?;
    let status = StatusCode::from_u16(status_code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

/// Response carrying the upstream's status and headers minus framing headers
fn relay_head(status: StatusCode, headers: &[(String, String)]) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = Response::builder().status(status);
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("transfer-encoding") {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }
    response
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .unwrap_or_else(|_| {
            json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Invalid upgrade response from upstream",
            )
        })
}

async fn open_upgrade(
    authority: &str,
    raw_request: &[u8],
) -> io::Result<(TcpStream, Vec<u8>, Vec<u8>)> {
    let mut upstream = TcpStream::connect(authority).await?;
    upstream.set_nodelay(true)?;
    upstream.write_all(raw_request).await?;
    let (head, rest) = read_response_head(&mut upstream).await?;
    Ok((upstream, head, rest))
}

/// Handle a WebSocket upgrade request
async fn handle_upgrade(
    req: Request<Incoming>,
    router: &Router,
    hostname: String,
    authority: String,
    request_id: String,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let upgrade_type = get_upgrade_type(&req).unwrap_or_else(|| "unknown".to_string());
    debug!(hostname, request_id, upgrade_type, "Handling upgrade request");

    let raw_request = build_upgrade_request(&req);

    let opened = tokio::time::timeout(
        router.request_timeout,
        open_upgrade(&authority, &raw_request),
    )
    .await;

    let (upstream, head, buffered) = match opened {
        Ok(Ok(opened)) => opened,
        Ok(Err(e)) => {
            error!(
                method = %req.method(),
                uri = %req.uri(),
                hostname,
                upstream = %authority,
                error = %e,
                "Failed to open upgrade connection upstream"
            );
            return Ok(ErrorResponse::new(
                ProxyErrorCode::ConnectionFailed,
                format!("Failed to connect to upstream {}", authority),
            )
            .with_hostname(hostname)
            .into_response());
        }
        Err(_) => {
            warn!(hostname, upstream = %authority, "Upgrade handshake timed out");
            return Ok(ErrorResponse::new(
                ProxyErrorCode::RequestTimeout,
                "Upgrade handshake timed out",
            )
            .with_hostname(hostname)
            .into_response());
        }
    };

    let (status, response_headers) = match parse_upgrade_response(&head) {
        Some(parsed) => parsed,
        None => {
            error!(hostname, upstream = %authority, "Failed to parse upstream upgrade response");
            return Ok(ErrorResponse::new(
                ProxyErrorCode::ConnectionFailed,
                "Invalid upgrade response from upstream",
            )
            .with_hostname(hostname)
            .into_response());
        }
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(hostname, status = %status, "Upstream rejected upgrade request");
        return Ok(relay_head(status, &response_headers));
    }

    info!(hostname, request_id, upgrade_type, "WebSocket upgrade successful");

    let response = relay_head(status, &response_headers);

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                debug!(hostname, request_id, "Client upgrade complete, starting forwarding");
                forward_bidirectional(upgraded, upstream, buffered, &hostname, &request_id).await;
            }
            Err(e) => {
                error!(hostname, error = %e, "Failed to upgrade client connection");
            }
        }
    });

    Ok(response)
}
