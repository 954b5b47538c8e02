//! Error responses for requests the proxy cannot forward

use crate::mapping::AvailableSubdomains;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::{header, Response, StatusCode};
use serde::Serialize;

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorCode {
    /// Host header carries no subdomain
    NoSubdomain,
    /// Subdomain has no current mapping
    UnmappedSubdomain,
    /// Failed to connect to or talk to the upstream
    ConnectionFailed,
    /// Upstream did not answer in time
    RequestTimeout,
}

impl ProxyErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::NoSubdomain => StatusCode::NOT_FOUND,
            ProxyErrorCode::UnmappedSubdomain => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::NoSubdomain => "NO_SUBDOMAIN",
            ProxyErrorCode::UnmappedSubdomain => "UNMAPPED_SUBDOMAIN",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
        }
    }

    /// Short error title used as the JSON `error` field
    pub fn title(&self) -> &'static str {
        match self {
            ProxyErrorCode::NoSubdomain => "No subdomain specified",
            ProxyErrorCode::UnmappedSubdomain => "Service not found",
            ProxyErrorCode::ConnectionFailed => "Bad gateway",
            ProxyErrorCode::RequestTimeout => "Gateway timeout",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_subdomains: Option<AvailableSubdomains>,
    #[serde(skip)]
    code: ProxyErrorCode,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: code.title(),
            message: message.into(),
            subdomain: None,
            hostname: None,
            available_subdomains: None,
            code,
        }
    }

    pub fn with_subdomain(mut self, subdomain: impl Into<String>) -> Self {
        self.subdomain = Some(subdomain.into());
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn with_available(mut self, available: AvailableSubdomains) -> Self {
        self.available_subdomains = Some(available);
        self
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"error":"{}","message":"{}"}}"#,
                self.error,
                self.message.replace('\\', "\\\\").replace('\"', "\\\"")
            )
        })
    }

    /// Render as a response with the X-Proxy-Error header
    pub fn into_response(self) -> Response<BoxBody<Bytes, hyper::Error>> {
        let code = self.code;
        let body = self.to_json();

        Response::builder()
            .status(code.status_code())
            .header(header::CONTENT_TYPE, "application/json")
            .header("X-Proxy-Error", code.as_header_value())
            .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
            .expect("valid response with StatusCode enum and static headers")
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    ErrorResponse::new(code, message).into_response()
}

/// Create an HTML error response with X-Proxy-Error header
pub fn html_error_response(
    code: ProxyErrorCode,
    html: String,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(code.status_code())
        .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(html)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// Refuse a WebSocket upgrade; the connection is closed after the status line
pub fn upgrade_rejection(code: ProxyErrorCode) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(code.status_code())
        .header(header::CONNECTION, "close")
        .header(header::CONTENT_LENGTH, "0")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Empty::<Bytes>::new().map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
