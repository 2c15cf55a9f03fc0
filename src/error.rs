//! Error handling and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Body type of every response produced by the proxy and the tunnel
pub type ResponseBody = BoxBody<Bytes, hyper::Error>;

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// A routing cookie is present but its value is unusable
    RoutingContextMalformed,
    /// Split token cookies could not be reassembled
    TokenUnavailable,
    /// Token rejected by the validator, or the oracle refused a tunnel
    Unauthenticated,
    /// The policy oracle denied an HTTP request
    PolicyDenied,
    /// Origin header not in the allow-list
    OriginRejected,
    /// X-Forwarded-Host does not match the public host name
    ForwardedHostRejected,
    /// No route for this path
    NotFound,
    /// A per-IP or per-account session cap was hit
    SessionLimitExceeded,
    /// The backend console stream could not be opened
    ConsoleUnavailable,
    /// The request is not a valid WebSocket handshake
    UpgradeFailed,
    /// The cluster directory failed to resolve the cluster
    ClusterLookupFailed,
    /// The cluster directory did not answer in time
    LookupTimeout,
    /// Failed to reach the gateway
    ConnectionFailed,
    /// Request body exceeds the configured maximum
    PayloadTooLarge,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::RoutingContextMalformed => StatusCode::BAD_REQUEST,
            ProxyErrorCode::TokenUnavailable => StatusCode::BAD_REQUEST,
            ProxyErrorCode::Unauthenticated => StatusCode::UNAUTHORIZED,
            ProxyErrorCode::PolicyDenied => StatusCode::FORBIDDEN,
            ProxyErrorCode::OriginRejected => StatusCode::FORBIDDEN,
            ProxyErrorCode::ForwardedHostRejected => StatusCode::FORBIDDEN,
            ProxyErrorCode::NotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::SessionLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            ProxyErrorCode::ConsoleUnavailable => StatusCode::NOT_FOUND,
            ProxyErrorCode::UpgradeFailed => StatusCode::BAD_REQUEST,
            ProxyErrorCode::ClusterLookupFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::LookupTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::RoutingContextMalformed => "ROUTING_CONTEXT_MALFORMED",
            ProxyErrorCode::TokenUnavailable => "TOKEN_UNAVAILABLE",
            ProxyErrorCode::Unauthenticated => "UNAUTHENTICATED",
            ProxyErrorCode::PolicyDenied => "POLICY_DENIED",
            ProxyErrorCode::OriginRejected => "ORIGIN_REJECTED",
            ProxyErrorCode::ForwardedHostRejected => "FORWARDED_HOST_REJECTED",
            ProxyErrorCode::NotFound => "NOT_FOUND",
            ProxyErrorCode::SessionLimitExceeded => "SESSION_LIMIT_EXCEEDED",
            ProxyErrorCode::ConsoleUnavailable => "CONSOLE_UNAVAILABLE",
            ProxyErrorCode::UpgradeFailed => "UPGRADE_FAILED",
            ProxyErrorCode::ClusterLookupFailed => "CLUSTER_LOOKUP_FAILED",
            ProxyErrorCode::LookupTimeout => "LOOKUP_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(code: ProxyErrorCode, message: impl Into<String>) -> Response<ResponseBody> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}

/// 302 redirect, used when the routing cookies are missing
pub fn redirect_response(location: &str) -> Response<ResponseBody> {
    Response::builder()
        .status(StatusCode::FOUND)
        .header(hyper::header::LOCATION, location)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(full_body("Found"))
        .unwrap_or_else(|_| json_error_response(ProxyErrorCode::InternalError, "Invalid redirect target"))
}

/// Plain text response
pub fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body(body))
        .expect("valid response builder")
}

/// Box an in-memory body
pub fn full_body(body: impl Into<Bytes>) -> ResponseBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(ProxyErrorCode::RoutingContextMalformed.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ProxyErrorCode::Unauthenticated.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ProxyErrorCode::PolicyDenied.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(ProxyErrorCode::ForwardedHostRejected.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(ProxyErrorCode::SessionLimitExceeded.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(ProxyErrorCode::ConsoleUnavailable.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ProxyErrorCode::UpgradeFailed.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ProxyErrorCode::LookupTimeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(ProxyErrorCode::ConnectionFailed.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::SessionLimitExceeded, "Too many sessions");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"SESSION_LIMIT_EXCEEDED\""));
        assert!(json.contains("\"message\":\"Too many sessions\""));
        assert!(json.contains("\"status\":429"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ProxyErrorCode::LookupTimeout, "Cluster lookup timed out");

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(response.headers().get("Content-Type").unwrap(), "application/json");
        assert_eq!(response.headers().get("X-Proxy-Error").unwrap(), "LOOKUP_TIMEOUT");
    }

    #[test]
    fn test_redirect_response() {
        let response = redirect_response("/app-service-proxy-index.html");
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(hyper::header::LOCATION).unwrap(),
            "/app-service-proxy-index.html"
        );
    }

    #[test]
    fn test_error_code_header_values() {
        assert_eq!(ProxyErrorCode::OriginRejected.as_header_value(), "ORIGIN_REJECTED");
        assert_eq!(ProxyErrorCode::ClusterLookupFailed.as_header_value(), "CLUSTER_LOOKUP_FAILED");
    }
}
