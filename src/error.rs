//! Error types and the fixed error responses of the public listener

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};

/// Errors raised while managing a backend process
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("backend for {domain} has no launch parameters yet")]
    NotConfigured { domain: String },

    #[error("failed to spawn backend for {domain}: {source}")]
    Spawn {
        domain: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while applying the domain mapping
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("failed to read mapping file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to allocate a port for {domain}: {source}")]
    PortAllocation {
        domain: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while forwarding a request to a backend
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("request build error: {0}")]
    RequestBuild(String),
}

/// Returned from the connection service to make hyper drop the
/// connection without writing a response
#[derive(Debug, thiserror::Error)]
#[error("upgrade refused for unmapped host {host:?}")]
pub struct UnmappedUpgrade {
    pub host: String,
}

/// Error codes for the fixed error responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorCode {
    /// No backend is mapped for the Host header
    UnknownHost,
    /// The mapped backend could not be reached
    ConnectionFailed,
}

impl ProxyErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::UnknownHost => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
        }
    }

    /// Value of the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::UnknownHost => "UNKNOWN_HOST",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
        }
    }
}

/// Create a plain-text error response with X-Proxy-Error header
pub fn text_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "text/plain")
        .header("X-Proxy-Error", code.as_header_value())
        .body(
            Full::new(Bytes::from(message.into()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response with StatusCode enum and static headers")
}

/// Response for a request whose Host header maps to no backend
pub fn unmapped_host_response(host: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    text_error_response(
        ProxyErrorCode::UnknownHost,
        format!("No backend mapped for host {}", host),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_string(response: Response<BoxBody<Bytes, hyper::Error>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::UnknownHost.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ProxyErrorCode::ConnectionFailed.status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[tokio::test]
    async fn test_unmapped_host_response() {
        let response = unmapped_host_response("unknown.example");

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers().get("Content-Type").unwrap(), "text/plain");
        assert_eq!(response.headers().get("X-Proxy-Error").unwrap(), "UNKNOWN_HOST");
        assert!(body_string(response).await.contains("unknown.example"));
    }

    #[tokio::test]
    async fn test_connection_failed_response() {
        let response = text_error_response(ProxyErrorCode::ConnectionFailed, "Backend for a.test unreachable");

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "CONNECTION_FAILED"
        );
        assert_eq!(body_string(response).await, "Backend for a.test unreachable");
    }

    #[test]
    fn test_error_messages() {
        let err = SupervisorError::NotConfigured {
            domain: "a.test".to_string(),
        };
        assert_eq!(err.to_string(), "backend for a.test has no launch parameters yet");

        let err = ReconcileError::PortAllocation {
            domain: "b.test".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "no address"),
        };
        assert!(err.to_string().contains("b.test"));
    }
}
