//! Proxy error kinds with HTTP mapping.
//!
//! Errors are classified by kind, not by source type: each variant
//! knows its client-facing status code, its category for logging and
//! counters, and whether it forces the client connection closed.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Rejected before selection (access control, rate limit, caps).
    #[error("Admission rejected ({status}): {reason}")]
    AdmissionRejected { status: u16, reason: &'static str },

    /// Selector returned nothing eligible.
    #[error("No eligible backend")]
    NoBackend,

    /// Could not establish the backend connection.
    #[error("Backend connect failed for {backend}: {source}")]
    BackendConnectFail {
        backend: String,
        #[source]
        source: std::io::Error,
    },

    /// Socket error mid request or response.
    #[error("Backend I/O error for {backend}: {source}")]
    BackendIo {
        backend: String,
        #[source]
        source: std::io::Error,
    },

    /// Malformed client request.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Malformed backend response.
    #[error("Bad backend response: {0}")]
    BadGateway(String),

    /// Request or response exceeds a configured cap.
    #[error("Body too large (limit {limit} bytes)")]
    BodyTooLarge { limit: usize },

    /// Probe / connect / request deadline exceeded.
    #[error("Timeout: {0}")]
    Timeout(&'static str),

    /// Batched response item count does not match the group.
    #[error("Batch response mismatch: expected {expected}, got {got}")]
    BatchMismatch { expected: usize, got: usize },

    /// Client socket failed while a response was being delivered.
    #[error("Client I/O error: {source}")]
    ClientIo {
        #[source]
        source: std::io::Error,
    },
}

impl ProxyError {
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::AdmissionRejected { status, .. } => *status,
            ProxyError::NoBackend => 503,
            ProxyError::BackendConnectFail { .. } => 502,
            ProxyError::BackendIo { .. } => 502,
            ProxyError::Protocol(_) => 400,
            ProxyError::BadGateway(_) => 502,
            ProxyError::BodyTooLarge { .. } => 413,
            ProxyError::Timeout(_) => 504,
            ProxyError::BatchMismatch { .. } => 502,
            // Never sent; the client is already gone.
            ProxyError::ClientIo { .. } => 400,
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            ProxyError::AdmissionRejected { .. } => "admission",
            ProxyError::NoBackend => "selection",
            ProxyError::BackendConnectFail { .. } => "backend",
            ProxyError::BackendIo { .. } => "backend",
            ProxyError::Protocol(_) => "protocol",
            ProxyError::BadGateway(_) => "backend",
            ProxyError::BodyTooLarge { .. } => "limits",
            ProxyError::Timeout(_) => "timeout",
            ProxyError::BatchMismatch { .. } => "batch",
            ProxyError::ClientIo { .. } => "client",
        }
    }

    /// Whether the client connection must be closed after the error
    /// response (or without one).
    pub fn closes_connection(&self) -> bool {
        match self {
            ProxyError::AdmissionRejected { .. } => false,
            ProxyError::NoBackend => false,
            ProxyError::BackendConnectFail { .. } => false,
            ProxyError::BackendIo { .. } => true,
            ProxyError::Protocol(_) => true,
            ProxyError::BadGateway(_) => true,
            ProxyError::BodyTooLarge { .. } => true,
            ProxyError::Timeout(_) => true,
            ProxyError::BatchMismatch { .. } => true,
            ProxyError::ClientIo { .. } => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_kind() {
        assert_eq!(
            ProxyError::AdmissionRejected {
                status: 429,
                reason: "rate"
            }
            .status_code(),
            429
        );
        assert_eq!(ProxyError::NoBackend.status_code(), 503);
        assert_eq!(ProxyError::Protocol("x".into()).status_code(), 400);
        assert_eq!(ProxyError::BodyTooLarge { limit: 1 }.status_code(), 413);
        assert_eq!(ProxyError::Timeout("req").status_code(), 504);
        assert_eq!(
            ProxyError::BatchMismatch {
                expected: 2,
                got: 1
            }
            .status_code(),
            502
        );
    }

    #[test]
    fn admission_keeps_connection_alive() {
        let err = ProxyError::AdmissionRejected {
            status: 403,
            reason: "denied",
        };
        assert!(!err.closes_connection());
        assert!(ProxyError::Protocol("bad".into()).closes_connection());
    }
}
