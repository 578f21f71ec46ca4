//! Error types for the Breakwater cloud controller

use thiserror::Error;

/// Main error type for controller operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Breakwater cloud API error
    ///
    /// `status` carries the HTTP status code when the error originated from
    /// an API response rather than transport failure.
    #[error("cloud API error: {message}")]
    CloudApi {
        /// HTTP status code, if the API responded
        status: Option<u16>,
        /// Description of what failed
        message: String,
    },

    /// Cloud-config file error
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid Service annotation value
    #[error("invalid annotation {key}: {message}")]
    InvalidAnnotation {
        /// The annotation key that failed to parse
        key: String,
        /// Description of what's invalid
        message: String,
    },

    /// A referenced cloud object (subnet, security group) does not exist
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// A convergence wait (ready-poll, delete-poll) ran out of time
    #[error("timed out: {0}")]
    Timeout(String),

    /// Internal/operational error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a cloud API error without a status code (transport failure)
    pub fn cloud_api(msg: impl Into<String>) -> Self {
        Self::CloudApi {
            status: None,
            message: msg.into(),
        }
    }

    /// Create a cloud API error carrying the HTTP status code
    pub fn cloud_api_status(status: u16, msg: impl Into<String>) -> Self {
        Self::CloudApi {
            status: Some(status),
            message: msg.into(),
        }
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid-annotation error for the given key
    pub fn invalid_annotation(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidAnnotation {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a precondition error with the given message
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    /// Create a timeout error with the given message
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error represents a not-found response from the cloud API
    ///
    /// Deletions treat not-found as success; lookups treat it as absence.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::CloudApi {
                status: Some(404),
                ..
            }
        )
    }

    /// Check if this error is retryable
    ///
    /// Configuration and annotation errors require a spec fix and should not
    /// be retried; API, timeout and internal errors are resolved by the next
    /// reconcile.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(source) => {
                !matches!(source, kube::Error::Api(ae) if (400..500).contains(&ae.code))
            }
            Error::CloudApi { .. } => true,
            Error::Config(_) => false,
            Error::InvalidAnnotation { .. } => false,
            Error::Precondition(_) => true,
            Error::Timeout(_) => true,
            Error::Internal(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_detection() {
        assert!(Error::cloud_api_status(404, "no such load balancer").is_not_found());
        assert!(!Error::cloud_api_status(500, "boom").is_not_found());
        assert!(!Error::cloud_api("connection refused").is_not_found());
    }

    #[test]
    fn annotation_errors_are_not_retryable() {
        let err = Error::invalid_annotation(
            "loadbalancer.breakwater.cloud/loadbalancing-policy",
            "invalid policy",
        );
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("loadbalancing-policy"));
    }

    #[test]
    fn api_and_timeout_errors_are_retryable() {
        assert!(Error::cloud_api("rate limited").is_retryable());
        assert!(Error::timeout("load balancer never became ready").is_retryable());
        assert!(Error::precondition("subnet missing").is_retryable());
    }
}
