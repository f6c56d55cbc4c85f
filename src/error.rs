//! Error types for the node rotator
//!
//! Cluster API failures are classified into the kinds the rotation engine
//! reacts to differently: fatal unavailability, retryable conflicts, and
//! per-node failures that are recorded and skipped.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The cluster API could not be reached; aborts the run
    #[error("Kubernetes API unavailable: {0}")]
    ApiUnavailable(String),

    /// Resource version mismatch on a read-modify-write
    #[error("Conflict updating {0}")]
    Conflict(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Eviction rejected by a PodDisruptionBudget or admission
    #[error("Eviction of pod {pod} blocked: {reason}")]
    EvictionBlocked { pod: String, reason: String },

    /// A bounded poll ran out of time
    #[error("Timed out after {}s waiting for {operation}", timeout.as_secs())]
    TimedOut {
        operation: String,
        timeout: Duration,
    },

    /// Controller with zero ready replicas before rotation started
    #[error("Controller {0} has no ready replicas")]
    AnomalyDetected(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Kubernetes error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl Error {
    /// Fatal errors abort the whole run instead of failing a single node.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ApiUnavailable(_) | Error::ConfigError(_))
    }

    /// Short, stable label used in run summaries and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ApiUnavailable(_) => "ApiUnavailable",
            Error::Conflict(_) => "Conflict",
            Error::NotFound(_) => "NotFound",
            Error::Forbidden(_) => "Forbidden",
            Error::EvictionBlocked { .. } => "EvictionBlocked",
            Error::TimedOut { .. } => "TimedOut",
            Error::AnomalyDetected(_) => "AnomalyDetected",
            Error::ConfigError(_) => "ConfigError",
            Error::KubeError(_) => "KubeError",
            Error::SerializationError(_) => "SerializationError",
        }
    }
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => match resp.code {
                404 => Error::NotFound(resp.message),
                409 => Error::Conflict(resp.message),
                403 => Error::Forbidden(resp.message),
                code if code >= 500 => {
                    Error::ApiUnavailable(format!("{} ({})", resp.message, code))
                }
                _ => Error::KubeError(kube::Error::Api(resp)),
            },
            kube::Error::HyperError(e) => Error::ApiUnavailable(e.to_string()),
            kube::Error::Service(e) => Error::ApiUnavailable(e.to_string()),
            kube::Error::InferConfig(e) => Error::ConfigError(e.to_string()),
            other => Error::KubeError(other),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("status {code}"),
            reason: String::new(),
            code,
        })
    }

    #[test]
    fn test_api_status_codes_are_classified() {
        assert!(matches!(Error::from(api_error(404)), Error::NotFound(_)));
        assert!(matches!(Error::from(api_error(409)), Error::Conflict(_)));
        assert!(matches!(Error::from(api_error(403)), Error::Forbidden(_)));
        assert!(matches!(Error::from(api_error(503)), Error::ApiUnavailable(_)));
        assert!(matches!(Error::from(api_error(422)), Error::KubeError(_)));
    }

    #[test]
    fn test_only_unavailability_and_config_are_fatal() {
        assert!(Error::ApiUnavailable("down".into()).is_fatal());
        assert!(Error::ConfigError("bad".into()).is_fatal());
        assert!(!Error::Conflict("node".into()).is_fatal());
        assert!(!Error::EvictionBlocked {
            pod: "web-1".into(),
            reason: "pdb".into()
        }
        .is_fatal());
        assert!(!Error::TimedOut {
            operation: "drain".into(),
            timeout: Duration::from_secs(60)
        }
        .is_fatal());
    }

    #[test]
    fn test_timed_out_message() {
        let err = Error::TimedOut {
            operation: "drain of node-a".into(),
            timeout: Duration::from_secs(60),
        };
        assert_eq!(err.to_string(), "Timed out after 60s waiting for drain of node-a");
        assert_eq!(err.kind(), "TimedOut");
    }
}
