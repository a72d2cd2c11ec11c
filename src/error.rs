//! Error types for the operator
//!
//! One enum covers the whole crate. `is_retriable` separates transient
//! failures (network, registry availability, apiserver hiccups) from
//! errors that need a config or spec change to resolve, and the
//! reconciler picks its requeue delay from that split.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("secret {namespace}/{name} not found")]
    SecretNotFound { namespace: String, name: String },

    #[error("secret {namespace}/{name} has no {key:?} key")]
    MissingSecretKey {
        namespace: String,
        name: String,
        key: &'static str,
    },

    #[error("credential is not valid base64: {0}")]
    CredentialDecode(#[source] base64::DecodeError),

    #[error("credential is not valid UTF-8: {0}")]
    CredentialUtf8(#[source] std::string::FromUtf8Error),

    #[error("invalid tag pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("registry rejected credentials for {url} (HTTP {status})")]
    RegistryAuth { url: String, status: u16 },

    #[error("repository not found at {url}")]
    RepositoryNotFound { url: String },

    #[error("tag listing failed for {url} (HTTP {status})")]
    TagList { url: String, status: u16 },

    #[error("copying tag {tag:?} failed: {reason}")]
    CopyFailed { tag: String, reason: String },

    #[error("HTTP error: {0}")]
    HttpError(#[source] reqwest::Error),

    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl Error {
    /// Whether a retry without any user intervention can succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::KubeError(_)
                | Error::HttpError(_)
                | Error::TagList { .. }
                | Error::CopyFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors_are_retriable() {
        let err = Error::TagList {
            url: "https://registry.test/v2/app/tags/list".to_string(),
            status: 503,
        };
        assert!(err.is_retriable());

        let err = Error::CopyFailed {
            tag: "v1.0".to_string(),
            reason: "connection reset".to_string(),
        };
        assert!(err.is_retriable());
    }

    #[test]
    fn test_config_errors_are_not_retriable() {
        let err = Error::SecretNotFound {
            namespace: "default".to_string(),
            name: "source-creds".to_string(),
        };
        assert!(!err.is_retriable());

        let err = Error::RegistryAuth {
            url: "https://registry.test/v2/app/tags/list".to_string(),
            status: 401,
        };
        assert!(!err.is_retriable());

        assert!(!Error::ConfigError("bad".to_string()).is_retriable());
    }

    #[test]
    fn test_display_includes_context() {
        let err = Error::MissingSecretKey {
            namespace: "default".to_string(),
            name: "creds".to_string(),
            key: "token",
        };
        assert!(err.to_string().contains("default/creds"));
        assert!(err.to_string().contains("token"));
    }
}
