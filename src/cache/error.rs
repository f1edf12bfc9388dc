use std::error::Error as StdError;

use thiserror::Error;

/// Failure reported by an injected fetch callback.
///
/// Cloneable so a single in-flight fetch can hand the same outcome to every
/// caller waiting on it.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("upstream responded with status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("upstream did not respond within {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },
    #[error("upstream request failed: {message}")]
    Transport { message: String },
}

impl FetchError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Flattens an error and its source chain into a transport failure.
    pub fn from_error(error: &dyn StdError) -> Self {
        let mut message = error.to_string();
        let mut current = error.source();
        while let Some(inner) = current {
            message.push_str(": ");
            message.push_str(&inner.to_string());
            current = inner.source();
        }
        Self::Transport { message }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Status { status: 404, .. })
    }
}

/// A value whose fingerprint would not be stable across calls.
#[derive(Debug, Clone, Error)]
#[error("value cannot be serialized deterministically: {reason}")]
pub struct FingerprintError {
    reason: String,
}

impl FingerprintError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("fetch for `{key}` failed")]
    Fetch {
        key: String,
        #[source]
        source: FetchError,
    },
    #[error("refusing to cache `{key}`")]
    Fingerprint {
        key: String,
        #[source]
        source: FingerprintError,
    },
}

impl CacheError {
    pub fn fetch(key: impl Into<String>, source: FetchError) -> Self {
        Self::Fetch {
            key: key.into(),
            source,
        }
    }

    pub fn fingerprint(key: impl Into<String>, source: FingerprintError) -> Self {
        Self::Fingerprint {
            key: key.into(),
            source,
        }
    }

    /// The upstream failure behind this error, if any.
    pub fn fetch_error(&self) -> Option<&FetchError> {
        match self {
            Self::Fetch { source, .. } => Some(source),
            Self::Fingerprint { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("outer")]
    struct Outer {
        #[source]
        inner: std::io::Error,
    }

    #[test]
    fn from_error_keeps_the_source_chain() {
        let error = Outer {
            inner: std::io::Error::other("connection reset"),
        };

        match FetchError::from_error(&error) {
            FetchError::Transport { message } => assert_eq!(message, "outer: connection reset"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn not_found_is_only_a_404_status() {
        assert!(FetchError::status(404, "missing").is_not_found());
        assert!(!FetchError::status(503, "down").is_not_found());
        assert!(!FetchError::transport("reset").is_not_found());
    }

    #[test]
    fn cache_error_exposes_fetch_failure() {
        let error = CacheError::fetch("game:1", FetchError::Timeout { timeout_ms: 50 });
        assert!(matches!(
            error.fetch_error(),
            Some(FetchError::Timeout { timeout_ms: 50 })
        ));

        let error = CacheError::fingerprint("game:1", FingerprintError::new("nan"));
        assert!(error.fetch_error().is_none());
    }
}
