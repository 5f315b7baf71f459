//! Error types surfaced to callers of the acquisition layer.

use crate::types::{AttemptFailure, AttemptOutcome, FailureKind, MethodKind};

/// All errors a caller of the acquisition layer can receive.
#[derive(thiserror::Error, Debug)]
pub enum AcquisitionError {
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Overloaded: {outstanding}/{bound} requests outstanding")]
    Overloaded { outstanding: usize, bound: usize },

    #[error("Timed out after {waited_ms}ms")]
    Timeout { waited_ms: u64 },

    #[error("Retries exhausted after {attempts} attempts, last failure: {last}")]
    RetriesExhausted { attempts: u32, last: AttemptFailure },

    #[error("Worker pool exhausted: no healthy workers")]
    PoolExhausted,

    #[error("Proxy pool exhausted: every configured proxy is quarantined")]
    ProxiesExhausted,

    #[error("All acquisition methods failed: {}", format_failures(.failures))]
    AllMethodsFailed {
        failures: Vec<(MethodKind, AttemptFailure)>,
    },

    #[error("Fatal acquisition failure: {0}")]
    Fatal(AttemptFailure),

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Worker pool is shut down")]
    ShutDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn format_failures(failures: &[(MethodKind, AttemptFailure)]) -> String {
    if failures.is_empty() {
        return "no method was attempted".to_string();
    }
    failures
        .iter()
        .map(|(method, failure)| format!("{method} ({failure})"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl AcquisitionError {
    /// Whether the caller may reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Overloaded { .. }
            | Self::Timeout { .. }
            | Self::RetriesExhausted { .. }
            | Self::PoolExhausted
            | Self::ProxiesExhausted => true,
            Self::AllMethodsFailed { failures } => {
                failures.iter().any(|(_, f)| f.kind.is_retryable())
            }
            _ => false,
        }
    }

    /// Collapse this error into the attempt contract used by the router.
    pub fn to_failure(&self) -> AttemptFailure {
        let kind = match self {
            Self::InvalidTarget(_) => FailureKind::InvalidTarget,
            Self::Overloaded { .. } => FailureKind::Overloaded,
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::RetriesExhausted { last, .. } => last.kind,
            Self::PoolExhausted | Self::Browser(_) | Self::ShutDown => FailureKind::Unavailable,
            Self::ProxiesExhausted => FailureKind::ProxyExhausted,
            Self::Fatal(failure) => failure.kind,
            Self::AllMethodsFailed { .. } => FailureKind::Network,
            Self::Config(_) | Self::Io(_) | Self::Json(_) => FailureKind::Structural,
        };
        AttemptFailure::new(kind, self.to_string())
    }

    pub fn into_outcome(self) -> AttemptOutcome {
        let failure = self.to_failure();
        // A shut-down pool will never recover for this caller.
        if matches!(self, Self::ShutDown) {
            return AttemptOutcome::FatalFailed(failure);
        }
        failure.into()
    }
}

/// Convenience result type.
pub type ScraperResult<T> = Result<T, AcquisitionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        assert!(AcquisitionError::Overloaded { outstanding: 4, bound: 4 }.is_retryable());
        assert!(AcquisitionError::Timeout { waited_ms: 10 }.is_retryable());
        assert!(AcquisitionError::PoolExhausted.is_retryable());
        assert!(!AcquisitionError::InvalidTarget("x y".into()).is_retryable());
        assert!(!AcquisitionError::Fatal(AttemptFailure::new(FailureKind::Auth, "401")).is_retryable());
    }

    #[test]
    fn test_all_methods_failed_message() {
        let err = AcquisitionError::AllMethodsFailed {
            failures: vec![
                (MethodKind::Api, AttemptFailure::new(FailureKind::Auth, "401")),
                (MethodKind::Browser, AttemptFailure::timeout(50)),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("api (auth: 401)"));
        assert!(msg.contains("browser (timeout"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_into_outcome() {
        assert!(matches!(
            AcquisitionError::Overloaded { outstanding: 1, bound: 1 }.into_outcome(),
            AttemptOutcome::RetryableFailed(_)
        ));
        assert!(matches!(
            AcquisitionError::InvalidTarget("?".into()).into_outcome(),
            AttemptOutcome::FatalFailed(_)
        ));
        assert!(matches!(
            AcquisitionError::ShutDown.into_outcome(),
            AttemptOutcome::FatalFailed(_)
        ));
    }
}
