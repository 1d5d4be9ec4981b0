use std::time::Duration;

/// Failures of the contextual classifier.
/// None of these ever fail message ingest; they degrade the assessment to partial.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ClassifierError {
    #[error("classifier timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("classifier returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed classifier reply: {0}")]
    Malformed(String),
    #[error("circuit breaker open")]
    CircuitOpen,
}

impl ClassifierError {
    /// Whether this failure says something about the classifier's health.
    /// Short-circuited calls and 4xx replies do not trip the breaker.
    pub fn counts_as_failure(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Transport(_) | Self::Malformed(_) => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::CircuitOpen => false,
        }
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Transport(_) => "transport",
            Self::Status { .. } => "status",
            Self::Malformed(_) => "malformed",
            Self::CircuitOpen => "circuit_open",
        }
    }

    pub fn from_status(status: u16, body: String) -> Self {
        Self::Status { status, body }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_failures_trip_breaker() {
        assert!(ClassifierError::Timeout(Duration::from_secs(2)).counts_as_failure());
        assert!(ClassifierError::Transport("refused".into()).counts_as_failure());
        assert!(ClassifierError::Malformed("NIVEL?".into()).counts_as_failure());
        assert!(ClassifierError::from_status(503, "down".into()).counts_as_failure());
        assert!(ClassifierError::from_status(429, "slow down".into()).counts_as_failure());
    }

    #[test]
    fn client_errors_and_open_circuit_do_not() {
        assert!(!ClassifierError::from_status(404, "no model".into()).counts_as_failure());
        assert!(!ClassifierError::CircuitOpen.counts_as_failure());
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(ClassifierError::CircuitOpen.error_kind(), "circuit_open");
        assert_eq!(ClassifierError::Timeout(Duration::ZERO).error_kind(), "timeout");
        assert_eq!(ClassifierError::from_status(500, String::new()).error_kind(), "status");
    }
}
