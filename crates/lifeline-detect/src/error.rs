use lifeline_core::RiskLevel;

/// Configuration problems found while building the detector. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    #[error("pattern {id} does not compile: {source}")]
    InvalidPattern {
        id: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid keyword {term:?} in tier {tier}")]
    InvalidKeyword { tier: RiskLevel, term: String },
    #[error("classifier client: {0}")]
    Classifier(#[from] lifeline_core::ClassifierError),
}
