use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Ordinal severity of a message. The derive order is the risk order.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub const ALL: [RiskLevel; 5] = [
        RiskLevel::None,
        RiskLevel::Low,
        RiskLevel::Medium,
        RiskLevel::High,
        RiskLevel::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown risk level: {0}")]
pub struct UnknownRiskLevel(pub String);

impl FromStr for RiskLevel {
    type Err = UnknownRiskLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(UnknownRiskLevel(other.to_string())),
        }
    }
}

/// The closed set of analyses that feed the aggregator.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalSource {
    Keyword,
    Pattern,
    Contextual,
}

impl SignalSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Keyword => "keyword",
            Self::Pattern => "pattern",
            Self::Contextual => "contextual",
        }
    }
}

/// One analysis' opinion about a message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub source: SignalSource,
    pub tier: RiskLevel,
    pub confidence: f64,
    /// Matched terms or pattern ids, kept for audit.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<String>,
}

impl Signal {
    pub fn new(source: SignalSource, tier: RiskLevel, confidence: f64) -> Self {
        Self {
            source,
            tier,
            confidence: confidence.clamp(0.0, 1.0),
            evidence: Vec::new(),
        }
    }

    pub fn with_evidence(mut self, evidence: Vec<String>) -> Self {
        self.evidence = evidence;
        self
    }
}

/// Final verdict attached to a message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub confidence: f64,
    pub contributing_signals: BTreeSet<SignalSource>,
    /// The contextual classifier was expected but gave no opinion.
    pub partial: bool,
    pub requires_intervention: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<String>,
}

impl RiskAssessment {
    /// Assessment for messages that are not classified (automated and monitor replies).
    pub fn unassessed() -> Self {
        Self {
            level: RiskLevel::None,
            confidence: 0.0,
            contributing_signals: BTreeSet::new(),
            partial: false,
            requires_intervention: false,
            evidence: Vec::new(),
        }
    }

    pub fn is_emergency(&self) -> bool {
        self.level == RiskLevel::Critical
    }
}
