//! Combines the keyword, pattern and contextual signals into one assessment.

use std::collections::BTreeSet;

use lifeline_core::{RiskAssessment, RiskLevel, Signal, SignalSource};

use crate::classifier::ClassifierOutcome;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AggregationPolicy {
    /// Added once when two or more signals land on the winning tier.
    pub agreement_bonus: f64,
    pub escalation_threshold: RiskLevel,
}

impl Default for AggregationPolicy {
    fn default() -> Self {
        Self {
            agreement_bonus: 0.1,
            escalation_threshold: RiskLevel::High,
        }
    }
}

/// Max tier wins. Confidence is the best confidence at that tier, plus the
/// agreement bonus when more than one source agrees, capped at 1.0.
pub fn aggregate(
    policy: &AggregationPolicy,
    keyword: Option<Signal>,
    pattern: Option<Signal>,
    classifier: &ClassifierOutcome,
) -> RiskAssessment {
    let contextual = classifier
        .verdict()
        .map(|v| Signal::new(SignalSource::Contextual, v.tier, v.confidence));
    let partial = matches!(classifier, ClassifierOutcome::Unavailable(_));

    let signals: Vec<Signal> = [keyword, pattern, contextual].into_iter().flatten().collect();

    let Some(level) = signals.iter().map(|s| s.tier).max() else {
        return RiskAssessment {
            partial,
            ..RiskAssessment::unassessed()
        };
    };

    let winners: Vec<&Signal> = signals.iter().filter(|s| s.tier == level).collect();
    let base = winners.iter().map(|s| s.confidence).fold(0.0_f64, f64::max);
    let contributing_signals: BTreeSet<SignalSource> = winners.iter().map(|s| s.source).collect();
    let bonus = if contributing_signals.len() >= 2 {
        policy.agreement_bonus
    } else {
        0.0
    };

    let evidence = signals.iter().flat_map(|s| s.evidence.iter().cloned()).collect();

    RiskAssessment {
        level,
        confidence: (base + bonus).min(1.0),
        contributing_signals,
        partial,
        requires_intervention: level >= policy.escalation_threshold,
        evidence,
    }
}
