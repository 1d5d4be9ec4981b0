//! The full per-message pipeline: keyword ∥ pattern ∥ classifier, then aggregate.

use std::sync::Arc;
use std::time::Duration;

use lifeline_core::{ClassifierError, ContextJudge, Message, RiskAssessment};
use lifeline_settings::{ClassifierSettings, DetectionSettings};
use tracing::debug;

use crate::aggregator::{aggregate, AggregationPolicy};
use crate::classifier::{BreakerConfig, ClassifierAdapter, ClassifierOutcome};
use crate::error::DetectError;
use crate::keyword::{normalize, KeywordScanner};
use crate::pattern::PatternScanner;

/// Slack on top of the classifier timeout before the pipeline stops waiting.
const CLASSIFIER_SLACK: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug)]
struct SignalStrengths {
    keyword: f64,
    keyword_step: f64,
    pattern: f64,
}

/// Immutable once built; share behind an `Arc`.
pub struct Detector {
    keywords: KeywordScanner,
    patterns: PatternScanner,
    classifier: ClassifierAdapter,
    strengths: SignalStrengths,
    policy: AggregationPolicy,
    context_window: usize,
}

impl Detector {
    /// Compile the taxonomy. `judge` is ignored unless the classifier is enabled.
    pub fn from_settings(
        detection: &DetectionSettings,
        classifier: &ClassifierSettings,
        judge: Option<Arc<dyn ContextJudge>>,
    ) -> Result<Self, DetectError> {
        let adapter = match judge {
            Some(j) if classifier.enabled => ClassifierAdapter::new(
                j,
                Duration::from_millis(classifier.timeout_ms),
                BreakerConfig {
                    threshold: classifier.breaker_threshold,
                    cooldown: Duration::from_millis(classifier.breaker_cooldown_ms),
                },
            ),
            _ => ClassifierAdapter::disabled(),
        };

        Ok(Self {
            keywords: KeywordScanner::new(&detection.keywords)?,
            patterns: PatternScanner::new(&detection.patterns)?,
            classifier: adapter,
            strengths: SignalStrengths {
                keyword: detection.keyword_confidence,
                keyword_step: detection.keyword_confidence_step,
                pattern: detection.pattern_confidence,
            },
            policy: AggregationPolicy {
                agreement_bonus: detection.agreement_bonus,
                escalation_threshold: detection.escalation_threshold,
            },
            context_window: classifier.context_window,
        })
    }

    /// Default taxonomy, classifier disabled.
    pub fn local_only() -> Result<Self, DetectError> {
        Self::from_settings(&DetectionSettings::default(), &ClassifierSettings::default(), None)
    }

    /// How many previous messages the classifier wants to see.
    pub fn context_window(&self) -> usize {
        self.context_window
    }

    pub fn classifier(&self) -> &ClassifierAdapter {
        &self.classifier
    }

    pub fn policy(&self) -> &AggregationPolicy {
        &self.policy
    }

    /// Never fails. A missing classifier opinion yields a partial assessment.
    pub async fn assess(&self, text: &str, context: &[Message]) -> RiskAssessment {
        let normalized = normalize(text);
        if normalized.is_empty() {
            return RiskAssessment::unassessed();
        }

        let local = async {
            let k = self.keywords.scan_normalized(&normalized);
            let p = self.patterns.scan_normalized(&normalized);
            (
                k.signal(self.strengths.keyword, self.strengths.keyword_step),
                p.signal(self.strengths.pattern),
            )
        };

        let remote = async {
            match self.classifier.timeout() {
                None => ClassifierOutcome::Disabled,
                Some(t) => {
                    let bound = t + CLASSIFIER_SLACK;
                    tokio::time::timeout(bound, self.classifier.classify(text, context))
                        .await
                        .unwrap_or(ClassifierOutcome::Unavailable(ClassifierError::Timeout(bound)))
                }
            }
        };

        let ((keyword, pattern), outcome) = tokio::join!(local, remote);
        let assessment = aggregate(&self.policy, keyword, pattern, &outcome);
        debug!(
            level = %assessment.level,
            confidence = assessment.confidence,
            partial = assessment.partial,
            "message assessed"
        );
        assessment
    }
}
