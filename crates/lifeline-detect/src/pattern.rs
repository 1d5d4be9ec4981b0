//! Ordered regex rules, compiled once.

use lifeline_core::{RiskLevel, Signal, SignalSource};
use lifeline_settings::PatternRule;
use regex::{Regex, RegexBuilder};

use crate::error::DetectError;
use crate::keyword::normalize;

/// Compiled program size bound per rule.
const REGEX_SIZE_LIMIT: usize = 1 << 20;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatternScan {
    pub tier: RiskLevel,
    /// Ids of every rule that matched, in rule order.
    pub matched_patterns: Vec<String>,
}

impl PatternScan {
    pub fn signal(&self, confidence: f64) -> Option<Signal> {
        if self.tier == RiskLevel::None {
            return None;
        }
        Some(Signal::new(SignalSource::Pattern, self.tier, confidence).with_evidence(self.matched_patterns.clone()))
    }
}

#[derive(Clone, Debug)]
struct CompiledRule {
    id: String,
    tier: RiskLevel,
    regex: Regex,
}

#[derive(Clone, Debug)]
pub struct PatternScanner {
    rules: Vec<CompiledRule>,
}

impl PatternScanner {
    pub fn new(rules: &[PatternRule]) -> Result<Self, DetectError> {
        let rules = rules
            .iter()
            .map(|rule| {
                let regex = RegexBuilder::new(&rule.regex)
                    .case_insensitive(true)
                    .size_limit(REGEX_SIZE_LIMIT)
                    .build()
                    .map_err(|source| DetectError::InvalidPattern {
                        id: rule.id.clone(),
                        source,
                    })?;
                Ok(CompiledRule {
                    id: rule.id.clone(),
                    tier: rule.tier,
                    regex,
                })
            })
            .collect::<Result<Vec<_>, DetectError>>()?;
        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn scan(&self, text: &str) -> PatternScan {
        self.scan_normalized(&normalize(text))
    }

    /// Every rule is evaluated; the highest tier among matches wins.
    pub fn scan_normalized(&self, text: &str) -> PatternScan {
        let mut tier = RiskLevel::None;
        let mut matched_patterns = Vec::new();
        if text.is_empty() {
            return PatternScan { tier, matched_patterns };
        }
        for rule in &self.rules {
            if rule.regex.is_match(text) {
                tier = tier.max(rule.tier);
                matched_patterns.push(rule.id.clone());
            }
        }
        PatternScan { tier, matched_patterns }
    }
}
