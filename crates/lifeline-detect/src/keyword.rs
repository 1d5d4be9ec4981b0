//! Tiered keyword matching on normalized text.

use lifeline_core::{RiskLevel, Signal, SignalSource};
use lifeline_settings::KeywordTiers;

use crate::error::DetectError;

/// Keyword signals never claim more than this on their own.
const KEYWORD_CONFIDENCE_CAP: f64 = 0.95;

/// Lower-case, collapse runs of whitespace, trim.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeywordScan {
    pub tier: RiskLevel,
    /// Every matched term across all tiers, most severe tier first.
    pub matched_terms: Vec<String>,
    /// How many of `matched_terms` belong to `tier`.
    pub hits_at_tier: usize,
}

impl KeywordScan {
    fn none() -> Self {
        Self {
            tier: RiskLevel::None,
            matched_terms: Vec::new(),
            hits_at_tier: 0,
        }
    }

    pub fn signal(&self, base: f64, step: f64) -> Option<Signal> {
        if self.tier == RiskLevel::None {
            return None;
        }
        let extra = self.hits_at_tier.saturating_sub(1) as f64;
        let confidence = (base + step * extra).min(KEYWORD_CONFIDENCE_CAP);
        Some(Signal::new(SignalSource::Keyword, self.tier, confidence).with_evidence(self.matched_terms.clone()))
    }
}

/// Immutable tier table. Cheap to share; no interior mutability.
#[derive(Clone, Debug)]
pub struct KeywordScanner {
    tiers: Vec<(RiskLevel, Vec<String>)>,
}

impl KeywordScanner {
    pub fn new(tiers: &KeywordTiers) -> Result<Self, DetectError> {
        let mut compiled = Vec::with_capacity(4);
        for (tier, terms) in tiers.iter() {
            let mut normalized = Vec::with_capacity(terms.len());
            for term in terms {
                let n = normalize(term);
                if n.is_empty() {
                    return Err(DetectError::InvalidKeyword {
                        tier,
                        term: term.clone(),
                    });
                }
                if !normalized.contains(&n) {
                    normalized.push(n);
                }
            }
            compiled.push((tier, normalized));
        }
        Ok(Self { tiers: compiled })
    }

    pub fn scan(&self, text: &str) -> KeywordScan {
        self.scan_normalized(&normalize(text))
    }

    /// Scan text already passed through [`normalize`].
    pub fn scan_normalized(&self, text: &str) -> KeywordScan {
        if text.is_empty() {
            return KeywordScan::none();
        }
        let mut scan = KeywordScan::none();
        for (tier, terms) in &self.tiers {
            let hits: Vec<String> = terms
                .iter()
                .filter(|t| contains_term(text, t))
                .cloned()
                .collect();
            if hits.is_empty() {
                continue;
            }
            if *tier > scan.tier {
                scan.tier = *tier;
                scan.hits_at_tier = hits.len();
            }
            scan.matched_terms.extend(hits);
        }
        scan
    }
}

/// True when `term` occurs in `haystack` with non-alphanumeric characters
/// (or the text edges) on both sides.
fn contains_term(haystack: &str, term: &str) -> bool {
    haystack.match_indices(term).any(|(start, m)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + m.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}
