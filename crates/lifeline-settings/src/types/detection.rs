//! Crisis taxonomy and aggregation constants.
//!
//! The compiled defaults are the Portuguese vocabulary the service was built
//! around. Deployments replace whole lists through the settings file; arrays
//! are never merged element-wise.

use lifeline_core::RiskLevel;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DetectionSettings {
    pub keywords: KeywordTiers,
    /// Evaluated in order; the highest tier among matches wins.
    pub patterns: Vec<PatternRule>,
    /// Base strength of a keyword signal.
    pub keyword_confidence: f64,
    /// Added per extra term matched at the winning tier.
    pub keyword_confidence_step: f64,
    pub pattern_confidence: f64,
    /// Added when two or more signals agree on the winning tier.
    pub agreement_bonus: f64,
    /// Assessments at or above this tier require intervention.
    pub escalation_threshold: RiskLevel,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            keywords: KeywordTiers::default(),
            patterns: default_patterns(),
            keyword_confidence: 0.6,
            keyword_confidence_step: 0.1,
            pattern_confidence: 0.9,
            agreement_bonus: 0.1,
            escalation_threshold: RiskLevel::High,
        }
    }
}

/// Terms per tier. NONE has no list.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeywordTiers {
    pub critical: Vec<String>,
    pub high: Vec<String>,
    pub medium: Vec<String>,
    pub low: Vec<String>,
}

impl KeywordTiers {
    /// Tiers from most to least severe.
    pub fn iter(&self) -> impl Iterator<Item = (RiskLevel, &[String])> {
        [
            (RiskLevel::Critical, self.critical.as_slice()),
            (RiskLevel::High, self.high.as_slice()),
            (RiskLevel::Medium, self.medium.as_slice()),
            (RiskLevel::Low, self.low.as_slice()),
        ]
        .into_iter()
    }
}

fn terms(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| (*s).to_string()).collect()
}

impl Default for KeywordTiers {
    fn default() -> Self {
        Self {
            critical: terms(&[
                "vou me matar",
                "vou me suicidar",
                "quero morrer agora",
                "tenho uma arma",
                "vou pular",
                "vou tomar remédios",
                "hoje é o último dia",
                "me despedindo",
                "acabou para mim",
            ]),
            high: terms(&[
                "suicídio",
                "me matar",
                "acabar com tudo",
                "não aguento mais",
                "quero morrer",
                "melhor morto",
                "sem saída",
                "sem esperança",
                "mundo seria melhor sem mim",
                "cansei de viver",
                "vai me matar",
                "ameaça de morte",
                "ameaçado de morte",
            ]),
            medium: terms(&[
                "deprimido",
                "vazio",
                "sozinho",
                "triste demais",
                "sem sentido",
                "não vale a pena",
                "desisto",
                "acabou",
                "ninguém me ama",
                "sou um fardo",
            ]),
            low: terms(&[
                "triste",
                "down",
                "mal",
                "chateado",
                "preocupado",
                "ansioso",
                "estressado",
                "cansado",
            ]),
        }
    }
}

/// One regex rule. Compiled once at startup; an invalid expression aborts startup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternRule {
    pub id: String,
    pub tier: RiskLevel,
    pub regex: String,
}

impl PatternRule {
    pub fn new(id: &str, tier: RiskLevel, regex: &str) -> Self {
        Self {
            id: id.to_string(),
            tier,
            regex: regex.to_string(),
        }
    }
}

fn default_patterns() -> Vec<PatternRule> {
    vec![
        PatternRule::new("intent_self_harm", RiskLevel::Critical, r"vou.*(?:me matar|suicidar|morrer)"),
        PatternRule::new("means_access", RiskLevel::Critical, r"(?:tenho|vou usar).*(?:arma|faca|remédio|veneno)"),
        PatternRule::new("imminent_timing", RiskLevel::Critical, r"(?:hoje|agora|logo).*(?:morrer|acabar|suicídio)"),
        PatternRule::new(
            "farewell_note",
            RiskLevel::Critical,
            r"(?:escrevendo|deixando).*(?:carta|bilhete).*(?:despedida|adeus)",
        ),
        PatternRule::new("threat_by_other", RiskLevel::Critical, r"(?:ele|ela|eles).*(?:vai|vão).*me matar"),
        PatternRule::new("death_threat", RiskLevel::Critical, r"ameaça.*(?:morte|matar)"),
        PatternRule::new("wish_to_die", RiskLevel::High, r"(?:queria|gostaria de).*(?:sumir|morrer|não acordar)"),
        PatternRule::new("burden", RiskLevel::High, r"(?:todos|família).*(?:melhor|bem).*sem mim"),
        PatternRule::new("hopeless", RiskLevel::Medium, r"nada.*(?:adianta|faz sentido|vai melhorar)"),
    ]
}
