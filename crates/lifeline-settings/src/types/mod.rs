//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and implement [`Default`]
//! with production values. Types marked with `#[serde(default)]` accept partial
//! JSON; missing fields get their default during deserialization.

mod classifier;
mod detection;
mod server;

pub use classifier::*;
pub use detection::*;
pub use server::*;

use serde::{Deserialize, Serialize};

/// Root settings type.
///
/// Loaded from `~/.lifeline/settings.json` with defaults applied for
/// missing fields. Environment variables can override specific values.
///
/// ```json
/// {
///   "server": { "port": 9090 },
///   "classifier": { "enabled": true, "model": "llama3" }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LifelineSettings {
    pub version: String,
    pub name: String,
    /// Keyword and pattern taxonomy plus aggregation constants.
    pub detection: DetectionSettings,
    /// Contextual classifier endpoint, timeout and breaker.
    pub classifier: ClassifierSettings,
    /// Per-subscriber delivery queue and retry policy.
    pub delivery: DeliverySettings,
    pub engine: EngineSettings,
    pub server: ServerSettings,
    pub logging: LoggingSettings,
}

impl Default for LifelineSettings {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            name: "lifeline".to_string(),
            detection: DetectionSettings::default(),
            classifier: ClassifierSettings::default(),
            delivery: DeliverySettings::default(),
            engine: EngineSettings::default(),
            server: ServerSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lifeline_core::RiskLevel;

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(LifelineSettings::default()).unwrap();
        assert!(json["detection"].get("agreementBonus").is_some());
        assert!(json["classifier"].get("timeoutMs").is_some());
        assert!(json["delivery"].get("queueSize").is_some());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: LifelineSettings =
            serde_json::from_str(r#"{"detection": {"escalationThreshold": "critical"}}"#).unwrap();
        assert_eq!(s.detection.escalation_threshold, RiskLevel::Critical);
        assert!(!s.detection.keywords.critical.is_empty());
        assert_eq!(s.server.port, ServerSettings::default().port);
    }
}
