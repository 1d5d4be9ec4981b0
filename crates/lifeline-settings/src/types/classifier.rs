use serde::{Deserialize, Serialize};

/// Contextual classifier endpoint (Ollama-compatible `/api/generate`).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClassifierSettings {
    /// When false the detector runs keyword and pattern signals only.
    pub enabled: bool,
    pub base_url: String,
    pub model: String,
    /// Hard bound on one classify call.
    pub timeout_ms: u64,
    /// Number of recent messages sent along as context.
    pub context_window: usize,
    /// Consecutive failures before the breaker opens.
    pub breaker_threshold: u32,
    pub breaker_cooldown_ms: u64,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.2:3b".to_string(),
            timeout_ms: 2_000,
            context_window: 5,
            breaker_threshold: 5,
            breaker_cooldown_ms: 30_000,
        }
    }
}
