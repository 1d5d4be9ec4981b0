use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::ClassifierError;
use crate::messages::Message;
use crate::risk::RiskLevel;

/// Opinion returned by a contextual classifier.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct JudgeVerdict {
    pub tier: RiskLevel,
    pub confidence: f64,
}

/// An external classifier that scores a message given recent history.
///
/// Implementations must be safe to call concurrently from many conversations.
#[async_trait]
pub trait ContextJudge: Send + Sync {
    async fn classify(&self, text: &str, context: &[Message]) -> Result<JudgeVerdict, ClassifierError>;

    /// Human-readable name for logs.
    fn name(&self) -> &str;
}
