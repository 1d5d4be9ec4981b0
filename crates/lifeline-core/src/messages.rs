use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ConversationId, MessageId};
use crate::risk::RiskAssessment;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderRole {
    User,
    Automated,
    Monitor,
}

impl SenderRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Automated => "automated",
            Self::Monitor => "monitor",
        }
    }
}

impl std::str::FromStr for SenderRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            // the original chat clients label the responder "ai" or "ollama"
            "automated" | "ai" | "ollama" => Ok(Self::Automated),
            "monitor" => Ok(Self::Monitor),
            other => Err(format!("unknown sender: {other}")),
        }
    }
}

/// A chat message. Built once with its assessment and never mutated afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: SenderRole,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub assessment: RiskAssessment,
    /// This message triggered a crisis alert.
    pub notified: bool,
}

impl Message {
    pub fn new(
        conversation_id: ConversationId,
        sender: SenderRole,
        text: impl Into<String>,
        created_at: DateTime<Utc>,
        assessment: RiskAssessment,
        notified: bool,
    ) -> Self {
        Self {
            id: MessageId::new(),
            conversation_id,
            sender,
            text: text.into(),
            created_at,
            assessment,
            notified,
        }
    }

    pub fn is_flagged(&self) -> bool {
        self.assessment.requires_intervention
    }
}
