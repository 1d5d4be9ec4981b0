use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conversation::Conversation;
use crate::ids::{ConversationId, MessageId, MonitorId};
use crate::messages::{Message, SenderRole};
use crate::risk::{RiskAssessment, RiskLevel};

/// Condensed risk view carried by a crisis alert.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RiskSummary {
    pub level: RiskLevel,
    pub confidence: f64,
    pub emergency_contact: bool,
    pub triggering_message_id: MessageId,
    pub escalations: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<String>,
}

impl RiskSummary {
    pub fn from_assessment(
        assessment: &RiskAssessment,
        triggering_message_id: MessageId,
        escalations: u32,
    ) -> Self {
        Self {
            level: assessment.level,
            confidence: assessment.confidence,
            emergency_contact: assessment.is_emergency(),
            triggering_message_id,
            escalations,
            evidence: assessment.evidence.clone(),
        }
    }
}

/// Events pushed to subscribers of a conversation and to monitors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChatEvent {
    /// First event a new subscriber receives.
    #[serde(rename = "snapshot")]
    Snapshot {
        conversation: Conversation,
        recent_messages: Vec<Message>,
    },
    #[serde(rename = "new_message")]
    NewMessage { message: Message },
    #[serde(rename = "crisis_alert")]
    CrisisAlert {
        risk_summary: RiskSummary,
        recent_messages: Vec<Message>,
    },
    #[serde(rename = "monitor_joined")]
    MonitorJoined { monitor_id: MonitorId },
    #[serde(rename = "monitor_released")]
    MonitorReleased { monitor_id: MonitorId },
    #[serde(rename = "conversation_ended")]
    ConversationEnded,
    /// The last user connection left; sent to monitors.
    #[serde(rename = "user_disconnected")]
    UserDisconnected,
    /// Relayed to every other subscriber of the conversation.
    #[serde(rename = "typing")]
    Typing { sender: SenderRole },
}

impl ChatEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Snapshot { .. } => "snapshot",
            Self::NewMessage { .. } => "new_message",
            Self::CrisisAlert { .. } => "crisis_alert",
            Self::MonitorJoined { .. } => "monitor_joined",
            Self::MonitorReleased { .. } => "monitor_released",
            Self::ConversationEnded => "conversation_ended",
            Self::UserDisconnected => "user_disconnected",
            Self::Typing { .. } => "typing",
        }
    }
}

/// Wire wrapper. `seq` is per conversation and strictly increasing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub conversation_id: ConversationId,
    pub seq: u64,
    pub server_time: DateTime<Utc>,
    #[serde(flatten)]
    pub event: ChatEvent,
}

impl Envelope {
    pub fn new(conversation_id: ConversationId, seq: u64, event: ChatEvent) -> Self {
        Self {
            conversation_id,
            seq,
            server_time: Utc::now(),
            event,
        }
    }
}
