use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ConversationId, MonitorId};
use crate::risk::RiskLevel;

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationMode {
    #[default]
    Automated,
    EscalatedPending,
    Monitored,
}

impl ConversationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Automated => "automated",
            Self::EscalatedPending => "escalated_pending",
            Self::Monitored => "monitored",
        }
    }
}

impl std::fmt::Display for ConversationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persistent view of one chat session.
///
/// Only the owning conversation actor mutates this; everyone else sees clones.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub mode: ConversationMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_monitor: Option<MonitorId>,
    pub last_activity: DateTime<Utc>,
    pub max_risk_seen: RiskLevel,
    /// Number of AUTOMATED -> ESCALATED_PENDING transitions so far.
    pub escalations: u32,
    /// Cleared when the last user connection leaves, set again when one joins.
    #[serde(default = "connected_by_default")]
    pub user_connected: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
}

impl Conversation {
    pub fn new(title: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ConversationId::new(),
            title,
            mode: ConversationMode::Automated,
            assigned_monitor: None,
            last_activity: now,
            max_risk_seen: RiskLevel::None,
            escalations: 0,
            user_connected: true,
            created_at: now,
            archived_at: None,
        }
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    pub fn needs_attention(&self) -> bool {
        self.mode == ConversationMode::EscalatedPending && !self.is_archived()
    }
}

fn connected_by_default() -> bool {
    true
}
