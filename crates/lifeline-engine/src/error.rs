use lifeline_core::{ConnectionId, Conversation, ConversationId, MonitorId};

use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Another monitor won the takeover race.
    #[error("conversation {conversation_id} is already claimed by {owner}")]
    ClaimConflict {
        conversation_id: ConversationId,
        owner: MonitorId,
    },

    #[error("conversation not found: {0}")]
    ConversationNotFound(ConversationId),

    #[error("conversation {0} has ended")]
    ConversationArchived(ConversationId),

    #[error("monitor {monitor_id} is not assigned to {conversation_id}")]
    NotAssigned {
        conversation_id: ConversationId,
        monitor_id: MonitorId,
    },

    #[error("conversation {0} is not awaiting a monitor")]
    NotEscalated(ConversationId),

    /// Monitor messages must name the monitor that sent them.
    #[error("monitor messages require a monitor identity")]
    MonitorIdentityRequired,

    #[error("connection not registered: {0}")]
    ConnectionNotFound(ConnectionId),

    #[error("connection {connection_id} is not subscribed to {conversation_id}")]
    NotSubscribed {
        conversation_id: ConversationId,
        connection_id: ConnectionId,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("engine is shutting down")]
    EngineShutdown,
}

impl EngineError {
    /// Short classification string for logging and wire error codes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ClaimConflict { .. } => "CLAIM_CONFLICT",
            Self::ConversationNotFound(_) => "CONVERSATION_NOT_FOUND",
            Self::ConversationArchived(_) => "CONVERSATION_ARCHIVED",
            Self::NotAssigned { .. } => "NOT_ASSIGNED",
            Self::NotEscalated(_) => "NOT_ESCALATED",
            Self::MonitorIdentityRequired => "MONITOR_IDENTITY_REQUIRED",
            Self::ConnectionNotFound(_) => "CONNECTION_NOT_FOUND",
            Self::NotSubscribed { .. } => "NOT_SUBSCRIBED",
            Self::Store(_) => "STORE_ERROR",
            Self::EngineShutdown => "SHUTTING_DOWN",
        }
    }
}

/// Successful claim result.
#[derive(Clone, Debug, PartialEq)]
pub enum ClaimOutcome {
    /// This call performed the ESCALATED_PENDING -> MONITORED transition.
    Won(Conversation),
    /// The caller already owned the conversation; nothing changed.
    AlreadyAssigned(Conversation),
}

impl ClaimOutcome {
    pub fn conversation(&self) -> &Conversation {
        match self {
            Self::Won(c) | Self::AlreadyAssigned(c) => c,
        }
    }

    pub fn is_won(&self) -> bool {
        matches!(self, Self::Won(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_message_names_owner() {
        let err = EngineError::ClaimConflict {
            conversation_id: ConversationId::from_raw("conv_1"),
            owner: MonitorId::from_raw("ana"),
        };
        assert_eq!(err.to_string(), "conversation conv_1 is already claimed by ana");
        assert_eq!(err.code(), "CLAIM_CONFLICT");
    }

    #[test]
    fn not_assigned_names_monitor() {
        let err = EngineError::NotAssigned {
            conversation_id: ConversationId::from_raw("conv_1"),
            monitor_id: MonitorId::from_raw("bia"),
        };
        assert_eq!(err.to_string(), "monitor bia is not assigned to conv_1");
    }
}
