//! Pure conversation transitions. The actor owns the only mutable copy.

use chrono::{DateTime, Utc};
use lifeline_core::{Conversation, ConversationMode, MonitorId, RiskAssessment};

use crate::error::{ClaimOutcome, EngineError};

/// Fold one assessment into the conversation. Returns true when this call
/// performed the AUTOMATED -> ESCALATED_PENDING transition.
pub fn observe(conv: &mut Conversation, assessment: &RiskAssessment, at: DateTime<Utc>) -> bool {
    if at > conv.last_activity {
        conv.last_activity = at;
    }
    conv.max_risk_seen = conv.max_risk_seen.max(assessment.level);

    if assessment.requires_intervention && conv.mode == ConversationMode::Automated {
        conv.mode = ConversationMode::EscalatedPending;
        conv.escalations += 1;
        return true;
    }
    false
}

/// Check-and-set on the assigned monitor.
pub fn claim(conv: &mut Conversation, monitor: &MonitorId) -> Result<ClaimOutcome, EngineError> {
    if conv.is_archived() {
        return Err(EngineError::ConversationArchived(conv.id.clone()));
    }
    match (conv.mode, &conv.assigned_monitor) {
        (ConversationMode::Monitored, Some(owner)) if owner == monitor => {
            Ok(ClaimOutcome::AlreadyAssigned(conv.clone()))
        }
        (ConversationMode::Monitored, Some(owner)) => Err(EngineError::ClaimConflict {
            conversation_id: conv.id.clone(),
            owner: owner.clone(),
        }),
        (ConversationMode::EscalatedPending, _) => {
            conv.mode = ConversationMode::Monitored;
            conv.assigned_monitor = Some(monitor.clone());
            Ok(ClaimOutcome::Won(conv.clone()))
        }
        _ => Err(EngineError::NotEscalated(conv.id.clone())),
    }
}

/// Only the assigned monitor may hand the conversation back.
pub fn release(conv: &mut Conversation, monitor: &MonitorId) -> Result<(), EngineError> {
    if conv.mode != ConversationMode::Monitored || conv.assigned_monitor.as_ref() != Some(monitor) {
        return Err(EngineError::NotAssigned {
            conversation_id: conv.id.clone(),
            monitor_id: monitor.clone(),
        });
    }
    conv.mode = ConversationMode::Automated;
    conv.assigned_monitor = None;
    Ok(())
}

pub fn archive(conv: &mut Conversation, at: DateTime<Utc>) {
    if conv.archived_at.is_none() {
        conv.archived_at = Some(at);
    }
}

/// `assigned_monitor` is `Some` iff the mode is MONITORED.
pub fn check_invariants(conv: &Conversation) -> Result<(), String> {
    match (conv.mode, &conv.assigned_monitor) {
        (ConversationMode::Monitored, None) => Err("monitored conversation has no assigned monitor".into()),
        (ConversationMode::Automated | ConversationMode::EscalatedPending, Some(m)) => {
            Err(format!("{} conversation still assigned to {m}", conv.mode))
        }
        _ => Ok(()),
    }
}

/// Recovery state after a violation: escalated and waiting for a monitor.
pub fn force_safe(conv: &mut Conversation) {
    conv.mode = ConversationMode::EscalatedPending;
    conv.assigned_monitor = None;
}
