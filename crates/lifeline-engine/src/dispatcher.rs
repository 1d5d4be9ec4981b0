//! Monitor sessions and the set of conversations waiting for one.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lifeline_core::{ConnectionId, ConversationId, MonitorId};
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MonitorSession {
    pub monitor_id: MonitorId,
    pub connection_id: ConnectionId,
    pub connected_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct Dispatcher {
    sessions: DashMap<ConnectionId, MonitorSession>,
    /// Escalated conversations nobody has claimed yet, with when they escalated.
    pending: DashMap<ConversationId, DateTime<Utc>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, connection_id: ConnectionId, monitor_id: MonitorId) -> MonitorSession {
        let session = MonitorSession {
            monitor_id,
            connection_id: connection_id.clone(),
            connected_at: Utc::now(),
        };
        self.sessions.insert(connection_id, session.clone());
        session
    }

    pub fn remove(&self, connection_id: &ConnectionId) -> Option<MonitorSession> {
        self.sessions.remove(connection_id).map(|(_, s)| s)
    }

    pub fn monitor_of(&self, connection_id: &ConnectionId) -> Option<MonitorId> {
        self.sessions.get(connection_id).map(|s| s.monitor_id.clone())
    }

    /// Every connection that receives the alert feed, sorted for stable fanout order.
    pub fn monitor_connections(&self) -> Vec<(ConnectionId, MonitorId)> {
        let mut all: Vec<_> = self
            .sessions
            .iter()
            .map(|s| (s.connection_id.clone(), s.monitor_id.clone()))
            .collect();
        all.sort();
        all
    }

    /// One monitor may hold several connections (e.g. two browser tabs).
    pub fn connections_of(&self, monitor_id: &MonitorId) -> Vec<ConnectionId> {
        let mut conns: Vec<_> = self
            .sessions
            .iter()
            .filter(|s| &s.monitor_id == monitor_id)
            .map(|s| s.connection_id.clone())
            .collect();
        conns.sort();
        conns
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn distinct_monitors(&self) -> usize {
        let mut ids: Vec<MonitorId> = self.sessions.iter().map(|s| s.monitor_id.clone()).collect();
        ids.sort();
        ids.dedup();
        ids.len()
    }

    pub fn mark_pending(&self, conversation_id: ConversationId) {
        self.pending.entry(conversation_id).or_insert_with(Utc::now);
    }

    pub fn clear_pending(&self, conversation_id: &ConversationId) {
        self.pending.remove(conversation_id);
    }

    /// Oldest escalation first.
    pub fn pending(&self) -> Vec<ConversationId> {
        let mut all: Vec<(DateTime<Utc>, ConversationId)> =
            self.pending.iter().map(|e| (*e.value(), e.key().clone())).collect();
        all.sort();
        all.into_iter().map(|(_, id)| id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sessions_register_and_remove() {
        let d = Dispatcher::new();
        let ana = MonitorId::from_raw("ana");
        let c1 = ConnectionId::from_raw("conn_1");
        let c2 = ConnectionId::from_raw("conn_2");
        d.register(c1.clone(), ana.clone());
        d.register(c2.clone(), ana.clone());
        assert_eq!(d.session_count(), 2);
        assert_eq!(d.distinct_monitors(), 1);
        assert_eq!(d.connections_of(&ana), vec![c1.clone(), c2.clone()]);
        assert_eq!(d.monitor_of(&c1), Some(ana.clone()));

        assert!(d.remove(&c1).is_some());
        assert!(d.remove(&c1).is_none());
        assert_eq!(d.monitor_connections(), vec![(c2, ana)]);
    }

    #[test]
    fn pending_is_a_set() {
        let d = Dispatcher::new();
        let conv = ConversationId::from_raw("conv_1");
        d.mark_pending(conv.clone());
        d.mark_pending(conv.clone());
        assert_eq!(d.pending(), vec![conv.clone()]);
        d.clear_pending(&conv);
        assert!(d.pending().is_empty());
    }
}
