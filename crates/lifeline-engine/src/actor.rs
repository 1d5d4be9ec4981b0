//! One task per conversation. Every command that touches a conversation goes
//! through its mailbox, so ingest, claim, release, joins and end are totally
//! ordered per conversation without any shared lock.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use lifeline_core::{
    ChatEvent, ConnectionId, Conversation, ConversationId, ConversationMode, Envelope, Message,
    MonitorId, RiskAssessment, RiskSummary, SenderRole,
};
use lifeline_detect::Detector;
use lifeline_telemetry::MetricsRecorder;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::error::{ClaimOutcome, EngineError};
use crate::fanout::SubscriberHub;
use crate::metrics::*;
use crate::state;
use crate::store::ConversationStore;

/// Who wrote an ingested message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Author {
    User,
    Automated,
    Monitor(MonitorId),
}

impl Author {
    pub fn role(&self) -> SenderRole {
        match self {
            Self::User => SenderRole::User,
            Self::Automated => SenderRole::Automated,
            Self::Monitor(_) => SenderRole::Monitor,
        }
    }
}

/// How a connection is attached to one conversation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubscriberRole {
    User,
    Monitor(MonitorId),
}

/// Read-only view returned by `get`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConversationView {
    pub conversation: Conversation,
    pub recent_messages: Vec<Message>,
    pub seq: u64,
}

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

pub(crate) enum Command {
    Ingest {
        author: Author,
        text: String,
        at: DateTime<Utc>,
        reply: Reply<(Message, RiskAssessment)>,
    },
    Claim {
        monitor: MonitorId,
        reply: Reply<ClaimOutcome>,
    },
    Release {
        monitor: MonitorId,
        reply: Reply<Conversation>,
    },
    Subscribe {
        conn: ConnectionId,
        role: SubscriberRole,
        reply: Reply<Conversation>,
    },
    Unsubscribe {
        conn: ConnectionId,
    },
    ReplayAlert {
        conn: ConnectionId,
    },
    /// The hub withheld an envelope from `conn` because it went backwards.
    RecoverOrder {
        conn: ConnectionId,
    },
    Typing {
        conn: ConnectionId,
        reply: Reply<()>,
    },
    Heartbeat {
        conn: ConnectionId,
        at: DateTime<Utc>,
        reply: Reply<Conversation>,
    },
    End {
        reply: Reply<Conversation>,
    },
    Get {
        reply: oneshot::Sender<ConversationView>,
    },
}

/// Collaborators every actor shares.
pub(crate) struct ActorContext {
    pub detector: Arc<Detector>,
    pub store: Arc<dyn ConversationStore>,
    pub hub: SubscriberHub,
    pub dispatcher: Arc<Dispatcher>,
    pub metrics: Arc<MetricsRecorder>,
    pub recent_messages: usize,
}

pub(crate) struct ConversationActor {
    conv: Conversation,
    seq: u64,
    history: VecDeque<Message>,
    history_cap: usize,
    subscribers: BTreeMap<ConnectionId, SubscriberRole>,
    /// Monitor connections holding the current alert without being subscribed.
    alerted: BTreeSet<ConnectionId>,
    current_alert: Option<RiskSummary>,
    /// Set once a user connection has joined; presence is tracked from then on.
    user_seen: bool,
    ctx: Arc<ActorContext>,
}

impl ConversationActor {
    pub(crate) fn new(conv: Conversation, history: Vec<Message>, ctx: Arc<ActorContext>) -> Self {
        let history_cap = ctx.recent_messages.max(ctx.detector.context_window()).max(1);
        let skip = history.len().saturating_sub(history_cap);
        let current_alert = if conv.mode == ConversationMode::EscalatedPending {
            history
                .iter()
                .rev()
                .find(|m| m.notified)
                .map(|m| RiskSummary::from_assessment(&m.assessment, m.id.clone(), conv.escalations))
        } else {
            None
        };
        Self {
            conv,
            seq: 0,
            history: history.into_iter().skip(skip).collect(),
            history_cap,
            subscribers: BTreeMap::new(),
            alerted: BTreeSet::new(),
            current_alert,
            user_seen: false,
            ctx,
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        debug!(conversation_id = %self.conv.id, "conversation actor started");
        while let Some(cmd) = rx.recv().await {
            if self.handle(cmd).await.is_break() {
                break;
            }
        }
        debug!(conversation_id = %self.conv.id, "conversation actor stopped");
    }

    async fn handle(&mut self, cmd: Command) -> ControlFlow<()> {
        match cmd {
            Command::Ingest { author, text, at, reply } => {
                let _ = reply.send(self.ingest(author, text, at).await);
            }
            Command::Claim { monitor, reply } => {
                let _ = reply.send(self.claim(monitor).await);
            }
            Command::Release { monitor, reply } => {
                let _ = reply.send(self.release(monitor).await);
            }
            Command::Subscribe { conn, role, reply } => {
                let _ = reply.send(self.subscribe(conn, role).await);
            }
            Command::Unsubscribe { conn } => {
                self.subscribers.remove(&conn);
                self.alerted.remove(&conn);
            }
            Command::ReplayAlert { conn } => self.replay_alert(conn),
            Command::RecoverOrder { conn } => {
                let violation = format!("out-of-order delivery to {conn}");
                if self.recover("delivery", &violation) {
                    self.persist(None).await;
                }
            }
            Command::Typing { conn, reply } => {
                let _ = reply.send(self.typing(conn));
            }
            Command::Heartbeat { conn, at, reply } => {
                let _ = reply.send(self.heartbeat(conn, at).await);
            }
            Command::End { reply } => {
                let result = self.end().await;
                let ended = result.is_ok();
                let _ = reply.send(result);
                if ended {
                    return ControlFlow::Break(());
                }
            }
            Command::Get { reply } => {
                let _ = reply.send(self.view());
            }
        }
        self.sync_presence().await;
        ControlFlow::Continue(())
    }

    fn id(&self) -> &ConversationId {
        &self.conv.id
    }

    fn recent(&self) -> Vec<Message> {
        let skip = self.history.len().saturating_sub(self.ctx.recent_messages);
        self.history.iter().skip(skip).cloned().collect()
    }

    fn view(&self) -> ConversationView {
        ConversationView {
            conversation: self.conv.clone(),
            recent_messages: self.recent(),
            seq: self.seq,
        }
    }

    fn next_envelope(&mut self, event: ChatEvent) -> Envelope {
        self.seq += 1;
        Envelope::new(self.conv.id.clone(), self.seq, event)
    }

    /// Stamped with the current seq; does not advance it.
    fn snapshot(&self) -> Envelope {
        Envelope::new(
            self.conv.id.clone(),
            self.seq,
            ChatEvent::Snapshot {
                conversation: self.conv.clone(),
                recent_messages: self.recent(),
            },
        )
    }

    /// Deliver to one connection, forgetting it if the hub already gave up on it.
    fn send_to(&mut self, conn: &ConnectionId, env: Envelope) -> bool {
        if self.ctx.hub.enqueue(conn, env) {
            return true;
        }
        self.subscribers.remove(conn);
        self.alerted.remove(conn);
        false
    }

    fn publish(&mut self, env: &Envelope, include_alerted: bool) {
        let mut targets: BTreeSet<ConnectionId> = self.subscribers.keys().cloned().collect();
        if include_alerted {
            targets.extend(self.alerted.iter().cloned());
        }
        for conn in targets {
            self.send_to(&conn, env.clone());
        }
    }

    async fn ingest(&mut self, author: Author, text: String, at: DateTime<Utc>) -> Result<(Message, RiskAssessment), EngineError> {
        if self.conv.is_archived() {
            return Err(EngineError::ConversationArchived(self.id().clone()));
        }
        if let Author::Monitor(monitor) = &author {
            if self.conv.mode != ConversationMode::Monitored || self.conv.assigned_monitor.as_ref() != Some(monitor) {
                return Err(EngineError::NotAssigned {
                    conversation_id: self.id().clone(),
                    monitor_id: monitor.clone(),
                });
            }
        }

        let role = author.role();
        let assessment = if role == SenderRole::User {
            let window = self.ctx.detector.context_window();
            let skip = self.history.len().saturating_sub(window);
            let context: Vec<Message> = self.history.iter().skip(skip).cloned().collect();
            let started = Instant::now();
            let a = self.ctx.detector.assess(&text, &context).await;
            self.ctx
                .metrics
                .histogram_observe(ASSESSMENT_MS, &[], started.elapsed().as_secs_f64() * 1000.0);
            if a.partial {
                self.ctx.metrics.counter_inc(CLASSIFIER_UNAVAILABLE, &[], 1);
            }
            a
        } else {
            RiskAssessment::unassessed()
        };

        let escalated = state::observe(&mut self.conv, &assessment, at);
        let message = Message::new(self.id().clone(), role, text, at, assessment.clone(), escalated);

        self.history.push_back(message.clone());
        while self.history.len() > self.history_cap {
            self.history.pop_front();
        }

        let env = self.next_envelope(ChatEvent::NewMessage {
            message: message.clone(),
        });
        self.publish(&env, false);

        if escalated {
            info!(
                conversation_id = %self.conv.id,
                level = %assessment.level,
                confidence = assessment.confidence,
                partial = assessment.partial,
                "conversation escalated"
            );
            self.ctx
                .metrics
                .counter_inc(ESCALATIONS, &[("level", assessment.level.as_str())], 1);
            let summary = RiskSummary::from_assessment(&assessment, message.id.clone(), self.conv.escalations);
            self.broadcast_alert(summary);
        }

        self.enforce_invariants("ingest");
        self.persist(Some(&message)).await;
        self.ctx
            .metrics
            .counter_inc(MESSAGES_INGESTED, &[("sender", role.as_str())], 1);
        Ok((message, assessment))
    }

    /// Alert every monitor session plus monitors already watching this conversation.
    fn broadcast_alert(&mut self, summary: RiskSummary) {
        self.current_alert = Some(summary.clone());
        let env = self.next_envelope(ChatEvent::CrisisAlert {
            risk_summary: summary,
            recent_messages: self.recent(),
        });

        let mut targets: BTreeSet<ConnectionId> = self
            .ctx
            .dispatcher
            .monitor_connections()
            .into_iter()
            .map(|(conn, _)| conn)
            .collect();
        targets.extend(
            self.subscribers
                .iter()
                .filter(|(_, role)| matches!(role, SubscriberRole::Monitor(_)))
                .map(|(conn, _)| conn.clone()),
        );

        let mut delivered = 0usize;
        for conn in targets {
            if self.send_to(&conn, env.clone()) {
                if !self.subscribers.contains_key(&conn) {
                    self.alerted.insert(conn);
                }
                delivered += 1;
            }
        }

        self.ctx.dispatcher.mark_pending(self.conv.id.clone());
        self.ctx.metrics.counter_inc(ALERTS_BROADCAST, &[], 1);
        if delivered == 0 {
            warn!(conversation_id = %self.conv.id, "crisis alert raised with no monitor connected; retained");
            self.ctx.metrics.counter_inc(ALERTS_WITHOUT_MONITOR, &[], 1);
        } else {
            debug!(conversation_id = %self.conv.id, monitors = delivered, "crisis alert broadcast");
        }
    }

    /// Catch a newly registered monitor up on this alert. Connections that
    /// already hold it, directly or as subscribers, are skipped.
    fn replay_alert(&mut self, conn: ConnectionId) {
        if !self.conv.needs_attention() || self.alerted.contains(&conn) || self.subscribers.contains_key(&conn) {
            return;
        }
        let Some(summary) = self.current_alert.clone() else {
            return;
        };
        let env = Envelope::new(
            self.conv.id.clone(),
            self.seq,
            ChatEvent::CrisisAlert {
                risk_summary: summary,
                recent_messages: self.recent(),
            },
        );
        if self.send_to(&conn, env) && !self.subscribers.contains_key(&conn) {
            self.alerted.insert(conn);
        }
    }

    async fn claim(&mut self, monitor: MonitorId) -> Result<ClaimOutcome, EngineError> {
        let outcome = match state::claim(&mut self.conv, &monitor) {
            Ok(o) => o,
            Err(e) => {
                if let EngineError::ClaimConflict { owner, .. } = &e {
                    debug!(conversation_id = %self.conv.id, monitor_id = %monitor, owner = %owner, "claim lost");
                    self.ctx.metrics.counter_inc(CLAIMS_CONFLICTED, &[], 1);
                }
                return Err(e);
            }
        };

        if outcome.is_won() {
            info!(conversation_id = %self.conv.id, monitor_id = %monitor, "conversation claimed");
            let env = self.next_envelope(ChatEvent::MonitorJoined {
                monitor_id: monitor.clone(),
            });
            self.publish(&env, true);
            self.alerted.clear();
            self.current_alert = None;
            self.subscribers
                .retain(|_, role| !matches!(role, SubscriberRole::Monitor(m) if m != &monitor));
            self.ctx.dispatcher.clear_pending(&self.conv.id);
            self.ctx.metrics.counter_inc(CLAIMS_WON, &[], 1);
        }

        for conn in self.ctx.dispatcher.connections_of(&monitor) {
            if !self.subscribers.contains_key(&conn) {
                self.subscribers.insert(conn.clone(), SubscriberRole::Monitor(monitor.clone()));
                let snap = self.snapshot();
                self.send_to(&conn, snap);
            }
        }

        self.enforce_invariants("claim");
        if outcome.is_won() {
            self.persist(None).await;
        }
        Ok(match outcome {
            ClaimOutcome::Won(_) => ClaimOutcome::Won(self.conv.clone()),
            ClaimOutcome::AlreadyAssigned(_) => ClaimOutcome::AlreadyAssigned(self.conv.clone()),
        })
    }

    async fn release(&mut self, monitor: MonitorId) -> Result<Conversation, EngineError> {
        state::release(&mut self.conv, &monitor)?;
        info!(conversation_id = %self.conv.id, monitor_id = %monitor, "conversation released");
        let env = self.next_envelope(ChatEvent::MonitorReleased { monitor_id: monitor });
        self.publish(&env, false);
        self.enforce_invariants("release");
        self.persist(None).await;
        Ok(self.conv.clone())
    }

    async fn subscribe(&mut self, conn: ConnectionId, role: SubscriberRole) -> Result<Conversation, EngineError> {
        if self.conv.is_archived() {
            return Err(EngineError::ConversationArchived(self.id().clone()));
        }
        if let SubscriberRole::Monitor(monitor) = &role {
            if self.conv.mode == ConversationMode::Monitored && self.conv.assigned_monitor.as_ref() != Some(monitor) {
                return Err(EngineError::NotAssigned {
                    conversation_id: self.id().clone(),
                    monitor_id: monitor.clone(),
                });
            }
        }
        let returning = role == SubscriberRole::User && !self.conv.user_connected;
        if role == SubscriberRole::User {
            self.user_seen = true;
            self.conv.user_connected = true;
        }
        self.subscribers.insert(conn.clone(), role);
        self.alerted.remove(&conn);
        let snap = self.snapshot();
        self.send_to(&conn, snap);
        if returning {
            info!(conversation_id = %self.conv.id, "user reconnected");
            self.persist(None).await;
        }
        Ok(self.conv.clone())
    }

    /// Relay a typing indicator to every other subscriber.
    fn typing(&mut self, conn: ConnectionId) -> Result<(), EngineError> {
        if self.conv.is_archived() {
            return Err(EngineError::ConversationArchived(self.id().clone()));
        }
        let sender = match self.subscribers.get(&conn) {
            Some(SubscriberRole::User) => SenderRole::User,
            Some(SubscriberRole::Monitor(_)) => SenderRole::Monitor,
            None => {
                return Err(EngineError::NotSubscribed {
                    conversation_id: self.id().clone(),
                    connection_id: conn,
                })
            }
        };
        let env = self.next_envelope(ChatEvent::Typing { sender });
        let others: Vec<ConnectionId> = self.subscribers.keys().filter(|c| **c != conn).cloned().collect();
        for other in others {
            self.send_to(&other, env.clone());
        }
        Ok(())
    }

    async fn heartbeat(&mut self, conn: ConnectionId, at: DateTime<Utc>) -> Result<Conversation, EngineError> {
        if self.conv.is_archived() {
            return Err(EngineError::ConversationArchived(self.id().clone()));
        }
        let Some(role) = self.subscribers.get(&conn) else {
            return Err(EngineError::NotSubscribed {
                conversation_id: self.id().clone(),
                connection_id: conn,
            });
        };
        if *role == SubscriberRole::User {
            self.conv.user_connected = true;
        }
        if at > self.conv.last_activity {
            self.conv.last_activity = at;
        }
        self.persist(None).await;
        Ok(self.conv.clone())
    }

    /// Once the last user connection is gone, tell every monitor.
    async fn sync_presence(&mut self) {
        if !self.user_seen || !self.conv.user_connected || self.conv.is_archived() {
            return;
        }
        if self.subscribers.values().any(|r| *r == SubscriberRole::User) {
            return;
        }
        self.conv.user_connected = false;
        let now = Utc::now();
        if now > self.conv.last_activity {
            self.conv.last_activity = now;
        }
        info!(conversation_id = %self.conv.id, mode = %self.conv.mode, "user disconnected");

        let env = self.next_envelope(ChatEvent::UserDisconnected);
        let mut targets: BTreeSet<ConnectionId> = self
            .ctx
            .dispatcher
            .monitor_connections()
            .into_iter()
            .map(|(conn, _)| conn)
            .collect();
        targets.extend(self.subscribers.keys().cloned());
        targets.extend(self.alerted.iter().cloned());
        for conn in targets {
            self.send_to(&conn, env.clone());
        }
        self.persist(None).await;
    }

    async fn end(&mut self) -> Result<Conversation, EngineError> {
        if self.conv.is_archived() {
            return Err(EngineError::ConversationArchived(self.id().clone()));
        }
        state::archive(&mut self.conv, Utc::now());
        info!(conversation_id = %self.conv.id, mode = %self.conv.mode, "conversation ended");
        let env = self.next_envelope(ChatEvent::ConversationEnded);
        self.publish(&env, true);
        self.ctx.dispatcher.clear_pending(&self.conv.id);
        self.persist(None).await;
        Ok(self.conv.clone())
    }

    /// A violated invariant is never left in place: fall back to escalated
    /// and waiting, then alert the monitors again.
    fn enforce_invariants(&mut self, after: &'static str) {
        let Err(violation) = state::check_invariants(&self.conv) else {
            return;
        };
        self.ctx
            .metrics
            .counter_inc(INVARIANT_VIOLATIONS, &[("kind", "state")], 1);
        self.recover(after, &violation);
    }

    /// Force ESCALATED_PENDING, drop monitor subscribers and re-alert.
    /// Returns false for archived conversations, which are left alone.
    fn recover(&mut self, after: &'static str, violation: &str) -> bool {
        if self.conv.is_archived() {
            return false;
        }
        error!(
            conversation_id = %self.conv.id,
            after,
            violation,
            "conversation invariant violated; forcing escalation"
        );
        state::force_safe(&mut self.conv);
        self.subscribers
            .retain(|_, role| matches!(role, SubscriberRole::User));

        let summary = self.current_alert.clone().or_else(|| {
            self.history.back().map(|m| {
                RiskSummary::from_assessment(&m.assessment, m.id.clone(), self.conv.escalations)
            })
        });
        match summary {
            Some(s) => self.broadcast_alert(s),
            None => self.ctx.dispatcher.mark_pending(self.conv.id.clone()),
        }
        true
    }

    async fn persist(&self, message: Option<&Message>) {
        if let Some(m) = message {
            if let Err(e) = self.ctx.store.upsert_message(m).await {
                error!(conversation_id = %self.conv.id, message_id = %m.id, error = %e, "failed to persist message");
                self.ctx.metrics.counter_inc(STORE_FAILURES, &[("kind", "message")], 1);
            }
        }
        if let Err(e) = self.ctx.store.upsert_conversation(&self.conv).await {
            error!(conversation_id = %self.conv.id, error = %e, "failed to persist conversation");
            self.ctx
                .metrics
                .counter_inc(STORE_FAILURES, &[("kind", "conversation")], 1);
        }
    }
}
