//! Public entry point: owns the conversation actors, monitor sessions and
//! subscriber queues, and routes every call to the right actor.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lifeline_core::{
    ConnectionId, Conversation, ConversationId, Message, MonitorId, RiskAssessment, SenderRole,
};
use lifeline_detect::Detector;
use lifeline_settings::{DeliverySettings, LifelineSettings};
use lifeline_telemetry::{MetricsRecorder, MetricsSnapshot};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::actor::{ActorContext, Author, Command, ConversationActor, ConversationView, SubscriberRole};
use crate::dispatcher::{Dispatcher, MonitorSession};
use crate::error::{ClaimOutcome, EngineError};
use crate::fanout::{EventSink, HubNotice, SubscriberHub};
use crate::metrics::{ACTIVE_CONVERSATIONS, CONNECTED_MONITORS};
use crate::store::ConversationStore;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub recent_messages: usize,
    pub mailbox_size: usize,
    pub delivery: DeliverySettings,
}

impl EngineConfig {
    pub fn from_settings(settings: &LifelineSettings) -> Self {
        Self {
            recent_messages: settings.engine.recent_messages,
            mailbox_size: settings.engine.mailbox_size,
            delivery: settings.delivery.clone(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_settings(&LifelineSettings::default())
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineHealth {
    pub active_conversations: usize,
    pub connections: usize,
    pub monitor_sessions: usize,
    pub monitors: usize,
    pub pending_escalations: Vec<ConversationId>,
    pub classifier_breaker: &'static str,
    pub classifier_unavailable: u64,
    pub metrics: MetricsSnapshot,
}

struct EngineInner {
    ctx: Arc<ActorContext>,
    actors: DashMap<ConversationId, mpsc::Sender<Command>>,
    /// Conversations each connection is subscribed to, for disconnect cleanup.
    connections: DashMap<ConnectionId, BTreeSet<ConversationId>>,
    mailbox_size: usize,
    closed: AtomicBool,
}

/// Cheap to clone; all clones share the same engine.
#[derive(Clone)]
pub struct CrisisEngine {
    inner: Arc<EngineInner>,
}

impl CrisisEngine {
    /// Must be called inside a tokio runtime.
    pub fn new(
        detector: Arc<Detector>,
        store: Arc<dyn ConversationStore>,
        metrics: Arc<MetricsRecorder>,
        config: EngineConfig,
    ) -> Self {
        let (notice_tx, mut notice_rx) = mpsc::unbounded_channel();
        let hub = SubscriberHub::new(&config.delivery, metrics.clone(), notice_tx);
        let inner = Arc::new(EngineInner {
            ctx: Arc::new(ActorContext {
                detector,
                store,
                hub,
                dispatcher: Arc::new(Dispatcher::new()),
                metrics,
                recent_messages: config.recent_messages.max(1),
            }),
            actors: DashMap::new(),
            connections: DashMap::new(),
            mailbox_size: config.mailbox_size.max(1),
            closed: AtomicBool::new(false),
        });

        let weak: Weak<EngineInner> = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(notice) = notice_rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                match notice {
                    HubNotice::Dropped(conn) => inner.forget_connection(&conn).await,
                    HubNotice::OutOfOrder {
                        connection_id,
                        conversation_id,
                    } => {
                        if let Some(tx) = inner.live_actor(&conversation_id) {
                            let _ = tx.send(Command::RecoverOrder { conn: connection_id }).await;
                        }
                    }
                }
            }
        });

        Self { inner }
    }

    pub fn metrics(&self) -> Arc<MetricsRecorder> {
        self.inner.ctx.metrics.clone()
    }

    // ── conversations ───────────────────────────────────────────────────

    pub async fn start_conversation(&self, title: Option<String>) -> Result<Conversation> {
        self.inner.ensure_open()?;
        let conv = Conversation::new(title);
        if let Err(e) = self.inner.ctx.store.upsert_conversation(&conv).await {
            warn!(conversation_id = %conv.id, error = %e, "failed to persist new conversation");
        }
        self.inner.spawn_actor(conv.clone(), Vec::new());
        info!(conversation_id = %conv.id, "conversation started");
        Ok(conv)
    }

    /// Classify and record a user or automated message.
    pub async fn ingest(
        &self,
        conversation_id: &ConversationId,
        sender: SenderRole,
        text: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Result<(Message, RiskAssessment)> {
        let author = match sender {
            SenderRole::User => Author::User,
            SenderRole::Automated => Author::Automated,
            SenderRole::Monitor => return Err(EngineError::MonitorIdentityRequired),
        };
        self.ingest_as(conversation_id, author, text.into(), at).await
    }

    /// Accepted only from the monitor assigned to a MONITORED conversation.
    pub async fn ingest_from_monitor(
        &self,
        conversation_id: &ConversationId,
        monitor_id: &MonitorId,
        text: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Result<(Message, RiskAssessment)> {
        self.ingest_as(conversation_id, Author::Monitor(monitor_id.clone()), text.into(), at)
            .await
    }

    async fn ingest_as(
        &self,
        conversation_id: &ConversationId,
        author: Author,
        text: String,
        at: DateTime<Utc>,
    ) -> Result<(Message, RiskAssessment)> {
        self.inner
            .call(conversation_id, |reply| Command::Ingest { author, text, at, reply })
            .await
    }

    /// Exactly one of any number of concurrent claims wins.
    pub async fn claim(&self, conversation_id: &ConversationId, monitor_id: &MonitorId) -> Result<ClaimOutcome> {
        let monitor = monitor_id.clone();
        let outcome = self
            .inner
            .call(conversation_id, |reply| Command::Claim { monitor, reply })
            .await?;
        for conn in self.inner.ctx.dispatcher.connections_of(monitor_id) {
            self.inner.track(&conn, conversation_id);
        }
        Ok(outcome)
    }

    pub async fn release(&self, conversation_id: &ConversationId, monitor_id: &MonitorId) -> Result<Conversation> {
        let monitor = monitor_id.clone();
        self.inner
            .call(conversation_id, |reply| Command::Release { monitor, reply })
            .await
    }

    /// Archive the conversation. Its actor stops; the record stays in the store.
    pub async fn end_conversation(&self, conversation_id: &ConversationId) -> Result<Conversation> {
        let conv = self
            .inner
            .call(conversation_id, |reply| Command::End { reply })
            .await?;
        self.inner.remove_actor(conversation_id);
        Ok(conv)
    }

    /// Live view if the conversation is active, stored view otherwise.
    pub async fn conversation(&self, conversation_id: &ConversationId) -> Result<ConversationView> {
        self.inner.ensure_open()?;
        if let Some(tx) = self.inner.live_actor(conversation_id) {
            let (reply, rx) = oneshot::channel();
            if tx.send(Command::Get { reply }).await.is_ok() {
                if let Ok(view) = rx.await {
                    return Ok(view);
                }
            }
        }
        let store = &self.inner.ctx.store;
        let conversation = store
            .load_conversation(conversation_id)
            .await?
            .ok_or_else(|| EngineError::ConversationNotFound(conversation_id.clone()))?;
        let messages = store.messages(conversation_id).await?;
        let skip = messages.len().saturating_sub(self.inner.ctx.recent_messages);
        Ok(ConversationView {
            conversation,
            recent_messages: messages.into_iter().skip(skip).collect(),
            seq: 0,
        })
    }

    // ── connections ─────────────────────────────────────────────────────

    /// Register a transport connection and start its delivery queue.
    pub fn connect(&self, connection_id: ConnectionId, sink: Arc<dyn EventSink>) {
        self.inner.ctx.hub.attach(connection_id.clone(), sink);
        self.inner.connections.entry(connection_id).or_default();
    }

    /// Put a connection on the alert feed. Alerts for every conversation
    /// still waiting for a monitor are replayed to it.
    pub async fn connect_monitor(&self, connection_id: ConnectionId, monitor_id: MonitorId) -> Result<MonitorSession> {
        self.inner.ensure_open()?;
        if !self.inner.ctx.hub.is_attached(&connection_id) {
            return Err(EngineError::ConnectionNotFound(connection_id));
        }
        let dispatcher = &self.inner.ctx.dispatcher;
        let session = dispatcher.register(connection_id.clone(), monitor_id.clone());
        self.inner.update_monitor_gauge();
        info!(monitor_id = %monitor_id, connection_id = %connection_id, "monitor connected");

        let pending = dispatcher.pending();
        if !pending.is_empty() {
            debug!(monitor_id = %monitor_id, count = pending.len(), "replaying pending alerts");
        }
        for conversation_id in pending {
            if let Some(tx) = self.inner.live_actor(&conversation_id) {
                let _ = tx
                    .send(Command::ReplayAlert {
                        conn: connection_id.clone(),
                    })
                    .await;
            }
        }
        Ok(session)
    }

    /// Join a conversation. The first event delivered is a snapshot.
    pub async fn subscribe(
        &self,
        connection_id: &ConnectionId,
        conversation_id: &ConversationId,
        role: SubscriberRole,
    ) -> Result<Conversation> {
        if !self.inner.ctx.hub.is_attached(connection_id) {
            return Err(EngineError::ConnectionNotFound(connection_id.clone()));
        }
        let conn = connection_id.clone();
        let conv = self
            .inner
            .call(conversation_id, |reply| Command::Subscribe { conn, role, reply })
            .await?;
        self.inner.track(connection_id, conversation_id);
        Ok(conv)
    }

    /// Relay a typing indicator from a subscribed connection to the others.
    pub async fn typing(&self, connection_id: &ConnectionId, conversation_id: &ConversationId) -> Result<()> {
        let conn = connection_id.clone();
        self.inner
            .call(conversation_id, |reply| Command::Typing { conn, reply })
            .await
    }

    /// Keep-alive from a subscribed connection. Refreshes last activity and,
    /// for the user's connection, marks the user present again.
    pub async fn heartbeat(&self, connection_id: &ConnectionId, conversation_id: &ConversationId) -> Result<Conversation> {
        let conn = connection_id.clone();
        let at = Utc::now();
        self.inner
            .call(conversation_id, |reply| Command::Heartbeat { conn, at, reply })
            .await
    }

    pub async fn unsubscribe(&self, connection_id: &ConnectionId, conversation_id: &ConversationId) {
        if let Some(mut convs) = self.inner.connections.get_mut(connection_id) {
            convs.remove(conversation_id);
        }
        if let Some(tx) = self.inner.live_actor(conversation_id) {
            let _ = tx
                .send(Command::Unsubscribe {
                    conn: connection_id.clone(),
                })
                .await;
        }
    }

    /// Remove the connection from every fanout set.
    pub async fn disconnect(&self, connection_id: &ConnectionId) {
        self.inner.ctx.hub.detach(connection_id);
        self.inner.forget_connection(connection_id).await;
    }

    pub fn monitor_of(&self, connection_id: &ConnectionId) -> Option<MonitorId> {
        self.inner.ctx.dispatcher.monitor_of(connection_id)
    }

    pub fn pending_escalations(&self) -> Vec<ConversationId> {
        self.inner.ctx.dispatcher.pending()
    }

    pub fn health(&self) -> EngineHealth {
        let ctx = &self.inner.ctx;
        EngineHealth {
            active_conversations: self.inner.actors.len(),
            connections: ctx.hub.len(),
            monitor_sessions: ctx.dispatcher.session_count(),
            monitors: ctx.dispatcher.distinct_monitors(),
            pending_escalations: ctx.dispatcher.pending(),
            classifier_breaker: ctx.detector.classifier().breaker_state(),
            classifier_unavailable: ctx.detector.classifier().unavailable_count(),
            metrics: ctx.metrics.snapshot(),
        }
    }

    /// Stop accepting work. Actors drain their mailboxes and exit.
    pub fn shutdown(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            let active = self.inner.actors.len();
            self.inner.actors.clear();
            info!(active, "engine shut down");
        }
    }
}

impl EngineInner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::EngineShutdown);
        }
        Ok(())
    }

    fn spawn_actor(&self, conv: Conversation, history: Vec<Message>) -> mpsc::Sender<Command> {
        let id = conv.id.clone();
        let tx = self
            .actors
            .entry(id)
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(self.mailbox_size);
                let actor = ConversationActor::new(conv, history, self.ctx.clone());
                tokio::spawn(actor.run(rx));
                tx
            })
            .clone();
        self.update_conversation_gauge();
        tx
    }

    fn live_actor(&self, id: &ConversationId) -> Option<mpsc::Sender<Command>> {
        self.actors.get(id).map(|tx| tx.clone())
    }

    fn remove_actor(&self, id: &ConversationId) {
        if self.actors.remove(id).is_some() {
            self.update_conversation_gauge();
        }
    }

    /// Live actor, or one rebuilt from the store for an unarchived conversation.
    async fn actor(&self, id: &ConversationId) -> Result<mpsc::Sender<Command>> {
        self.ensure_open()?;
        if let Some(tx) = self.live_actor(id) {
            return Ok(tx);
        }
        let conv = self
            .ctx
            .store
            .load_conversation(id)
            .await?
            .ok_or_else(|| EngineError::ConversationNotFound(id.clone()))?;
        if conv.is_archived() {
            return Err(EngineError::ConversationArchived(id.clone()));
        }
        let history = self.ctx.store.messages(id).await?;
        debug!(conversation_id = %id, messages = history.len(), "rehydrating conversation");
        Ok(self.spawn_actor(conv, history))
    }

    async fn call<T>(
        &self,
        id: &ConversationId,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let tx = self.actor(id).await?;
        let (reply, rx) = oneshot::channel();
        if tx.send(make(reply)).await.is_err() {
            return Err(self.stopped_actor(id, &tx).await);
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(self.stopped_actor(id, &tx).await),
        }
    }

    /// The actor went away under us: it was ended, or the engine is closing.
    async fn stopped_actor(&self, id: &ConversationId, tx: &mpsc::Sender<Command>) -> EngineError {
        self.actors.remove_if(id, |_, live| live.same_channel(tx));
        if self.closed.load(Ordering::SeqCst) {
            return EngineError::EngineShutdown;
        }
        match self.ctx.store.load_conversation(id).await {
            Ok(Some(c)) if c.is_archived() => EngineError::ConversationArchived(id.clone()),
            _ => EngineError::EngineShutdown,
        }
    }

    fn track(&self, conn: &ConnectionId, conversation_id: &ConversationId) {
        if let Some(mut convs) = self.connections.get_mut(conn) {
            convs.insert(conversation_id.clone());
        }
    }

    async fn forget_connection(&self, conn: &ConnectionId) {
        if let Some(session) = self.ctx.dispatcher.remove(conn) {
            info!(monitor_id = %session.monitor_id, connection_id = %conn, "monitor disconnected");
            self.update_monitor_gauge();
        }
        let Some((_, convs)) = self.connections.remove(conn) else {
            return;
        };
        for conversation_id in convs {
            if let Some(tx) = self.live_actor(&conversation_id) {
                let _ = tx.send(Command::Unsubscribe { conn: conn.clone() }).await;
            }
        }
    }

    fn update_conversation_gauge(&self) {
        self.ctx
            .metrics
            .gauge_set(ACTIVE_CONVERSATIONS, &[], self.actors.len() as f64);
    }

    fn update_monitor_gauge(&self) {
        self.ctx
            .metrics
            .gauge_set(CONNECTED_MONITORS, &[], self.ctx.dispatcher.session_count() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::testing::{eventually, CollectingSink, FlakySink};
    use crate::metrics::*;
    use crate::store::MemoryStore;
    use lifeline_core::{ChatEvent, ClassifierError, ConversationMode, Envelope, RiskLevel};
    use lifeline_detect::{MockJudge, MockVerdict};
    use std::time::Duration;
    use lifeline_settings::{ClassifierSettings, DetectionSettings};

    fn engine_with(detector: Detector) -> (CrisisEngine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let engine = CrisisEngine::new(
            Arc::new(detector),
            store.clone(),
            Arc::new(MetricsRecorder::new()),
            EngineConfig::default(),
        );
        (engine, store)
    }

    fn engine() -> CrisisEngine {
        engine_with(Detector::local_only().unwrap()).0
    }

    async fn monitor(engine: &CrisisEngine, name: &str) -> (ConnectionId, Arc<CollectingSink>) {
        let conn = ConnectionId::new();
        let sink = CollectingSink::new();
        engine.connect(conn.clone(), sink.clone());
        engine.connect_monitor(conn.clone(), MonitorId::from_raw(name)).await.unwrap();
        (conn, sink)
    }

    async fn user(engine: &CrisisEngine, conv: &ConversationId) -> (ConnectionId, Arc<CollectingSink>) {
        let conn = ConnectionId::new();
        let sink = CollectingSink::new();
        engine.connect(conn.clone(), sink.clone());
        engine.subscribe(&conn, conv, SubscriberRole::User).await.unwrap();
        (conn, sink)
    }

    async fn say(engine: &CrisisEngine, conv: &ConversationId, text: &str) -> (Message, RiskAssessment) {
        engine.ingest(conv, SenderRole::User, text, Utc::now()).await.unwrap()
    }

    async fn escalated(engine: &CrisisEngine) -> ConversationId {
        let conv = engine.start_conversation(None).await.unwrap().id;
        let (msg, _) = say(engine, &conv, "não aguento mais").await;
        assert!(msg.notified);
        conv
    }

    #[tokio::test]
    async fn first_high_message_alerts_once() {
        let engine = engine();
        let (_, m1) = monitor(&engine, "ana").await;
        let (_, m2) = monitor(&engine, "bia").await;
        let conv = engine.start_conversation(Some("chat".into())).await.unwrap().id;
        let (_, u) = user(&engine, &conv).await;

        let (first, a) = say(&engine, &conv, "não aguento mais").await;
        assert_eq!(a.level, RiskLevel::High);
        assert!(first.notified);
        let (second, _) = say(&engine, &conv, "sem saída").await;
        assert!(!second.notified);

        assert!(eventually(|| m1.count("crisis_alert") == 1 && m2.count("crisis_alert") == 1).await);
        assert!(eventually(|| u.count("new_message") == 2).await);
        assert_eq!(u.count("crisis_alert"), 0);

        let view = engine.conversation(&conv).await.unwrap();
        assert_eq!(view.conversation.mode, ConversationMode::EscalatedPending);
        assert_eq!(view.conversation.escalations, 1);
        let metrics = engine.metrics();
        assert_eq!(metrics.counter_get(ESCALATIONS, &[("level", "high")]), 1);
        assert_eq!(metrics.counter_get(ALERTS_BROADCAST, &[]), 1);
        assert_eq!(metrics.counter_get(MESSAGES_INGESTED, &[("sender", "user")]), 2);
        assert_eq!(m1.count("crisis_alert"), 1);
    }

    #[tokio::test]
    async fn intent_with_classifier_agreement_alerts_every_monitor() {
        let judge = Arc::new(MockJudge::always(MockVerdict::ok(RiskLevel::High, 0.8)));
        let classifier = ClassifierSettings {
            enabled: true,
            ..Default::default()
        };
        let detector = Detector::from_settings(&DetectionSettings::default(), &classifier, Some(judge)).unwrap();
        let (engine, _) = engine_with(detector);
        let (_, m1) = monitor(&engine, "ana").await;
        let (_, m2) = monitor(&engine, "bia").await;
        let conv = engine.start_conversation(None).await.unwrap().id;

        let (msg, a) = say(&engine, &conv, "vou me matar hoje").await;
        assert_eq!(a.level, RiskLevel::Critical);
        assert!(a.confidence >= 0.9);
        assert!(a.requires_intervention);
        assert!(msg.notified);

        for sink in [&m1, &m2] {
            assert!(eventually(|| sink.count("crisis_alert") == 1).await);
            match &sink.envelopes()[0].event {
                ChatEvent::CrisisAlert {
                    risk_summary,
                    recent_messages,
                } => {
                    assert!(risk_summary.emergency_contact);
                    assert_eq!(risk_summary.triggering_message_id, msg.id);
                    assert_eq!(recent_messages.last().map(|m| &m.id), Some(&msg.id));
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn concurrent_claims_have_one_winner() {
        let engine = engine();
        monitor(&engine, "ana").await;
        monitor(&engine, "bia").await;
        let conv = escalated(&engine).await;

        let ana = MonitorId::from_raw("ana");
        let bia = MonitorId::from_raw("bia");
        let (ra, rb) = tokio::join!(engine.claim(&conv, &ana), engine.claim(&conv, &bia));

        let (winner, loser_err) = match (ra, rb) {
            (Ok(o), Err(e)) => {
                assert!(o.is_won());
                (ana, e)
            }
            (Err(e), Ok(o)) => {
                assert!(o.is_won());
                (bia, e)
            }
            other => panic!("expected exactly one winner, got {other:?}"),
        };
        match loser_err {
            EngineError::ClaimConflict { owner, .. } => assert_eq!(owner, winner),
            other => panic!("expected conflict, got {other:?}"),
        }

        let view = engine.conversation(&conv).await.unwrap();
        assert_eq!(view.conversation.mode, ConversationMode::Monitored);
        assert_eq!(view.conversation.assigned_monitor, Some(winner));
        assert!(engine.pending_escalations().is_empty());
        assert_eq!(engine.metrics().counter_get(CLAIMS_WON, &[]), 1);
        assert_eq!(engine.metrics().counter_get(CLAIMS_CONFLICTED, &[]), 1);
    }

    #[tokio::test]
    async fn late_subscriber_sees_every_message_once_in_order() {
        let engine = engine();
        let conv = engine.start_conversation(None).await.unwrap().id;
        let (_, early) = user(&engine, &conv).await;

        let mut ids = Vec::new();
        for i in 1..=2 {
            let (m, _) = engine.ingest(&conv, SenderRole::Automated, format!("M{i}"), Utc::now()).await.unwrap();
            ids.push(m.id);
        }
        let (_, late) = user(&engine, &conv).await;
        for i in 3..=5 {
            let (m, _) = engine.ingest(&conv, SenderRole::Automated, format!("M{i}"), Utc::now()).await.unwrap();
            ids.push(m.id);
        }

        assert!(eventually(|| early.envelopes().len() == 6 && late.envelopes().len() == 4).await);

        for sink in [&early, &late] {
            let envs = sink.envelopes();
            let seqs: Vec<u64> = envs.iter().map(|e| e.seq).collect();
            assert!(seqs.windows(2).all(|w| w[0] < w[1]), "seqs {seqs:?}");

            let mut seen = Vec::new();
            for env in envs {
                match env.event {
                    ChatEvent::Snapshot { recent_messages, .. } => {
                        seen.extend(recent_messages.into_iter().map(|m| m.id))
                    }
                    ChatEvent::NewMessage { message } => seen.push(message.id),
                    other => panic!("unexpected {other:?}"),
                }
            }
            assert_eq!(seen, ids);
        }
        assert_eq!(late.envelopes()[0].seq, 2);
    }

    #[tokio::test]
    async fn alert_without_monitors_is_retained_and_replayed() {
        let engine = engine();
        let conv = escalated(&engine).await;
        assert_eq!(engine.pending_escalations(), vec![conv.clone()]);
        assert_eq!(engine.metrics().counter_get(ALERTS_WITHOUT_MONITOR, &[]), 1);

        let (_, late) = monitor(&engine, "ana").await;
        assert!(eventually(|| late.count("crisis_alert") == 1).await);
        assert_eq!(late.envelopes()[0].conversation_id, conv);
    }

    #[tokio::test]
    async fn takeover_unsubscribes_other_monitors() {
        let engine = engine();
        let (bia_conn, bia) = monitor(&engine, "bia").await;
        let (_, ana) = monitor(&engine, "ana").await;
        let conv = engine.start_conversation(None).await.unwrap().id;
        engine
            .subscribe(&bia_conn, &conv, SubscriberRole::Monitor(MonitorId::from_raw("bia")))
            .await
            .unwrap();
        say(&engine, &conv, "não aguento mais").await;

        let ana_id = MonitorId::from_raw("ana");
        assert!(engine.claim(&conv, &ana_id).await.unwrap().is_won());
        say(&engine, &conv, "oi").await;

        // ana: alert, joined, snapshot, then the new message
        assert!(eventually(|| ana.count("new_message") == 1).await);
        assert_eq!(ana.event_types(), vec!["crisis_alert", "monitor_joined", "snapshot", "new_message"]);
        assert!(eventually(|| bia.count("monitor_joined") == 1).await);
        assert_eq!(bia.count("new_message"), 1);

        let err = engine
            .subscribe(&bia_conn, &conv, SubscriberRole::Monitor(MonitorId::from_raw("bia")))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotAssigned { .. }));
    }

    #[tokio::test]
    async fn only_the_assigned_monitor_talks_and_releases() {
        let engine = engine();
        monitor(&engine, "ana").await;
        let conv = escalated(&engine).await;
        let ana = MonitorId::from_raw("ana");
        let bia = MonitorId::from_raw("bia");

        assert!(matches!(
            engine.ingest_from_monitor(&conv, &ana, "olá", Utc::now()).await,
            Err(EngineError::NotAssigned { .. })
        ));
        engine.claim(&conv, &ana).await.unwrap();
        let (msg, _) = engine.ingest_from_monitor(&conv, &ana, "estou aqui com você", Utc::now()).await.unwrap();
        assert_eq!(msg.sender, SenderRole::Monitor);
        assert_eq!(msg.assessment.level, RiskLevel::None);

        assert!(matches!(engine.release(&conv, &bia).await, Err(EngineError::NotAssigned { .. })));
        let released = engine.release(&conv, &ana).await.unwrap();
        assert_eq!(released.mode, ConversationMode::Automated);
        assert!(released.assigned_monitor.is_none());
        assert!(matches!(
            engine.ingest_from_monitor(&conv, &ana, "ainda aqui", Utc::now()).await,
            Err(EngineError::NotAssigned { .. })
        ));
    }

    #[tokio::test]
    async fn claim_requires_escalation() {
        let engine = engine();
        let conv = engine.start_conversation(None).await.unwrap().id;
        assert!(matches!(
            engine.claim(&conv, &MonitorId::from_raw("ana")).await,
            Err(EngineError::NotEscalated(_))
        ));
    }

    #[tokio::test]
    async fn ended_conversation_is_archived_and_rejects_ingest() {
        let (engine, store) = engine_with(Detector::local_only().unwrap());
        let conv = engine.start_conversation(None).await.unwrap().id;
        let (_, u) = user(&engine, &conv).await;
        say(&engine, &conv, "oi").await;

        let ended = engine.end_conversation(&conv).await.unwrap();
        assert!(ended.is_archived());
        assert!(eventually(|| u.count("conversation_ended") == 1).await);

        assert!(matches!(
            engine.ingest(&conv, SenderRole::User, "ainda aí?", Utc::now()).await,
            Err(EngineError::ConversationArchived(_))
        ));
        let view = engine.conversation(&conv).await.unwrap();
        assert!(view.conversation.is_archived());
        assert_eq!(view.recent_messages.len(), 1);
        assert_eq!(store.messages(&conv).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn conversation_is_rehydrated_from_store() {
        let (engine, store) = engine_with(Detector::local_only().unwrap());
        let conv = Conversation::new(None);
        store.upsert_conversation(&conv).await.unwrap();
        let (msg, _) = say(&engine, &conv.id, "oi").await;
        assert_eq!(msg.conversation_id, conv.id);
        assert_eq!(engine.health().active_conversations, 1);
    }

    #[tokio::test]
    async fn unknown_conversation_and_monitor_sender() {
        let engine = engine();
        let missing = ConversationId::new();
        assert!(matches!(
            engine.ingest(&missing, SenderRole::User, "oi", Utc::now()).await,
            Err(EngineError::ConversationNotFound(_))
        ));
        let conv = engine.start_conversation(None).await.unwrap().id;
        assert!(matches!(
            engine.ingest(&conv, SenderRole::Monitor, "oi", Utc::now()).await,
            Err(EngineError::MonitorIdentityRequired)
        ));
    }

    #[tokio::test]
    async fn disconnect_removes_connection_everywhere() {
        let engine = engine();
        let (conn, _) = monitor(&engine, "ana").await;
        let conv = engine.start_conversation(None).await.unwrap().id;
        engine
            .subscribe(&conn, &conv, SubscriberRole::Monitor(MonitorId::from_raw("ana")))
            .await
            .unwrap();
        engine.disconnect(&conn).await;

        assert!(engine.monitor_of(&conn).is_none());
        assert_eq!(engine.health().monitor_sessions, 0);
        assert_eq!(engine.health().connections, 0);
        say(&engine, &conv, "não aguento mais").await;
        assert_eq!(engine.metrics().counter_get(ALERTS_WITHOUT_MONITOR, &[]), 1);
        assert!(matches!(
            engine.subscribe(&conn, &conv, SubscriberRole::User).await,
            Err(EngineError::ConnectionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn failing_monitor_is_dropped_without_stalling_others() {
        let engine = engine();
        let broken = ConnectionId::new();
        engine.connect(broken.clone(), FlakySink::permanent());
        engine.connect_monitor(broken.clone(), MonitorId::from_raw("bia")).await.unwrap();
        let (_, ana) = monitor(&engine, "ana").await;

        escalated(&engine).await;
        assert!(eventually(|| ana.count("crisis_alert") == 1).await);
        assert!(eventually(|| engine.monitor_of(&broken).is_none()).await);
        assert_eq!(
            engine.metrics().counter_get(SUBSCRIBERS_DROPPED, &[("reason", "permanent")]),
            1
        );
    }

    #[tokio::test]
    async fn shutdown_rejects_new_work() {
        let engine = engine();
        let conv = engine.start_conversation(None).await.unwrap().id;
        engine.shutdown();
        assert!(matches!(
            engine.ingest(&conv, SenderRole::User, "oi", Utc::now()).await,
            Err(EngineError::EngineShutdown)
        ));
        assert!(matches!(engine.start_conversation(None).await, Err(EngineError::EngineShutdown)));
    }

    #[tokio::test]
    async fn health_reports_pending_and_metrics() {
        let engine = engine();
        let conv = escalated(&engine).await;
        let health = engine.health();
        assert_eq!(health.pending_escalations, vec![conv]);
        assert_eq!(health.classifier_breaker, "disabled");
        assert!(health.metrics.counters.contains_key("escalations{level=high}"));
        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["activeConversations"], 1);
    }

    #[tokio::test]
    async fn health_counts_classifier_outages() {
        let judge = Arc::new(MockJudge::always(MockVerdict::err(ClassifierError::Transport("refused".into()))));
        let classifier = ClassifierSettings {
            enabled: true,
            ..Default::default()
        };
        let detector = Detector::from_settings(&DetectionSettings::default(), &classifier, Some(judge)).unwrap();
        let (engine, _) = engine_with(detector);
        let conv = engine.start_conversation(None).await.unwrap().id;

        let (_, a) = say(&engine, &conv, "vou me matar hoje").await;
        assert!(a.partial);
        let health = engine.health();
        assert_eq!(health.classifier_unavailable, 1);
        assert_eq!(engine.metrics().counter_get(CLASSIFIER_UNAVAILABLE, &[]), 1);
        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["classifierUnavailable"], 1);
    }

    #[tokio::test]
    async fn rejoining_monitor_does_not_get_the_alert_twice() {
        let engine = engine();
        let (conn, ana) = monitor(&engine, "ana").await;
        let conv = escalated(&engine).await;
        assert!(eventually(|| ana.count("crisis_alert") == 1).await);

        // same connection registers again while the alert is pending
        engine.connect_monitor(conn.clone(), MonitorId::from_raw("ana")).await.unwrap();
        engine.conversation(&conv).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ana.count("crisis_alert"), 1);

        // a monitor subscribed to the conversation already has it too
        let bia_conn = ConnectionId::new();
        let bia = CollectingSink::new();
        engine.connect(bia_conn.clone(), bia.clone());
        engine
            .subscribe(&bia_conn, &conv, SubscriberRole::Monitor(MonitorId::from_raw("bia")))
            .await
            .unwrap();
        engine.connect_monitor(bia_conn, MonitorId::from_raw("bia")).await.unwrap();
        engine.conversation(&conv).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(bia.count("crisis_alert"), 0);
        assert_eq!(bia.count("snapshot"), 1);
    }

    #[tokio::test]
    async fn out_of_order_delivery_forces_escalation() {
        let engine = engine();
        let (_, ana) = monitor(&engine, "ana").await;
        let conv = escalated(&engine).await;
        let ana_id = MonitorId::from_raw("ana");
        assert!(engine.claim(&conv, &ana_id).await.unwrap().is_won());
        let (user_conn, u) = user(&engine, &conv).await;
        say(&engine, &conv, "oi").await;
        assert!(eventually(|| u.count("new_message") == 1).await);

        let stale = Envelope::new(conv.clone(), 1, ChatEvent::ConversationEnded);
        assert!(engine.inner.ctx.hub.enqueue(&user_conn, stale));

        assert!(eventually(|| engine.pending_escalations() == vec![conv.clone()]).await);
        let view = engine.conversation(&conv).await.unwrap();
        assert_eq!(view.conversation.mode, ConversationMode::EscalatedPending);
        assert!(view.conversation.assigned_monitor.is_none());
        assert!(eventually(|| ana.count("crisis_alert") == 2).await);
        assert_eq!(u.count("conversation_ended"), 0);
        assert_eq!(
            engine.metrics().counter_get(INVARIANT_VIOLATIONS, &[("kind", "delivery_order")]),
            1
        );

        // ana was unsubscribed and has to claim again
        let (msg, _) = say(&engine, &conv, "ainda aqui").await;
        assert!(eventually(|| u.count("new_message") == 2).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!ana.envelopes().iter().any(|e| matches!(
            &e.event,
            ChatEvent::NewMessage { message } if message.id == msg.id
        )));
    }

    #[tokio::test]
    async fn monitors_learn_when_the_user_leaves() {
        let engine = engine();
        let (_, ana) = monitor(&engine, "ana").await;
        let (bia_conn, bia) = monitor(&engine, "bia").await;
        let conv = engine.start_conversation(None).await.unwrap().id;
        engine
            .subscribe(&bia_conn, &conv, SubscriberRole::Monitor(MonitorId::from_raw("bia")))
            .await
            .unwrap();
        let (first, _) = user(&engine, &conv).await;
        let (second, _) = user(&engine, &conv).await;

        // a second user connection is still present
        engine.unsubscribe(&first, &conv).await;
        let view = engine.conversation(&conv).await.unwrap();
        assert!(view.conversation.user_connected);

        engine.disconnect(&second).await;
        assert!(eventually(|| ana.count("user_disconnected") == 1 && bia.count("user_disconnected") == 1).await);
        let view = engine.conversation(&conv).await.unwrap();
        assert!(!view.conversation.user_connected);

        // monitor churn does not repeat the notice
        engine.unsubscribe(&bia_conn, &conv).await;
        engine.conversation(&conv).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ana.count("user_disconnected"), 1);

        let (_, back) = user(&engine, &conv).await;
        assert!(eventually(|| back.count("snapshot") == 1).await);
        match &back.envelopes()[0].event {
            ChatEvent::Snapshot { conversation, .. } => assert!(conversation.user_connected),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn heartbeat_refreshes_activity_and_presence() {
        let (engine, store) = engine_with(Detector::local_only().unwrap());
        let conv = engine.start_conversation(None).await.unwrap().id;
        let (conn, _) = user(&engine, &conv).await;
        let before = engine.conversation(&conv).await.unwrap().conversation.last_activity;

        tokio::time::sleep(Duration::from_millis(5)).await;
        let after = engine.heartbeat(&conn, &conv).await.unwrap();
        assert!(after.last_activity > before);
        assert!(after.user_connected);
        let stored = store.load_conversation(&conv).await.unwrap().unwrap();
        assert_eq!(stored.last_activity, after.last_activity);

        let stranger = ConnectionId::new();
        engine.connect(stranger.clone(), CollectingSink::new());
        assert!(matches!(
            engine.heartbeat(&stranger, &conv).await,
            Err(EngineError::NotSubscribed { .. })
        ));
    }

    #[tokio::test]
    async fn typing_is_relayed_to_everyone_but_the_sender() {
        let engine = engine();
        let (ana_conn, ana) = monitor(&engine, "ana").await;
        let conv = escalated(&engine).await;
        engine.claim(&conv, &MonitorId::from_raw("ana")).await.unwrap();
        let (user_conn, u) = user(&engine, &conv).await;

        engine.typing(&user_conn, &conv).await.unwrap();
        assert!(eventually(|| ana.count("typing") == 1).await);
        match &ana.envelopes().last().map(|e| e.event.clone()) {
            Some(ChatEvent::Typing { sender }) => assert_eq!(*sender, SenderRole::User),
            other => panic!("unexpected {other:?}"),
        }

        engine.typing(&ana_conn, &conv).await.unwrap();
        assert!(eventually(|| u.count("typing") == 1).await);
        assert_eq!(ana.count("typing"), 1);

        let outsider = ConnectionId::new();
        engine.connect(outsider.clone(), CollectingSink::new());
        let err = engine.typing(&outsider, &conv).await.unwrap_err();
        assert_eq!(err.code(), "NOT_SUBSCRIBED");
    }
}
