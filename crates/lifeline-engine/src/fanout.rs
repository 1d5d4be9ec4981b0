//! Per-subscriber ordered delivery.
//!
//! Every connection gets one bounded FIFO queue and one delivery task. The
//! conversation actors only ever `try_send` into those queues, so a slow or
//! dead subscriber can stall nobody but itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use lifeline_core::{ChatEvent, ConnectionId, ConversationId, Envelope};
use lifeline_settings::DeliverySettings;
use lifeline_telemetry::MetricsRecorder;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::metrics::{DELIVERIES_RETRIED, INVARIANT_VIOLATIONS, SUBSCRIBERS_DROPPED};

const JITTER_FACTOR: f64 = 0.2;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// Worth retrying (e.g. the socket buffer is momentarily full).
    #[error("transient delivery failure: {0}")]
    Transient(String),
    /// The peer is gone.
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

/// Where a subscriber's envelopes end up.
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    async fn deliver(&self, envelope: &Envelope) -> Result<(), DeliveryError>;

    /// Called once when the hub gives up on this sink. Transports should
    /// tear the connection down so the peer reconnects and resubscribes.
    fn close(&self) {}
}

/// What the hub reports back to its owner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HubNotice {
    /// The subscriber was dropped; purge it everywhere.
    Dropped(ConnectionId),
    /// An envelope went backwards for this subscriber and was withheld.
    OutOfOrder {
        connection_id: ConnectionId,
        conversation_id: ConversationId,
    },
}

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// `min(max_delay, base * 2^attempt)` stretched by up to 20% jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(16));
        let capped = exp.min(self.max_delay);
        capped.mul_f64(1.0 + rand::random::<f64>() * JITTER_FACTOR)
    }
}

impl From<&DeliverySettings> for RetryPolicy {
    fn from(s: &DeliverySettings) -> Self {
        Self {
            max_retries: s.max_retries,
            base_delay: Duration::from_millis(s.base_delay_ms),
            max_delay: Duration::from_millis(s.max_delay_ms),
        }
    }
}

struct Subscriber {
    generation: u64,
    tx: mpsc::Sender<Envelope>,
    sink: Arc<dyn EventSink>,
}

struct HubInner {
    subscribers: DashMap<ConnectionId, Subscriber>,
    next_generation: AtomicU64,
    queue_size: usize,
    policy: RetryPolicy,
    metrics: Arc<MetricsRecorder>,
    notices: mpsc::UnboundedSender<HubNotice>,
}

impl HubInner {
    fn drop_subscriber(&self, conn: &ConnectionId, generation: u64, reason: &str) {
        if let Some((_, sub)) = self.subscribers.remove_if(conn, |_, s| s.generation == generation) {
            warn!(connection_id = %conn, reason, "subscriber dropped from fanout");
            self.metrics.counter_inc(SUBSCRIBERS_DROPPED, &[("reason", reason)], 1);
            sub.sink.close();
            let _ = self.notices.send(HubNotice::Dropped(conn.clone()));
        }
    }
}

/// Registry of delivery queues, keyed by connection.
#[derive(Clone)]
pub struct SubscriberHub {
    inner: Arc<HubInner>,
}

impl SubscriberHub {
    /// `notices` receives every connection the hub gives up on and every
    /// ordering violation, so the owner can purge or repair its own state.
    pub fn new(
        settings: &DeliverySettings,
        metrics: Arc<MetricsRecorder>,
        notices: mpsc::UnboundedSender<HubNotice>,
    ) -> Self {
        Self {
            inner: Arc::new(HubInner {
                subscribers: DashMap::new(),
                next_generation: AtomicU64::new(1),
                queue_size: settings.queue_size.max(1),
                policy: RetryPolicy::from(settings),
                metrics,
                notices,
            }),
        }
    }

    /// Start a delivery task for `conn`. Re-attaching replaces the old queue.
    pub fn attach(&self, conn: ConnectionId, sink: Arc<dyn EventSink>) {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.queue_size);
        self.inner
            .subscribers
            .insert(
                conn.clone(),
                Subscriber {
                    generation,
                    tx,
                    sink: sink.clone(),
                },
            );
        let hub = Arc::downgrade(&self.inner);
        let policy = self.inner.policy;
        let metrics = self.inner.metrics.clone();
        tokio::spawn(run_delivery(conn, generation, sink, rx, policy, metrics, hub));
    }

    /// Remove without the drop notification or closing the sink; the owner
    /// already knows.
    pub fn detach(&self, conn: &ConnectionId) -> bool {
        self.inner.subscribers.remove(conn).is_some()
    }

    pub fn is_attached(&self, conn: &ConnectionId) -> bool {
        self.inner.subscribers.contains_key(conn)
    }

    pub fn len(&self) -> usize {
        self.inner.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.subscribers.is_empty()
    }

    /// Never blocks. Returns false if `conn` is not (or no longer) attached.
    /// A full queue drops the subscriber.
    pub fn enqueue(&self, conn: &ConnectionId, envelope: Envelope) -> bool {
        let attempt = {
            let Some(sub) = self.inner.subscribers.get(conn) else {
                return false;
            };
            (sub.generation, sub.tx.try_send(envelope))
        };
        match attempt {
            (_, Ok(())) => true,
            (generation, Err(mpsc::error::TrySendError::Full(_))) => {
                self.inner.drop_subscriber(conn, generation, "overflow");
                false
            }
            (generation, Err(mpsc::error::TrySendError::Closed(_))) => {
                self.inner.drop_subscriber(conn, generation, "closed");
                false
            }
        }
    }
}

/// Per-conversation seq tracking for one subscriber. Snapshots and replayed
/// alerts are stamped with the current seq, so they may repeat it.
#[derive(Default)]
struct OrderGuard {
    last: HashMap<ConversationId, u64>,
}

impl OrderGuard {
    fn admit(&mut self, env: &Envelope) -> bool {
        let restamp = matches!(env.event, ChatEvent::Snapshot { .. } | ChatEvent::CrisisAlert { .. });
        match self.last.get(&env.conversation_id) {
            Some(&last) if env.seq < last || (env.seq == last && !restamp) => false,
            _ => {
                self.last.insert(env.conversation_id.clone(), env.seq);
                true
            }
        }
    }
}

async fn run_delivery(
    conn: ConnectionId,
    generation: u64,
    sink: Arc<dyn EventSink>,
    mut rx: mpsc::Receiver<Envelope>,
    policy: RetryPolicy,
    metrics: Arc<MetricsRecorder>,
    hub: Weak<HubInner>,
) {
    let mut order = OrderGuard::default();
    while let Some(env) = rx.recv().await {
        if !order.admit(&env) {
            error!(
                connection_id = %conn,
                conversation_id = %env.conversation_id,
                seq = env.seq,
                event = env.event.event_type(),
                "out-of-order envelope skipped"
            );
            metrics.counter_inc(INVARIANT_VIOLATIONS, &[("kind", "delivery_order")], 1);
            if let Some(hub) = hub.upgrade() {
                let _ = hub.notices.send(HubNotice::OutOfOrder {
                    connection_id: conn.clone(),
                    conversation_id: env.conversation_id.clone(),
                });
            }
            continue;
        }

        if let Err(reason) = deliver_with_retry(&conn, sink.as_ref(), &env, &policy, &metrics).await {
            if let Some(hub) = hub.upgrade() {
                hub.drop_subscriber(&conn, generation, reason);
            }
            return;
        }
    }
    debug!(connection_id = %conn, "delivery queue closed");
}

async fn deliver_with_retry(
    conn: &ConnectionId,
    sink: &dyn EventSink,
    env: &Envelope,
    policy: &RetryPolicy,
    metrics: &MetricsRecorder,
) -> Result<(), &'static str> {
    let mut attempt = 0;
    loop {
        match sink.deliver(env).await {
            Ok(()) => return Ok(()),
            Err(DeliveryError::Permanent(msg)) => {
                debug!(connection_id = %conn, error = %msg, "permanent delivery failure");
                return Err("permanent");
            }
            Err(DeliveryError::Transient(msg)) => {
                if attempt >= policy.max_retries {
                    debug!(connection_id = %conn, error = %msg, attempts = attempt + 1, "retries exhausted");
                    return Err("retries_exhausted");
                }
                let delay = policy.backoff(attempt);
                debug!(connection_id = %conn, error = %msg, attempt, ?delay, "retrying delivery");
                metrics.counter_inc(DELIVERIES_RETRIED, &[], 1);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicU32;

    /// Records everything it receives.
    #[derive(Default)]
    pub struct CollectingSink {
        received: Mutex<Vec<Envelope>>,
    }

    impl CollectingSink {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn envelopes(&self) -> Vec<Envelope> {
            self.received.lock().clone()
        }

        pub fn event_types(&self) -> Vec<&'static str> {
            self.received.lock().iter().map(|e| e.event.event_type()).collect()
        }

        pub fn count(&self, event_type: &str) -> usize {
            self.received
                .lock()
                .iter()
                .filter(|e| e.event.event_type() == event_type)
                .count()
        }
    }

    #[async_trait]
    impl EventSink for CollectingSink {
        async fn deliver(&self, envelope: &Envelope) -> Result<(), DeliveryError> {
            self.received.lock().push(envelope.clone());
            Ok(())
        }
    }

    /// Fails the first `failures` deliveries, then records like `CollectingSink`.
    pub struct FlakySink {
        failures: AtomicU32,
        permanent: bool,
        pub inner: Arc<CollectingSink>,
    }

    impl FlakySink {
        pub fn transient(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures: AtomicU32::new(failures),
                permanent: false,
                inner: CollectingSink::new(),
            })
        }

        pub fn permanent() -> Arc<Self> {
            Arc::new(Self {
                failures: AtomicU32::new(u32::MAX),
                permanent: true,
                inner: CollectingSink::new(),
            })
        }
    }

    #[async_trait]
    impl EventSink for FlakySink {
        async fn deliver(&self, envelope: &Envelope) -> Result<(), DeliveryError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(if self.permanent {
                    DeliveryError::Permanent("gone".into())
                } else {
                    DeliveryError::Transient("busy".into())
                });
            }
            self.inner.deliver(envelope).await
        }
    }

    /// Never completes a delivery and records `close` calls.
    #[derive(Default)]
    pub struct ClosingSink {
        closed: AtomicU32,
    }

    impl ClosingSink {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn is_closed(&self) -> bool {
            self.closes() > 0
        }

        pub fn closes(&self) -> u32 {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventSink for ClosingSink {
        async fn deliver(&self, _envelope: &Envelope) -> Result<(), DeliveryError> {
            std::future::pending().await
        }

        fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Never completes a delivery.
    pub struct StuckSink;

    #[async_trait]
    impl EventSink for StuckSink {
        async fn deliver(&self, _envelope: &Envelope) -> Result<(), DeliveryError> {
            std::future::pending().await
        }
    }

    /// Poll `cond` until it holds or two seconds pass.
    pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }
}
