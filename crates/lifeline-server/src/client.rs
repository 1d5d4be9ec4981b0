use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use lifeline_core::{ConnectionId, Envelope};
use lifeline_engine::{DeliveryError, EventSink};
use tokio::sync::mpsc;

/// A connected WebSocket client.
pub struct Client {
    pub id: ConnectionId,
    tx: mpsc::Sender<String>,
    connected: AtomicBool,
    last_pong: AtomicU64,
}

impl Client {
    fn new(id: ConnectionId, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            tx,
            connected: AtomicBool::new(true),
            last_pong: AtomicU64::new(now_secs()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < timeout.as_secs()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Result of queueing a frame for one client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    Full,
    Gone,
}

/// Registry of all connected WebSocket clients.
pub struct ClientRegistry {
    clients: DashMap<ConnectionId, Arc<Client>>,
    max_send_queue: usize,
    client_timeout: Duration,
}

impl ClientRegistry {
    pub fn new(max_send_queue: usize, client_timeout: Duration) -> Self {
        Self {
            clients: DashMap::new(),
            max_send_queue: max_send_queue.max(1),
            client_timeout,
        }
    }

    /// Register a new client and return its ID + outbound frame receiver.
    pub fn register(&self) -> (ConnectionId, mpsc::Receiver<String>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        self.clients.insert(id.clone(), Arc::new(Client::new(id.clone(), tx)));
        (id, rx)
    }

    pub fn unregister(&self, id: &ConnectionId) -> bool {
        match self.clients.remove(id) {
            Some((_, client)) => {
                client.connected.store(false, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Client>> {
        self.clients.get(id).map(|c| Arc::clone(&c))
    }

    /// Never waits for room in the queue.
    pub fn send_to(&self, id: &ConnectionId, frame: String) -> SendOutcome {
        let Some(client) = self.get(id) else {
            return SendOutcome::Gone;
        };
        if !client.is_connected() {
            return SendOutcome::Gone;
        }
        match client.tx.try_send(frame) {
            Ok(()) => SendOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                tracing::debug!(connection_id = %id, frame_len = frame.len(), "send queue full");
                SendOutcome::Full
            }
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Gone,
        }
    }

    pub fn count(&self) -> usize {
        self.clients.len()
    }

    /// Remove clients that haven't answered a ping within the timeout.
    pub fn cleanup_dead_clients(&self) -> Vec<ConnectionId> {
        let dead: Vec<ConnectionId> = self
            .clients
            .iter()
            .filter(|entry| !entry.value().is_alive(self.client_timeout))
            .map(|entry| entry.key().clone())
            .collect();

        for id in &dead {
            self.unregister(id);
            tracing::info!(connection_id = %id, "cleaned up dead client");
        }
        dead
    }
}

/// Delivers engine envelopes to one client's outbound queue.
pub struct WsSink {
    registry: Arc<ClientRegistry>,
    connection_id: ConnectionId,
}

impl WsSink {
    pub fn new(registry: Arc<ClientRegistry>, connection_id: ConnectionId) -> Self {
        Self {
            registry,
            connection_id,
        }
    }
}

#[async_trait]
impl EventSink for WsSink {
    async fn deliver(&self, envelope: &Envelope) -> Result<(), DeliveryError> {
        let frame = serde_json::to_string(envelope).map_err(|e| DeliveryError::Permanent(e.to_string()))?;
        match self.registry.send_to(&self.connection_id, frame) {
            SendOutcome::Queued => Ok(()),
            SendOutcome::Full => Err(DeliveryError::Transient("client send queue full".into())),
            SendOutcome::Gone => Err(DeliveryError::Permanent("client disconnected".into())),
        }
    }

    /// Dropping the registry entry ends the writer, which closes the socket.
    fn close(&self) {
        if self.registry.unregister(&self.connection_id) {
            tracing::info!(connection_id = %self.connection_id, "closing client dropped by the engine");
        }
    }
}

/// Split the socket into reader/writer halves and run until either side ends.
/// Text frames are handed to `on_message` in arrival order.
pub async fn handle_ws_connection(
    socket: WebSocket,
    connection_id: ConnectionId,
    mut rx: mpsc::Receiver<String>,
    registry: Arc<ClientRegistry>,
    on_message: mpsc::Sender<String>,
    heartbeat: Duration,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_id = connection_id.clone();
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat);
        ping_interval.tick().await; // first tick is immediate

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(text) = msg else {
                        let _ = ws_tx.send(WsMessage::Close(None)).await;
                        break;
                    };
                    if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(connection_id = %writer_id, "sent ping");
                }
            }
        }
    });

    let reader_id = connection_id.clone();
    let reader_registry = Arc::clone(&registry);
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    if on_message.send(text.to_string()).await.is_err() {
                        break;
                    }
                }
                WsMessage::Pong(_) => {
                    if let Some(client) = reader_registry.get(&reader_id) {
                        client.record_pong();
                    }
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    registry.unregister(&connection_id);
}

/// Periodically drop clients that stopped answering pings. Each removed
/// connection is reported on `dead_tx`.
pub fn start_cleanup_task(
    registry: Arc<ClientRegistry>,
    interval: Duration,
    dead_tx: mpsc::UnboundedSender<ConnectionId>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = registry.cleanup_dead_clients();
            if !removed.is_empty() {
                tracing::info!(removed = removed.len(), "dead client cleanup");
            }
            for id in removed {
                if dead_tx.send(id).is_err() {
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lifeline_core::{ChatEvent, ConversationId};

    fn registry(queue: usize) -> ClientRegistry {
        ClientRegistry::new(queue, Duration::from_secs(90))
    }

    #[test]
    fn register_and_unregister() {
        let registry = registry(32);
        let (id1, _rx1) = registry.register();
        let (id2, _rx2) = registry.register();
        assert_ne!(id1, id2);
        assert_eq!(registry.count(), 2);

        assert!(registry.unregister(&id1));
        assert!(!registry.unregister(&id1));
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn send_to_specific_client() {
        let registry = registry(32);
        let (id, mut rx) = registry.register();
        assert_eq!(registry.send_to(&id, "hello".into()), SendOutcome::Queued);
        assert_eq!(rx.recv().await.unwrap(), "hello");
        assert_eq!(registry.send_to(&ConnectionId::new(), "x".into()), SendOutcome::Gone);
    }

    #[test]
    fn full_queue_reports_full() {
        let registry = registry(2);
        let (id, _rx) = registry.register();
        assert_eq!(registry.send_to(&id, "1".into()), SendOutcome::Queued);
        assert_eq!(registry.send_to(&id, "2".into()), SendOutcome::Queued);
        assert_eq!(registry.send_to(&id, "3".into()), SendOutcome::Full);
    }

    #[tokio::test]
    async fn sink_maps_queue_state_to_delivery_errors() {
        let registry = Arc::new(registry(1));
        let (id, mut rx) = registry.register();
        let sink = WsSink::new(Arc::clone(&registry), id.clone());
        let env = Envelope::new(ConversationId::from_raw("conv_1"), 1, ChatEvent::ConversationEnded);

        sink.deliver(&env).await.unwrap();
        assert!(matches!(sink.deliver(&env).await, Err(DeliveryError::Transient(_))));

        let frame: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "conversation_ended");
        assert_eq!(frame["seq"], 1);

        registry.unregister(&id);
        assert!(matches!(sink.deliver(&env).await, Err(DeliveryError::Permanent(_))));
    }

    #[tokio::test]
    async fn closing_the_sink_ends_the_outbound_queue() {
        let registry = Arc::new(registry(4));
        let (id, mut rx) = registry.register();
        let sink = WsSink::new(Arc::clone(&registry), id.clone());
        let env = Envelope::new(ConversationId::from_raw("conv_1"), 1, ChatEvent::ConversationEnded);
        sink.deliver(&env).await.unwrap();

        sink.close();
        assert!(registry.get(&id).is_none());
        // frames already queued still drain, then the writer sees the end
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
        assert!(matches!(sink.deliver(&env).await, Err(DeliveryError::Permanent(_))));
    }

    #[test]
    fn cleanup_removes_expired_clients() {
        let registry = registry(8);
        let (id, _rx) = registry.register();
        let (_alive, _rx2) = registry.register();
        registry.get(&id).unwrap().last_pong.store(0, Ordering::Relaxed);

        assert_eq!(registry.cleanup_dead_clients(), vec![id]);
        assert_eq!(registry.count(), 1);
    }
}
