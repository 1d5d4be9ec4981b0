//! RPC method handlers. Each one is a thin translation onto [`CrisisEngine`].

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use lifeline_core::{ConnectionId, ConversationId, MonitorId, SenderRole};
use lifeline_engine::{CrisisEngine, SubscriberRole};

use crate::client::ClientRegistry;
use crate::rpc::{self, RpcResponse};

/// Shared state available to all RPC handlers.
pub struct HandlerState {
    pub engine: CrisisEngine,
    pub registry: Arc<ClientRegistry>,
    pub started_at: Instant,
}

impl HandlerState {
    pub fn new(engine: CrisisEngine, registry: Arc<ClientRegistry>) -> Self {
        Self {
            engine,
            registry,
            started_at: Instant::now(),
        }
    }
}

type Id = Option<serde_json::Value>;

/// Dispatch an RPC method from connection `conn` to its handler.
pub async fn dispatch(
    state: &Arc<HandlerState>,
    conn: &ConnectionId,
    method: &str,
    params: &serde_json::Value,
    id: Id,
) -> RpcResponse {
    let params = rpc::normalize_params(params);

    match method {
        "conversation.start" => conversation_start(state, conn, &params, id).await,
        "conversation.join" => conversation_join(state, conn, &params, id).await,
        "conversation.leave" => conversation_leave(state, conn, &params, id).await,
        "conversation.claim" => conversation_claim(state, conn, &params, id).await,
        "conversation.release" => conversation_release(state, conn, &params, id).await,
        "conversation.end" => conversation_end(state, &params, id).await,
        "conversation.get" => conversation_get(state, &params, id).await,
        "conversation.typing" => conversation_typing(state, conn, &params, id).await,
        "conversation.heartbeat" => conversation_heartbeat(state, conn, &params, id).await,
        "monitor.join" => monitor_join(state, conn, &params, id).await,
        "message.send" => message_send(state, conn, &params, id).await,
        "health" | "system.ping" => health(state, id),
        _ => RpcResponse::method_not_found(id, method),
    }
}

fn conversation_id(params: &serde_json::Value) -> Result<ConversationId, String> {
    rpc::require_str(params, "conversation_id").map(ConversationId::from_raw)
}

/// The monitor identity bound to this connection by `monitor.join`.
fn caller_monitor(state: &HandlerState, conn: &ConnectionId) -> Result<MonitorId, String> {
    state
        .engine
        .monitor_of(conn)
        .ok_or_else(|| "connection has not joined as a monitor".to_string())
}

async fn conversation_start(
    state: &Arc<HandlerState>,
    conn: &ConnectionId,
    params: &serde_json::Value,
    id: Id,
) -> RpcResponse {
    let title = rpc::optional_str(params, "title").map(str::to_string);
    let conv = match state.engine.start_conversation(title).await {
        Ok(c) => c,
        Err(e) => return RpcResponse::engine_error(id, &e),
    };
    // the creator follows its own conversation
    if let Err(e) = state.engine.subscribe(conn, &conv.id, SubscriberRole::User).await {
        return RpcResponse::engine_error(id, &e);
    }
    RpcResponse::success(id, serde_json::json!({ "conversation": conv }))
}

async fn conversation_join(
    state: &Arc<HandlerState>,
    conn: &ConnectionId,
    params: &serde_json::Value,
    id: Id,
) -> RpcResponse {
    let conversation_id = match conversation_id(params) {
        Ok(c) => c,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let role = match rpc::optional_str(params, "role").unwrap_or("user") {
        "user" => SubscriberRole::User,
        "monitor" => match caller_monitor(state, conn) {
            Ok(m) => SubscriberRole::Monitor(m),
            Err(e) => return RpcResponse::invalid_params(id, e),
        },
        other => return RpcResponse::invalid_params(id, format!("Unknown role: {other}")),
    };
    match state.engine.subscribe(conn, &conversation_id, role).await {
        Ok(conv) => RpcResponse::success(id, serde_json::json!({ "conversation": conv })),
        Err(e) => RpcResponse::engine_error(id, &e),
    }
}

async fn conversation_leave(
    state: &Arc<HandlerState>,
    conn: &ConnectionId,
    params: &serde_json::Value,
    id: Id,
) -> RpcResponse {
    let conversation_id = match conversation_id(params) {
        Ok(c) => c,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    state.engine.unsubscribe(conn, &conversation_id).await;
    RpcResponse::success(id, serde_json::json!({ "left": true }))
}

async fn conversation_claim(
    state: &Arc<HandlerState>,
    conn: &ConnectionId,
    params: &serde_json::Value,
    id: Id,
) -> RpcResponse {
    let (conversation_id, monitor) = match conversation_id(params).and_then(|c| Ok((c, caller_monitor(state, conn)?))) {
        Ok(v) => v,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match state.engine.claim(&conversation_id, &monitor).await {
        Ok(outcome) => RpcResponse::success(
            id,
            serde_json::json!({
                "won": outcome.is_won(),
                "conversation": outcome.conversation(),
            }),
        ),
        Err(e) => RpcResponse::engine_error(id, &e),
    }
}

async fn conversation_release(
    state: &Arc<HandlerState>,
    conn: &ConnectionId,
    params: &serde_json::Value,
    id: Id,
) -> RpcResponse {
    let (conversation_id, monitor) = match conversation_id(params).and_then(|c| Ok((c, caller_monitor(state, conn)?))) {
        Ok(v) => v,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match state.engine.release(&conversation_id, &monitor).await {
        Ok(conv) => RpcResponse::success(id, serde_json::json!({ "conversation": conv })),
        Err(e) => RpcResponse::engine_error(id, &e),
    }
}

async fn conversation_end(state: &Arc<HandlerState>, params: &serde_json::Value, id: Id) -> RpcResponse {
    let conversation_id = match conversation_id(params) {
        Ok(c) => c,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match state.engine.end_conversation(&conversation_id).await {
        Ok(conv) => RpcResponse::success(id, serde_json::json!({ "conversation": conv })),
        Err(e) => RpcResponse::engine_error(id, &e),
    }
}

async fn conversation_get(state: &Arc<HandlerState>, params: &serde_json::Value, id: Id) -> RpcResponse {
    let conversation_id = match conversation_id(params) {
        Ok(c) => c,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match state.engine.conversation(&conversation_id).await {
        Ok(view) => match serde_json::to_value(&view) {
            Ok(v) => RpcResponse::success(id, v),
            Err(e) => RpcResponse::internal_error(id, e.to_string()),
        },
        Err(e) => RpcResponse::engine_error(id, &e),
    }
}

async fn conversation_typing(
    state: &Arc<HandlerState>,
    conn: &ConnectionId,
    params: &serde_json::Value,
    id: Id,
) -> RpcResponse {
    let conversation_id = match conversation_id(params) {
        Ok(c) => c,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match state.engine.typing(conn, &conversation_id).await {
        Ok(()) => RpcResponse::success(id, serde_json::json!({ "relayed": true })),
        Err(e) => RpcResponse::engine_error(id, &e),
    }
}

async fn conversation_heartbeat(
    state: &Arc<HandlerState>,
    conn: &ConnectionId,
    params: &serde_json::Value,
    id: Id,
) -> RpcResponse {
    let conversation_id = match conversation_id(params) {
        Ok(c) => c,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match state.engine.heartbeat(conn, &conversation_id).await {
        Ok(conv) => RpcResponse::success(id, serde_json::json!({ "conversation": conv })),
        Err(e) => RpcResponse::engine_error(id, &e),
    }
}

async fn monitor_join(
    state: &Arc<HandlerState>,
    conn: &ConnectionId,
    params: &serde_json::Value,
    id: Id,
) -> RpcResponse {
    let monitor = match rpc::require_str(params, "monitor_id") {
        Ok(m) => MonitorId::from_raw(m),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match state.engine.connect_monitor(conn.clone(), monitor).await {
        Ok(session) => RpcResponse::success(
            id,
            serde_json::json!({
                "monitorId": session.monitor_id,
                "pendingEscalations": state.engine.pending_escalations(),
            }),
        ),
        Err(e) => RpcResponse::engine_error(id, &e),
    }
}

async fn message_send(
    state: &Arc<HandlerState>,
    conn: &ConnectionId,
    params: &serde_json::Value,
    id: Id,
) -> RpcResponse {
    let conversation_id = match conversation_id(params) {
        Ok(c) => c,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let Some(text) = rpc::optional_str(params, "text") else {
        return RpcResponse::invalid_params(id, "Missing required parameter: text");
    };

    // monitors speak as themselves unless they say otherwise
    let monitor = state.engine.monitor_of(conn);
    let sender = match rpc::optional_str(params, "sender") {
        Some(s) => match s.parse::<SenderRole>() {
            Ok(role) => role,
            Err(e) => return RpcResponse::invalid_params(id, e),
        },
        None if monitor.is_some() => SenderRole::Monitor,
        None => SenderRole::User,
    };

    let result = match (sender, monitor) {
        (SenderRole::Monitor, Some(m)) => {
            state
                .engine
                .ingest_from_monitor(&conversation_id, &m, text, Utc::now())
                .await
        }
        (SenderRole::Monitor, None) => {
            return RpcResponse::invalid_params(id, "connection has not joined as a monitor")
        }
        (role, _) => state.engine.ingest(&conversation_id, role, text, Utc::now()).await,
    };

    match result {
        Ok((message, assessment)) => RpcResponse::success(
            id,
            serde_json::json!({
                "message": message,
                "assessment": assessment,
            }),
        ),
        Err(e) => RpcResponse::engine_error(id, &e),
    }
}

fn health(state: &Arc<HandlerState>, id: Id) -> RpcResponse {
    let engine = state.engine.health();
    let status = if engine.classifier_breaker == "open" {
        "degraded"
    } else {
        "healthy"
    };
    RpcResponse::success(
        id,
        serde_json::json!({
            "status": status,
            "uptimeSecs": state.started_at.elapsed().as_secs(),
            "clients": state.registry.count(),
            "engine": engine,
        }),
    )
}
