use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use lifeline_core::ConnectionId;
use lifeline_engine::CrisisEngine;
use lifeline_settings::ServerSettings;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::client::{self, ClientRegistry, WsSink};
use crate::handlers::HandlerState;
use crate::rpc::{RpcRequest, RpcResponse};

/// Inbound frames buffered per connection before the reader waits.
const INBOUND_BUFFER: usize = 64;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
    pub heartbeat_interval: Duration,
    pub client_timeout: Duration,
}

impl ServerConfig {
    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            max_send_queue: settings.client_buffer,
            heartbeat_interval: Duration::from_millis(settings.heartbeat_interval_ms),
            client_timeout: Duration::from_millis(settings.client_timeout_ms),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_settings(&ServerSettings::default())
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub handler_state: Arc<HandlerState>,
    pub client_registry: Arc<ClientRegistry>,
    pub heartbeat: Duration,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Bind and serve. Port 0 picks a free port.
pub async fn start(config: ServerConfig, engine: CrisisEngine) -> Result<ServerHandle, std::io::Error> {
    let client_registry = Arc::new(ClientRegistry::new(config.max_send_queue, config.client_timeout));
    let handler_state = Arc::new(HandlerState::new(engine.clone(), Arc::clone(&client_registry)));

    // clients that stop answering pings are disconnected from the engine too
    let (dead_tx, mut dead_rx) = mpsc::unbounded_channel::<ConnectionId>();
    let cleanup = client::start_cleanup_task(Arc::clone(&client_registry), config.heartbeat_interval, dead_tx);
    let reaper_engine = engine.clone();
    let reaper = tokio::spawn(async move {
        while let Some(conn) = dead_rx.recv().await {
            reaper_engine.disconnect(&conn).await;
        }
    });

    let app_state = AppState {
        handler_state,
        client_registry,
        heartbeat: config.heartbeat_interval,
    };
    let router = build_router(app_state);

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "lifeline server started");

    let shutdown = CancellationToken::new();
    let serve_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(serve_shutdown.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "server stopped with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        addr: local_addr,
        shutdown,
        server,
        background: vec![cleanup, reaper],
    })
}

/// Keeps background tasks alive; `shutdown` stops them.
pub struct ServerHandle {
    pub port: u16,
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
    background: Vec<tokio::task::JoinHandle<()>>,
}

impl ServerHandle {
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in &self.background {
            task.abort();
        }
        let _ = self.server.await;
        tracing::info!("lifeline server stopped");
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (connection_id, rx) = state.client_registry.register();
    tracing::info!(connection_id = %connection_id, "websocket client connected");

    let engine = state.handler_state.engine.clone();
    let sink = WsSink::new(Arc::clone(&state.client_registry), connection_id.clone());
    engine.connect(connection_id.clone(), Arc::new(sink));

    // requests from one connection are handled in order
    let (msg_tx, msg_rx) = mpsc::channel::<String>(INBOUND_BUFFER);
    let rpc = tokio::spawn(process_rpc_messages(
        msg_rx,
        connection_id.clone(),
        Arc::clone(&state.handler_state),
    ));

    client::handle_ws_connection(
        socket,
        connection_id.clone(),
        rx,
        Arc::clone(&state.client_registry),
        msg_tx,
        state.heartbeat,
    )
    .await;

    let _ = rpc.await;
    engine.disconnect(&connection_id).await;
    tracing::info!(connection_id = %connection_id, "websocket client disconnected");
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let resp = crate::handlers::dispatch(
        &state.handler_state,
        &ConnectionId::from_raw("http"),
        "health",
        &serde_json::json!({}),
        None,
    )
    .await;

    let status = resp
        .result
        .as_ref()
        .and_then(|r| r.get("status"))
        .and_then(|s| s.as_str())
        .unwrap_or("unknown");

    let http_status = if status == "healthy" {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };

    (http_status, axum::Json(resp.result.unwrap_or_default()))
}

async fn process_rpc_messages(mut rx: mpsc::Receiver<String>, connection_id: ConnectionId, state: Arc<HandlerState>) {
    while let Some(raw_message) = rx.recv().await {
        let response = match serde_json::from_str::<RpcRequest>(&raw_message) {
            Ok(request) => {
                let params = request.params.unwrap_or_else(|| serde_json::json!({}));
                tracing::debug!(connection_id = %connection_id, method = %request.method, "rpc request");
                crate::handlers::dispatch(&state, &connection_id, &request.method, &params, request.id).await
            }
            Err(_) => RpcResponse::parse_error(),
        };

        if let Ok(json) = serde_json::to_string(&response) {
            let _ = state.registry.send_to(&connection_id, json);
        }
    }
}
