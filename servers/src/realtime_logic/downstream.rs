use crate::realtime_logic::model::{ClientMessage, ServerMessage};
use crate::realtime_logic::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use lib_realtime::core::OutboundMessage;
use lib_realtime::{LOG_STREAM_CHANNEL, METRICS_STREAM_CHANNEL, NOTIFICATIONS_CHANNEL};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

static NEXT_CLIENT_ID: AtomicUsize = AtomicUsize::new(1);

#[derive(Clone)]
struct GatewayState {
    app: AppState,
    shutdown: CancellationToken,
}

pub fn router(app_state: AppState, shutdown: CancellationToken) -> Router {
    Router::new()
        .route("/ws/logs", get(logs_handler))
        .route("/ws/metrics", get(metrics_handler))
        .route("/ws/notifications", get(notifications_handler))
        .route("/health", get(health_handler))
        .with_state(GatewayState {
            app: app_state,
            shutdown,
        })
}

pub async fn run(port: u16, app_state: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("Downstream server listening on {}", addr);

    let app = router(app_state, shutdown.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            log::info!("Downstream server shutting down.");
        })
        .await?;
    Ok(())
}

async fn logs_handler(ws: WebSocketUpgrade, State(state): State<GatewayState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, LOG_STREAM_CHANNEL))
}

async fn metrics_handler(ws: WebSocketUpgrade, State(state): State<GatewayState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, METRICS_STREAM_CHANNEL))
}

async fn notifications_handler(ws: WebSocketUpgrade, State(state): State<GatewayState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, NOTIFICATIONS_CHANNEL))
}

async fn health_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(health_report(&state.app))
}

fn health_report(state: &AppState) -> Value {
    let dispatch = state.dispatcher.stats();
    let bridge = state.bridge.as_ref().map(|bridge| {
        let stats = bridge.stats();
        json!({
            "state": format!("{:?}", bridge.state()).to_lowercase(),
            "received": stats.received,
            "dropped": stats.dropped,
            "reconnects": stats.reconnects,
            "alerts": stats.alerts,
        })
    });
    json!({
        "status": "ok",
        "channels": state.dispatcher.registry().get_all_counts(),
        "connections": state.dispatcher.connection_count(),
        "delivered": dispatch.delivered,
        "dropped": dispatch.dropped,
        "bridge": bridge,
    })
}

fn stream_label(channel: &str) -> &'static str {
    match channel {
        METRICS_STREAM_CHANNEL => "metrics stream",
        NOTIFICATIONS_CHANNEL => "notification stream",
        _ => "log stream",
    }
}

// Handles one control message. Returns the reply to send back directly, if any.
fn handle_control(state: &AppState, connection_id: &str, text: &str) -> Option<ServerMessage> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => return Some(ServerMessage::error("Invalid JSON format")),
    };
    let kind = value.get("type").and_then(Value::as_str).map(str::to_string);

    match serde_json::from_value::<ClientMessage>(value) {
        Ok(ClientMessage::Ping) => Some(ServerMessage::pong()),
        Ok(ClientMessage::SetFilters { filters }) => {
            state.dispatcher.set_filter(connection_id, filters.clone());
            log::debug!("Client {} set filters {:?}", connection_id, filters);
            Some(ServerMessage::filters_updated(filters))
        }
        Ok(ClientMessage::Refresh) => {
            let update = OutboundMessage::metrics_update(state.aggregator.get_metrics());
            if let Err(e) = state.dispatcher.send_to(connection_id, &update) {
                log::warn!("Refresh for client {} failed: {}", connection_id, e);
            }
            None
        }
        Err(e) => match kind {
            Some(kind) if ClientMessage::KINDS.contains(&kind.as_str()) => {
                Some(ServerMessage::error(format!("Invalid {} message: {}", kind, e)))
            }
            other => {
                log::debug!("Ignoring control message of type {:?} from client {}", other, connection_id);
                None
            }
        },
    }
}

async fn send_json(socket: &mut WebSocket, message: &ServerMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(json_str) => socket.send(Message::Text(json_str.into())).await.is_ok(),
        Err(e) => {
            log::error!("Failed to encode reply: {}", e);
            true
        }
    }
}

async fn handle_socket(mut socket: WebSocket, state: GatewayState, channel: &'static str) {
    let client_id = format!("client-{}", NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed));
    let app = &state.app;

    let mut outbox = app.dispatcher.connect(&client_id);
    let connected_clients = app.dispatcher.subscribe(channel, &client_id, None);
    log::info!("Client {} connected to '{}' ({} live)", client_id, channel, connected_clients);

    let mut open = send_json(&mut socket, &ServerMessage::connected(stream_label(channel), connected_clients)).await;

    if open && channel == METRICS_STREAM_CHANNEL {
        let snapshot = OutboundMessage::metrics_update(app.aggregator.get_metrics());
        let history = OutboundMessage::metrics_history(
            app.aggregator.get_history(),
            app.aggregator.history_duration_minutes(),
        );
        for message in [snapshot, history] {
            if let Err(e) = app.dispatcher.send_to(&client_id, &message) {
                log::warn!("Initial {} for client {} failed: {}", message.kind(), client_id, e);
            }
        }
    }

    while open {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            // Handle fan-out frames queued for this client
            frame = outbox.recv() => {
                match frame {
                    Some(frame) => {
                        if socket.send(Message::Text((&*frame).into())).await.is_err() {
                            break; // client disconnected
                        }
                    }
                    None => break,
                }
            }
            // Handle incoming messages from the client
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = handle_control(app, &client_id, text.as_str()) {
                            open = send_json(&mut socket, &reply).await;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    app.dispatcher.disconnect(&client_id);
    log::info!("Client {} disconnected from '{}'", client_id, channel);
}
