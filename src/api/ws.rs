// =============================================================================
// WebSocket Handler — Broadcaster subscribers
// =============================================================================
//
// Clients connect to `/api/v1/ws?token=<token>`, receive a welcome message,
// then subscribe to topics (`prices`, `estimates`) with JSON text frames.
// Outbound frames come from the client's bounded hub queue; when the hub
// drops a slow client its queue closes and this handler disconnects.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::api::auth::validate_token;
use crate::app_state::AppState;

/// Server ping cadence; clients that stop answering are dropped by the
/// transport once writes fail.
const PING_PERIOD: Duration = Duration::from_secs(54);

/// Inbound frames beyond this are rejected by the upgrade.
const MAX_INBOUND_BYTES: usize = 512;

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    if !validate_token(&token, &state.admin_token) {
        warn!("WebSocket connection rejected: invalid token");
        return (StatusCode::UNAUTHORIZED, "invalid or missing token").into_response();
    }

    ws.max_message_size(MAX_INBOUND_BYTES)
        .on_upgrade(move |socket| handle_ws_connection(socket, state))
        .into_response()
}

async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    let hub = Arc::clone(&state.hub);
    let (client_id, mut outbound) = hub.register();
    let (mut sender, mut receiver) = socket.split();

    let mut ping = interval(PING_PERIOD);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.tick().await;

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(text) = frame else {
                    debug!(client_id = %client_id, "hub closed subscriber queue");
                    break;
                };
                if let Err(e) = sender.send(Message::Text(text)).await {
                    debug!(client_id = %client_id, error = %e, "WebSocket send failed, disconnecting");
                    break;
                }
            }

            _ = ping.tick() => {
                if let Err(e) = sender.send(Message::Ping(Vec::new())).await {
                    debug!(client_id = %client_id, error = %e, "WebSocket ping failed, disconnecting");
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => hub.handle_inbound(&client_id, &text).await,
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Binary(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(client_id = %client_id, error = %e, "WebSocket receive error");
                        break;
                    }
                }
            }
        }
    }

    hub.unregister(&client_id);
    info!(client_id = %client_id, "WebSocket connection closed");
}
