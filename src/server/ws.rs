//! `/ws` realtime channel.
//!
//! Each socket is split: a receive task parses client messages into dispatcher
//! commands, and a forward task drains the client's bounded queue into the socket
//! and sends heartbeat pings. Every outbound frame goes through the dispatcher, so
//! when the dispatcher drops a client its queue closes and the forward task ends.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{request_context, AppState};
use crate::error::AppError;
use crate::identity::AuthContext;
use crate::realtime::{ChannelTransport, ClientMessage, ServerMessage};

const HEARTBEAT: Duration = Duration::from_secs(30);

#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    #[serde(default)]
    pub token: Option<String>,
}

pub async fn ws_handler(State(state): State<AppState>, headers: HeaderMap, Query(params): Query<WsParams>, ws: WebSocketUpgrade) -> Response {
    let ctx = match request_context(&state, &headers, params.token.as_deref()) {
        Ok(ctx) => ctx,
        Err(e) => return e.into_response(),
    };
    ws.on_upgrade(move |socket| handle_socket(state, socket, ctx.auth))
}

async fn handle_socket(state: AppState, socket: WebSocket, auth: AuthContext) {
    let client_id = uuid::Uuid::new_v4().simple().to_string();
    let context = auth.context.clone();
    info!(target: "realtime", client = %client_id, uid = ?auth.uid, "websocket connected");

    let (transport, mut outbound) = ChannelTransport::new(state.settings.client_queue_capacity);
    state.realtime.connect(&client_id, transport, auth);

    let (mut ws_tx, mut ws_rx) = socket.split();

    let forward_client = client_id.clone();
    let mut forward_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT);
        heartbeat.tick().await;
        loop {
            tokio::select! {
                msg = outbound.recv() => {
                    let Some(msg) = msg else {
                        debug!(target: "realtime", client = %forward_client, "queue closed by dispatcher");
                        let _ = ws_tx.send(Message::Close(None)).await;
                        return;
                    };
                    if ws_tx.send(Message::Text(msg.to_json_string().into())).await.is_err() {
                        debug!(target: "realtime", client = %forward_client, "client disconnected while forwarding");
                        return;
                    }
                }
                _ = heartbeat.tick() => {
                    if ws_tx.send(Message::Ping(Default::default())).await.is_err() {
                        debug!(target: "realtime", client = %forward_client, "client disconnected during heartbeat");
                        return;
                    }
                }
            }
        }
    });

    let recv_state = state.clone();
    let recv_client = client_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = ws_rx.next().await {
            match msg {
                Ok(Message::Text(text)) => handle_client_message(&recv_state, &recv_client, &context, text.as_str()),
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(target: "realtime", client = %recv_client, "websocket error: {}", e);
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut recv_task => {
            debug!(target: "realtime", client = %client_id, "receive task ended");
            forward_task.abort();
        }
        _ = &mut forward_task => {
            debug!(target: "realtime", client = %client_id, "forward task ended");
            recv_task.abort();
        }
    }

    state.realtime.disconnect(&client_id);
    info!(target: "realtime", client = %client_id, "websocket closed");
}

fn handle_client_message(state: &AppState, client: &str, context: &serde_json::Map<String, serde_json::Value>, text: &str) {
    let msg = match serde_json::from_str::<ClientMessage>(text) {
        Ok(m) => m,
        Err(e) => {
            let err = AppError::user("invalid_message".to_string(), e.to_string());
            state.realtime.notify(client, ServerMessage::error(None, &err));
            return;
        }
    };
    match msg {
        ClientMessage::Subscribe(request) => state.realtime.subscribe(client, request),
        ClientMessage::Unsubscribe { id, path } => state.realtime.unsubscribe(client, id, path),
        ClientMessage::Signin { token } => match state.auth.verify(&token) {
            Ok(auth) => state.realtime.reauthenticate(client, auth.with_context(context.clone()), "signin"),
            Err(e) => {
                debug!(target: "realtime", client = %client, "signin rejected: {}", e);
                state.realtime.notify(client, ServerMessage::error(None, &AppError::unauthenticated()));
            }
        },
        ClientMessage::Signout => {
            state.realtime.reauthenticate(client, AuthContext::anonymous().with_context(context.clone()), "signout")
        }
    }
}
