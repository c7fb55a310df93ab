// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! WebSocket bridge — translates browser WebSocket connections to the
//! internal [`ClientMessage`]/[`ServerMessage`] protocol spoken by a
//! [`ConversationManager`].
//!
//! # Why this exists
//!
//! The conversation manager itself is transport-agnostic; this handler is
//! the thin shim that lets a browser or any other WebSocket-speaking client
//! join, drive, and observe a conversation.
//!
//! # Wire format
//!
//! JSON over WebSocket text frames — comfortable for browsers. Binary
//! frames are decoded as CBOR for non-browser clients that prefer it.
//!
//! # Protocol
//!
//! A connection is a blank slate until its first [`ClientMessage::Join`];
//! until then, any other message is rejected. After joining, the socket
//! replays history, then bridges the conversation's live event broadcast
//! to the client and the client's messages to the manager. A connection
//! may join at most one conversation at a time in this handler; `Leave`
//! detaches without closing the socket and `Close` stops the conversation
//! outright for every attached client.
//!
//! # Security
//!
//! Authentication happens before the WebSocket upgrade via the bearer token
//! middleware. By the time `ws_handler` runs, the request is already
//! authenticated; the WebSocket itself inherits that auth.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::control::{ClientMessage, ConversationManager, ServerMessage};

/// HTTP handler for GET /ws.
pub async fn ws_handler(ws: WebSocketUpgrade, State(manager): State<Arc<ConversationManager>>) -> Response {
    let addr: SocketAddr = "0.0.0.0:0".parse().unwrap();
    ws.on_upgrade(move |socket| handle_socket(socket, manager, addr))
}

/// Publicly accessible socket handler for direct use from the HTTP router.
pub async fn handle_socket(mut socket: WebSocket, manager: Arc<ConversationManager>, peer: SocketAddr) {
    info!(%peer, "WebSocket client connected");
    let connection_id = Uuid::new_v4();

    let Some(conversation_id) = wait_for_join(&mut socket, &manager, connection_id, peer).await else {
        info!(%peer, "WebSocket client disconnected before joining a conversation");
        return;
    };

    // join_conversation just started or confirmed the loop, so a
    // subscription must exist.
    let mut events = manager.subscribe(conversation_id).await.expect("conversation is running after join");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match decode_json::<ClientMessage>(&text) {
                            Ok(ClientMessage::Leave { .. }) => {
                                manager.clone().detach(conversation_id, connection_id).await;
                                break;
                            }
                            Ok(ClientMessage::Close { .. }) => {
                                manager.close_session(conversation_id).await;
                                send_server(&mut socket, &ServerMessage::Closed { conversation_id, reason: "closed by client".into() }).await;
                                break;
                            }
                            Ok(other) => dispatch(&manager, conversation_id, other, &mut socket).await,
                            Err(e) => {
                                warn!(%peer, "invalid client message: {e}");
                                send_server(&mut socket, &ServerMessage::Error { conversation_id: Some(conversation_id), code: 400, message: format!("invalid message: {e}") }).await;
                            }
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        match crate::control::decode_client_message(&bytes) {
                            Ok(ClientMessage::Leave { .. }) => {
                                manager.clone().detach(conversation_id, connection_id).await;
                                break;
                            }
                            Ok(ClientMessage::Close { .. }) => {
                                manager.close_session(conversation_id).await;
                                break;
                            }
                            Ok(other) => dispatch(&manager, conversation_id, other, &mut socket).await,
                            Err(e) => warn!(%peer, "invalid CBOR client message: {e}"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(%peer, "WebSocket recv error: {e}");
                        break;
                    }
                }
            }
            result = events.recv() => {
                match result {
                    Ok(Ok(event)) => {
                        send_server(&mut socket, &ServerMessage::Event { conversation_id, event }).await;
                    }
                    Ok(Err(lag)) => {
                        warn!(%peer, missed = lag.missed, "client lagged behind the conversation's event stream");
                        send_server(&mut socket, &ServerMessage::Error { conversation_id: Some(conversation_id), code: 503, message: format!("lagged by {} events", lag.missed) }).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(%peer, "broadcast channel lagged by {n}");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        send_server(&mut socket, &ServerMessage::Closed { conversation_id, reason: "conversation ended".into() }).await;
                        break;
                    }
                }
            }
        }
    }

    manager.detach(conversation_id, connection_id).await;
    info!(%peer, "WebSocket client disconnected");
}

/// Blocks until the client sends a `Join`, replaying history and returning
/// the joined conversation id. Returns `None` if the socket closes first.
async fn wait_for_join(
    socket: &mut WebSocket,
    manager: &Arc<ConversationManager>,
    connection_id: Uuid,
    peer: SocketAddr,
) -> Option<Uuid> {
    loop {
        match socket.recv().await? {
            Ok(Message::Text(text)) => match decode_json::<ClientMessage>(&text) {
                Ok(ClientMessage::Join { conversation_id, latest_event_id }) => {
                    return join_and_replay(socket, manager, conversation_id, connection_id, latest_event_id).await;
                }
                Ok(_) => {
                    send_server(socket, &ServerMessage::Error { conversation_id: None, code: 400, message: "must Join before sending other messages".into() }).await;
                }
                Err(e) => {
                    warn!(%peer, "invalid join message: {e}");
                    send_server(socket, &ServerMessage::Error { conversation_id: None, code: 400, message: format!("invalid message: {e}") }).await;
                }
            },
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

async fn join_and_replay(
    socket: &mut WebSocket,
    manager: &Arc<ConversationManager>,
    conversation_id: Uuid,
    connection_id: Uuid,
    latest_event_id: Option<u64>,
) -> Option<Uuid> {
    match manager.join_conversation(conversation_id, connection_id, latest_event_id).await {
        Ok((_controller, events)) => {
            send_server(socket, &ServerMessage::Replay { conversation_id, events }).await;
            Some(conversation_id)
        }
        Err(e) => {
            send_server(socket, &ServerMessage::Error { conversation_id: Some(conversation_id), code: 409, message: e.to_string() }).await;
            None
        }
    }
}

async fn dispatch(manager: &Arc<ConversationManager>, conversation_id: Uuid, msg: ClientMessage, socket: &mut WebSocket) {
    let result = match msg {
        ClientMessage::UserMessage { text, .. } => manager.submit_user_message(conversation_id, text).await,
        ClientMessage::ResolveConfirmation { approved, .. } => manager.resolve_confirmation(conversation_id, approved).await,
        ClientMessage::Join { .. } | ClientMessage::Leave { .. } | ClientMessage::Close { .. } => Ok(()),
    };
    if let Err(e) = result {
        send_server(socket, &ServerMessage::Error { conversation_id: Some(conversation_id), code: 422, message: e.to_string() }).await;
    }
}

fn decode_json<T: serde::de::DeserializeOwned>(text: &str) -> anyhow::Result<T> {
    serde_json::from_str(text).map_err(|e| anyhow::anyhow!(e))
}

async fn send_server(socket: &mut WebSocket, msg: &ServerMessage) {
    if let Ok(json) = serde_json::to_string(msg) {
        let _ = socket.send(Message::Text(json)).await;
    }
}
