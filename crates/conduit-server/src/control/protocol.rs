// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Wire protocol between remote clients and the [`super::ConversationManager`].
//!
//! All types derive `Serialize`/`Deserialize` and are encoded as:
//! - **CBOR** (via `ciborium`) for compact binary transports.
//! - **JSON** over the WebSocket text frames — comfortable for browsers.
//!
//! # Typical session flow
//!
//! ```text
//! Client                              Conversation Manager
//!    │                                        │
//!    │── Join {conversation_id} ─────────────►│  starts or resumes the
//!    │                                        │  conversation's agent loop
//!    │◄─ Replay {events} ─────────────────────│  full or tail history
//!    │                                        │
//!    │── UserMessage {text} ─────────────────►│  appended, loop resumes
//!    │◄─ Event {AgentStateChanged(Running)} ──│
//!    │◄─ Event {CmdRun action} ───────────────│
//!    │◄─ Event {CmdOutput observation} ───────│
//!    │◄─ Event {AgentStateChanged(Awaiting…)} │  e.g. confirmation gate
//!    │── ResolveConfirmation {approved} ──────►│
//!    │◄─ Event {...} ─────────────────────────│
//!    │                                        │
//!    │   (a second client can Join the same   │
//!    │    conversation_id and see every Event │
//!    │    broadcast to both connections)      │
//! ```

use conduit_events::Event;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Client → server ───────────────────────────────────────────────────────────

/// Messages a client sends to control or observe a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Attach to a conversation, starting its agent loop if this is the
    /// first client to reference it. `latest_event_id` lets a reconnecting
    /// client ask for only the events it missed instead of full replay.
    Join {
        conversation_id: Uuid,
        #[serde(default)]
        latest_event_id: Option<u64>,
    },

    /// Submit a user chat turn to the conversation.
    UserMessage { conversation_id: Uuid, text: String },

    /// Approve or deny an action the agent has paused on.
    ResolveConfirmation { conversation_id: Uuid, approved: bool },

    /// Detach from the conversation. The agent loop keeps running for the
    /// grace period described in [`super::ConversationManagerConfig`] in
    /// case this or another client rejoins.
    Leave { conversation_id: Uuid },

    /// Stop the conversation's agent loop outright.
    Close { conversation_id: Uuid },
}

// ── Server → client ───────────────────────────────────────────────────────────

/// Messages the manager sends to clients attached to a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once right after a successful `Join`: either the full event log
    /// from genesis, or just the tail after `latest_event_id`.
    Replay { conversation_id: Uuid, events: Vec<Event> },

    /// A single event appended to the conversation's stream, forwarded live
    /// to every attached client.
    Event { conversation_id: Uuid, event: Event },

    /// The conversation's agent loop has stopped (finished, rejected,
    /// stuck, crashed, or explicitly closed).
    Closed { conversation_id: Uuid, reason: String },

    /// A client-facing error: bad request, unknown conversation, or the
    /// manager has hit `max_conversations`.
    Error {
        conversation_id: Option<Uuid>,
        code: u32,
        message: String,
    },
}

// ── CBOR codec helpers ────────────────────────────────────────────────────────

pub fn encode_client_message(msg: &ClientMessage) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(msg, &mut buf).map_err(|e| anyhow::anyhow!("CBOR encode: {e}"))?;
    Ok(buf)
}

pub fn decode_client_message(bytes: &[u8]) -> anyhow::Result<ClientMessage> {
    ciborium::from_reader(bytes).map_err(|e| anyhow::anyhow!("CBOR decode: {e}"))
}

pub fn encode_server_message(msg: &ServerMessage) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(msg, &mut buf).map_err(|e| anyhow::anyhow!("CBOR encode: {e}"))?;
    Ok(buf)
}

pub fn decode_server_message(bytes: &[u8]) -> anyhow::Result<ServerMessage> {
    ciborium::from_reader(bytes).map_err(|e| anyhow::anyhow!("CBOR decode: {e}"))
}

// ── Unit tests ────────────────────────────────────────────────────────────────
