// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod protocol;
pub mod service;

pub use protocol::{
    decode_client_message, decode_server_message, encode_client_message, encode_server_message, ClientMessage,
    ServerMessage,
};
pub use service::{AgentLoopInfo, ConversationError, ConversationManager, ConversationManagerConfig};
