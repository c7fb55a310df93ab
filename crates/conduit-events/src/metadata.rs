// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

/// What started a conversation — drives default system-prompt selection and
/// dashboard grouping, but never the event schema itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationTrigger {
    Gui,
    Cli,
    Api,
    Resume,
}

/// Repository/branch context a conversation is scoped to, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositorySelection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

/// Bookkeeping about a conversation, persisted separately from its event
/// stream so metadata (title, last-activity) can be listed cheaply without
/// loading the full log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMetadata {
    pub conversation_id: String,
    pub user_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub selected_repository: RepositorySelection,
    pub trigger: ConversationTrigger,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_updated_at: chrono::DateTime<chrono::Utc>,
}

impl ConversationMetadata {
    pub fn new(conversation_id: impl Into<String>, user_id: impl Into<String>, trigger: ConversationTrigger) -> Self {
        let now = chrono::Utc::now();
        Self {
            conversation_id: conversation_id.into(),
            user_id: user_id.into(),
            title: None,
            selected_repository: RepositorySelection::default(),
            trigger,
            created_at: now,
            last_updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_updated_at = chrono::Utc::now();
    }
}
