// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

/// Who produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventSource {
    User,
    Agent,
    Environment,
}

/// Whether an action requires explicit user approval before the runtime
/// executes it, and if so where it currently sits in that workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfirmationStatus {
    /// No approval required, or approval already granted; safe to execute.
    Confirmed,
    /// Proposed, waiting on a `ChangeAgentStateAction` from the user.
    Awaiting,
    /// User rejected the proposal; never executed.
    Rejected,
}

/// A request for the runtime (or the controller itself) to do something.
///
/// Variants mirror the teacher's tool-call vocabulary but are expressed as a
/// closed, serializable union so they can be replayed from the event log
/// independent of which `Tool` implementation produced them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// A chat turn — either from the user or the agent's final reply.
    Message {
        text: String,
        #[serde(default)]
        images: Vec<String>,
    },
    CmdRun {
        command: String,
        #[serde(default)]
        timeout_secs: Option<u64>,
        #[serde(default)]
        is_static: bool,
        #[serde(default)]
        confirmation_status: Option<ConfirmationStatus>,
    },
    IPythonRunCell {
        code: String,
    },
    FileRead {
        path: String,
        #[serde(default)]
        start: Option<u32>,
        #[serde(default)]
        end: Option<u32>,
    },
    FileWrite {
        path: String,
        content: String,
        #[serde(default)]
        start: Option<u32>,
        #[serde(default)]
        end: Option<u32>,
    },
    FileEdit {
        path: String,
        old_str: String,
        new_str: String,
        #[serde(default)]
        replace_all: bool,
    },
    BrowseUrl {
        url: String,
    },
    BrowseInteractive {
        browser_command: String,
    },
    /// Spawn a sub-agent (delegation). `agent` names the delegate's role,
    /// `inputs` is forwarded verbatim as its initial task.
    AgentDelegate {
        agent: String,
        inputs: serde_json::Value,
    },
    AgentFinish {
        outputs: serde_json::Value,
    },
    AgentReject {
        reason: String,
    },
    AgentThink {
        thought: String,
    },
    ChangeAgentState {
        new_state: AgentState,
    },
    Recall {
        query: String,
    },
    Mcp {
        name: String,
        arguments: serde_json::Value,
    },
    /// Sentinel for a model turn that did not parse into an executable
    /// action (malformed tool call, empty response). Never dispatched to a
    /// runtime; recorded so the log stays a complete account of the turn.
    Null,
}

impl Action {
    /// Human-readable action kind, used in logging and stuck-loop reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Message { .. } => "message",
            Action::CmdRun { .. } => "cmd_run",
            Action::IPythonRunCell { .. } => "ipython_run_cell",
            Action::FileRead { .. } => "file_read",
            Action::FileWrite { .. } => "file_write",
            Action::FileEdit { .. } => "file_edit",
            Action::BrowseUrl { .. } => "browse_url",
            Action::BrowseInteractive { .. } => "browse_interactive",
            Action::AgentDelegate { .. } => "agent_delegate",
            Action::AgentFinish { .. } => "agent_finish",
            Action::AgentReject { .. } => "agent_reject",
            Action::AgentThink { .. } => "agent_think",
            Action::ChangeAgentState { .. } => "change_agent_state",
            Action::Recall { .. } => "recall",
            Action::Mcp { .. } => "mcp",
            Action::Null => "null",
        }
    }
}

/// A response from the environment (or the controller) to an [`Action`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "observation", rename_all = "snake_case")]
pub enum Observation {
    CmdOutput {
        command: String,
        exit_code: i32,
        content: String,
    },
    IPythonRunCell {
        content: String,
    },
    FileRead {
        path: String,
        content: String,
    },
    FileWrite {
        path: String,
    },
    FileEdit {
        path: String,
        content: String,
    },
    BrowserOutput {
        url: String,
        #[serde(default)]
        screenshot: Option<String>,
        #[serde(default)]
        axtree: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
    Error {
        content: String,
    },
    AgentStateChanged {
        state: AgentState,
        #[serde(default)]
        reason: Option<String>,
    },
    AgentDelegate {
        outputs: serde_json::Value,
    },
    /// Emitted by the condenser pipeline when a `Condensation` is applied;
    /// carries the natural-language summary that replaces the forgotten span.
    AgentCondensation {
        summary: String,
    },
    Recall {
        content: String,
    },
    Mcp {
        name: String,
        arguments: serde_json::Value,
        content: String,
    },
    Success,
    UserReject,
    /// Never executed — sentinel paired with [`Action::Null`].
    Null,
}

impl Observation {
    pub fn kind(&self) -> &'static str {
        match self {
            Observation::CmdOutput { .. } => "cmd_output",
            Observation::IPythonRunCell { .. } => "ipython_run_cell",
            Observation::FileRead { .. } => "file_read",
            Observation::FileWrite { .. } => "file_write",
            Observation::FileEdit { .. } => "file_edit",
            Observation::BrowserOutput { .. } => "browser_output",
            Observation::Error { .. } => "error",
            Observation::AgentStateChanged { .. } => "agent_state_changed",
            Observation::AgentDelegate { .. } => "agent_delegate",
            Observation::AgentCondensation { .. } => "agent_condensation",
            Observation::Recall { .. } => "recall",
            Observation::Mcp { .. } => "mcp",
            Observation::Success => "success",
            Observation::UserReject => "user_reject",
            Observation::Null => "null",
        }
    }

    pub fn error_content(content: impl Into<String>) -> Self {
        Observation::Error { content: content.into() }
    }
}

/// Lifecycle state of an [`super::controller`]-equivalent consumer of a
/// conversation's event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentState {
    Loading,
    Init,
    Running,
    AwaitingUserInput,
    AwaitingConfirmation,
    Paused,
    Finished,
    Rejected,
    Error,
    Stuck,
}

/// The payload carried by an [`Event`] — exactly one of action or
/// observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    Action(Action),
    Observation(Observation),
}

/// The atomic, immutable-after-append unit of a conversation's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonically increasing per conversation, starting at 0.
    pub id: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub source: EventSource,
    /// id of the event that produced this one, if any. For an Observation
    /// this is always the Action it answers; `AgentStateChangedObservation`
    /// is controller-sourced and may have no cause.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<u64>,
    /// Optional free-text summary shown in transcripts/logs, independent of
    /// the structured payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn is_action(&self) -> bool {
        matches!(self.payload, EventPayload::Action(_))
    }

    pub fn is_observation(&self) -> bool {
        matches!(self.payload, EventPayload::Observation(_))
    }

    pub fn as_action(&self) -> Option<&Action> {
        match &self.payload {
            EventPayload::Action(a) => Some(a),
            EventPayload::Observation(_) => None,
        }
    }

    pub fn as_observation(&self) -> Option<&Observation> {
        match &self.payload {
            EventPayload::Observation(o) => Some(o),
            EventPayload::Action(_) => None,
        }
    }

    /// `true` for events the replay/condenser layers treat as noise:
    /// `NullAction`, `NullObservation`, and raw `RecallAction` requests
    /// (their answering `RecallObservation` carries the useful content).
    pub fn is_replay_noise(&self) -> bool {
        matches!(
            &self.payload,
            EventPayload::Action(Action::Null)
                | EventPayload::Observation(Observation::Null)
                | EventPayload::Action(Action::Recall { .. })
        )
    }
}
