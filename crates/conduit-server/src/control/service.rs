// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! `ConversationManager` — the registry of live conversations.
//!
//! # Design
//!
//! ```text
//!   WS client A ──┐
//!                 ├──► join_conversation(id) ──► ConversationManager
//!   WS client B ──┘         (shares one AgentController)        │
//!                                                     owns per-id │
//!                                                     EventStore  │
//!   WS client A ◄──┐                                 + loop task │
//!                  ├── events.subscribe() ◄─────────────────────┘
//!   WS client B ◄──┘
//! ```
//!
//! Each conversation id maps to exactly one [`AgentController`] driven by a
//! background task ([`run_agent_loop`]) that steps the controller until it
//! needs input, at which point it awaits a [`tokio::sync::Notify`] instead
//! of busy-polling. Any number of transport connections (websocket clients)
//! can [`ConversationManager::join_conversation`] the same id; all of them
//! see the same event broadcast and may all submit input, matching the
//! multi-client fan-out a shared conversation needs.
//!
//! Disconnecting does not stop the agent loop immediately — `detach` starts
//! a grace-period timer so a dropped connection that reconnects within
//! [`ConversationManagerConfig::disconnect_grace_period`] resumes exactly
//! where it left off instead of losing the run.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use conduit_agent::{AgentController, AgentControllerConfig, StepOutcome};
use conduit_events::{
    Action, AgentState, Event, EventPayload, EventSource, EventStore, InMemoryEventStore, SubscriberLagged,
};
use conduit_memory::{CondenserPipeline, MicroagentRepo};
use conduit_model::ModelProvider;
use conduit_runtime::Runtime;
use conduit_tools::{ToolPolicy, ToolRegistry};

#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("conversation {0} not found")]
    NotFound(Uuid),
    #[error("at most {0} conversations may run concurrently")]
    TooManyConversations(usize),
    #[error("malformed action payload: {0}")]
    InvalidAction(#[from] serde_json::Error),
    #[error("{0}")]
    Controller(anyhow::Error),
}

/// Tunables for conversation lifecycle management.
pub struct ConversationManagerConfig {
    /// Hard cap on concurrently running conversations.
    pub max_conversations: usize,
    /// How long a conversation with zero attached connections keeps its
    /// agent loop alive before `close_session` is called on it.
    pub disconnect_grace_period: Duration,
    pub max_iterations: usize,
    pub headless_mode: bool,
    pub action_timeout: Duration,
}

impl Default for ConversationManagerConfig {
    fn default() -> Self {
        Self {
            max_conversations: 64,
            disconnect_grace_period: Duration::from_secs(30),
            max_iterations: 250,
            headless_mode: false,
            action_timeout: Duration::from_secs(120),
        }
    }
}

/// Snapshot of a running conversation, for status/debug endpoints.
pub struct AgentLoopInfo {
    pub state: AgentState,
    pub connections: usize,
}

type RuntimeFactory = Box<dyn Fn() -> Arc<dyn Runtime> + Send + Sync>;

struct ConversationEntry {
    controller: Arc<AgentController>,
    events: Arc<dyn EventStore>,
    connections: HashSet<Uuid>,
    notify: Arc<Notify>,
    loop_handle: JoinHandle<()>,
    disconnect_task: Option<JoinHandle<()>>,
}

/// Owns every live conversation's [`AgentController`] and event stream,
/// keyed by conversation id.
pub struct ConversationManager {
    model: Arc<dyn ModelProvider>,
    tools: Arc<ToolRegistry>,
    pipeline: Arc<CondenserPipeline>,
    microagents: Option<Arc<MicroagentRepo>>,
    tool_policy: Arc<ToolPolicy>,
    runtime_factory: RuntimeFactory,
    config: ConversationManagerConfig,
    conversations: Mutex<HashMap<Uuid, ConversationEntry>>,
}

impl ConversationManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        model: Arc<dyn ModelProvider>,
        tools: Arc<ToolRegistry>,
        pipeline: Arc<CondenserPipeline>,
        microagents: Option<Arc<MicroagentRepo>>,
        tool_policy: Arc<ToolPolicy>,
        runtime_factory: impl Fn() -> Arc<dyn Runtime> + Send + Sync + 'static,
        config: ConversationManagerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            model,
            tools,
            pipeline,
            microagents,
            tool_policy,
            runtime_factory: Box::new(runtime_factory),
            config,
            conversations: Mutex::new(HashMap::new()),
        })
    }

    pub async fn is_agent_loop_running(&self, id: Uuid) -> bool {
        self.conversations.lock().await.contains_key(&id)
    }

    pub async fn get_running_agent_loops(&self) -> Vec<Uuid> {
        self.conversations.lock().await.keys().copied().collect()
    }

    pub async fn get_connections(&self, id: Uuid) -> Vec<Uuid> {
        self.conversations
            .lock()
            .await
            .get(&id)
            .map(|e| e.connections.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn get_agent_loop_info(&self, id: Uuid) -> Option<AgentLoopInfo> {
        let conversations = self.conversations.lock().await;
        let entry = conversations.get(&id)?;
        Some(AgentLoopInfo { state: entry.controller.state().await, connections: entry.connections.len() })
    }

    /// Starts the conversation's agent loop if it is not already running,
    /// returning its controller either way.
    pub async fn maybe_start_agent_loop(&self, id: Uuid) -> Result<Arc<AgentController>, ConversationError> {
        let mut conversations = self.conversations.lock().await;
        if let Some(entry) = conversations.get(&id) {
            return Ok(entry.controller.clone());
        }
        if conversations.len() >= self.config.max_conversations {
            return Err(ConversationError::TooManyConversations(self.config.max_conversations));
        }

        let events: Arc<dyn EventStore> = InMemoryEventStore::new();
        let runtime = (self.runtime_factory)();
        let controller = Arc::new(AgentController::new(
            events.clone(),
            runtime,
            self.model.clone(),
            self.tools.clone(),
            self.pipeline.clone(),
            self.microagents.clone(),
            self.tool_policy.clone(),
            AgentControllerConfig {
                max_iterations: self.config.max_iterations,
                headless_mode: self.config.headless_mode,
                action_timeout: self.config.action_timeout,
            },
        ));
        controller.start().await.map_err(ConversationError::Controller)?;

        let notify = Arc::new(Notify::new());
        let loop_handle = tokio::spawn(run_agent_loop(controller.clone(), notify.clone()));

        conversations.insert(
            id,
            ConversationEntry {
                controller: controller.clone(),
                events,
                connections: HashSet::new(),
                notify,
                loop_handle,
                disconnect_task: None,
            },
        );
        info!(%id, "conversation agent loop started");
        Ok(controller)
    }

    /// Attaches `connection_id`, starting the conversation if needed, and
    /// returns the controller plus the events the client should replay:
    /// everything after `latest_event_id` if given, or the full log.
    pub async fn join_conversation(
        &self,
        id: Uuid,
        connection_id: Uuid,
        latest_event_id: Option<u64>,
    ) -> Result<(Arc<AgentController>, Vec<Event>), ConversationError> {
        let controller = self.maybe_start_agent_loop(id).await?;

        let mut conversations = self.conversations.lock().await;
        let entry = conversations.get_mut(&id).expect("just started or already running");
        entry.connections.insert(connection_id);
        if let Some(task) = entry.disconnect_task.take() {
            task.abort();
        }

        let events = match latest_event_id {
            Some(after) => entry.events.events_after(after).await,
            None => entry.events.all_events().await,
        }
        .map_err(|e| ConversationError::Controller(e.into()))?;

        Ok((controller, events))
    }

    /// Live event broadcast for a running conversation, or `None` if it
    /// isn't running (callers should `join_conversation` first).
    pub async fn subscribe(&self, id: Uuid) -> Option<broadcast::Receiver<Result<Event, SubscriberLagged>>> {
        self.conversations.lock().await.get(&id).map(|e| e.events.subscribe())
    }

    /// Detaches a connection. If it was the last one attached, the
    /// conversation is scheduled for closure after the grace period —
    /// cancelled automatically if any connection rejoins first.
    pub async fn detach(self: Arc<Self>, id: Uuid, connection_id: Uuid) {
        let mut conversations = self.conversations.lock().await;
        let Some(entry) = conversations.get_mut(&id) else { return };
        entry.connections.remove(&connection_id);
        if entry.connections.is_empty() {
            let manager = self.clone();
            let grace = self.config.disconnect_grace_period;
            entry.disconnect_task = Some(tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                manager.disconnect_from_session(id).await;
            }));
        }
    }

    async fn disconnect_from_session(self: Arc<Self>, id: Uuid) {
        let still_empty = {
            let conversations = self.conversations.lock().await;
            conversations.get(&id).map(|e| e.connections.is_empty()).unwrap_or(false)
        };
        if still_empty {
            info!(%id, "closing conversation after disconnect grace period");
            self.close_session(id).await;
        }
    }

    /// Stops the conversation's agent loop and drops its event store,
    /// regardless of whether any connection is still attached.
    pub async fn close_session(&self, id: Uuid) {
        let mut conversations = self.conversations.lock().await;
        if let Some(entry) = conversations.remove(&id) {
            entry.loop_handle.abort();
            if let Some(task) = entry.disconnect_task {
                task.abort();
            }
        }
    }

    /// Deserializes `payload` as an [`Action`] and appends it to the
    /// conversation's event stream as a user-sourced event, then wakes the
    /// agent loop in case it was waiting on input.
    pub async fn send_to_event_stream(&self, id: Uuid, payload: serde_json::Value) -> Result<(), ConversationError> {
        let action: Action = serde_json::from_value(payload)?;
        let conversations = self.conversations.lock().await;
        let entry = conversations.get(&id).ok_or(ConversationError::NotFound(id))?;
        entry
            .events
            .append(EventSource::User, EventPayload::Action(action), None)
            .await
            .map_err(|e| ConversationError::Controller(e.into()))?;
        entry.notify.notify_one();
        Ok(())
    }

    /// Convenience wrapper over [`AgentController::submit_user_message`]
    /// that also wakes the background loop.
    pub async fn submit_user_message(&self, id: Uuid, text: String) -> Result<(), ConversationError> {
        let conversations = self.conversations.lock().await;
        let entry = conversations.get(&id).ok_or(ConversationError::NotFound(id))?;
        entry.controller.submit_user_message(text).await.map_err(ConversationError::Controller)?;
        entry.notify.notify_one();
        Ok(())
    }

    /// Convenience wrapper over [`AgentController::resolve_confirmation`]
    /// that also wakes the background loop.
    pub async fn resolve_confirmation(&self, id: Uuid, approved: bool) -> Result<(), ConversationError> {
        let conversations = self.conversations.lock().await;
        let entry = conversations.get(&id).ok_or(ConversationError::NotFound(id))?;
        entry.controller.resolve_confirmation(approved).await.map_err(ConversationError::Controller)?;
        entry.notify.notify_one();
        Ok(())
    }
}

/// Drives `controller.step()` until it reaches a terminal state, sleeping
/// on `notify` whenever the controller is waiting on something only a
/// client can supply (a user message or a confirmation decision).
async fn run_agent_loop(controller: Arc<AgentController>, notify: Arc<Notify>) {
    loop {
        let outcome = match controller.step().await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(error = %err, "agent loop step failed");
                break;
            }
        };
        match outcome {
            StepOutcome::Continue => continue,
            StepOutcome::AwaitingUserInput | StepOutcome::AwaitingConfirmation => notify.notified().await,
            StepOutcome::Finished | StepOutcome::Rejected | StepOutcome::Stuck | StepOutcome::Errored(_) => break,
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_tools::ReadFileTool;

    fn test_manager() -> Arc<ConversationManager> {
        let mut registry = ToolRegistry::new();
        registry.register(ReadFileTool);
        let model: Arc<dyn ModelProvider> = Arc::new(conduit_model::MockProvider);
        let pipeline = Arc::new(CondenserPipeline::new(vec![]));
        let tools = Arc::new(registry);

        let tool_policy = Arc::new(ToolPolicy::from_config(&conduit_config::ToolsConfig::default()));

        ConversationManager::new(
            model,
            tools.clone(),
            pipeline,
            None,
            tool_policy,
            move || Arc::new(conduit_runtime::LocalProcessRuntime::new(tools.clone(), ".")),
            ConversationManagerConfig {
                max_conversations: 2,
                disconnect_grace_period: Duration::from_millis(50),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn join_conversation_starts_the_loop_and_replays_from_genesis() {
        let manager = test_manager();
        let id = Uuid::new_v4();
        let conn = Uuid::new_v4();

        let (_controller, events) = manager.join_conversation(id, conn, None).await.unwrap();
        assert!(manager.is_agent_loop_running(id).await);
        // start() appends genesis state events; event id 0 must be included.
        assert!(events.iter().any(|e| e.id == 0));
    }

    #[tokio::test]
    async fn too_many_conversations_is_rejected() {
        let manager = test_manager();
        manager.join_conversation(Uuid::new_v4(), Uuid::new_v4(), None).await.unwrap();
        manager.join_conversation(Uuid::new_v4(), Uuid::new_v4(), None).await.unwrap();

        let err = manager.join_conversation(Uuid::new_v4(), Uuid::new_v4(), None).await.unwrap_err();
        assert!(matches!(err, ConversationError::TooManyConversations(2)));
    }

    #[tokio::test]
    async fn second_client_joining_same_conversation_shares_the_controller() {
        let manager = test_manager();
        let id = Uuid::new_v4();

        let (first, _) = manager.join_conversation(id, Uuid::new_v4(), None).await.unwrap();
        let (second, _) = manager.join_conversation(id, Uuid::new_v4(), None).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.get_connections(id).await.len(), 2);
    }

    #[tokio::test]
    async fn detach_last_connection_closes_session_after_grace_period() {
        let manager = test_manager();
        let id = Uuid::new_v4();
        let conn = Uuid::new_v4();
        manager.join_conversation(id, conn, None).await.unwrap();

        manager.clone().detach(id, conn).await;
        assert!(manager.is_agent_loop_running(id).await, "still running during grace period");

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!manager.is_agent_loop_running(id).await, "closed after grace period elapsed");
    }

    #[tokio::test]
    async fn rejoin_during_grace_period_cancels_the_close() {
        let manager = test_manager();
        let id = Uuid::new_v4();
        let conn = Uuid::new_v4();
        manager.join_conversation(id, conn, None).await.unwrap();
        manager.clone().detach(id, conn).await;

        manager.join_conversation(id, Uuid::new_v4(), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(manager.is_agent_loop_running(id).await, "rejoin must cancel the pending close");
    }

    #[tokio::test]
    async fn send_to_event_stream_appends_a_user_action() {
        let manager = test_manager();
        let id = Uuid::new_v4();
        manager.join_conversation(id, Uuid::new_v4(), None).await.unwrap();

        manager
            .send_to_event_stream(id, serde_json::json!({"action": "message", "text": "hi there"}))
            .await
            .unwrap();

        let (_, events) = manager.join_conversation(id, Uuid::new_v4(), None).await.unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(&e.payload, EventPayload::Action(Action::Message { text, .. }) if text == "hi there")));
    }

    #[tokio::test]
    async fn unknown_conversation_returns_not_found() {
        let manager = test_manager();
        let err = manager.submit_user_message(Uuid::new_v4(), "hi".into()).await.unwrap_err();
        assert!(matches!(err, ConversationError::NotFound(_)));
    }
}
