// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The agent's state machine and step loop.
//!
//! [`AgentController`] turns one LLM completion into zero or more
//! [`conduit_events::Event`]s appended to an [`EventStore`]: it builds a
//! condensed [`View`] of the conversation so far, asks the model for the
//! next action, and either dispatches that action to a [`Runtime`] or
//! handles it internally (finishing the task, asking the user a question,
//! pausing for confirmation). A [`StuckDetector`] consulted every step can
//! halt the loop before it burns the rest of its iteration budget on a
//! pattern it cannot escape.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;

use conduit_events::{Action, AgentState, ConfirmationStatus, EventPayload, EventSource, EventStore, InMemoryEventStore, Observation};
use conduit_memory::{AppliedCondensation, CondenserPipeline, MicroagentRepo, View};
use conduit_model::{CompletionRequest, Message, ModelProvider, ResponseEvent};
use conduit_runtime::{McpConfig, Runtime};
use conduit_tools::{ApprovalPolicy, ToolPolicy, ToolRegistry};

/// What a caller should do after [`AgentController::step`] returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The loop should be driven again immediately.
    Continue,
    /// The agent is waiting for the next user message.
    AwaitingUserInput,
    /// The agent proposed an action that needs explicit user approval.
    AwaitingConfirmation,
    Finished,
    Rejected,
    /// A [`StuckDetector`] pattern fired; the loop has halted.
    Stuck,
    Errored(String),
}

impl StepOutcome {
    fn from_terminal_state(state: AgentState) -> Option<Self> {
        match state {
            AgentState::Finished => Some(Self::Finished),
            AgentState::Rejected => Some(Self::Rejected),
            AgentState::Error => Some(Self::Errored("agent already in error state".into())),
            AgentState::Stuck => Some(Self::Stuck),
            AgentState::AwaitingUserInput => Some(Self::AwaitingUserInput),
            AgentState::AwaitingConfirmation => Some(Self::AwaitingConfirmation),
            AgentState::Paused => Some(Self::AwaitingUserInput),
            AgentState::Loading | AgentState::Init | AgentState::Running => None,
        }
    }
}

pub struct AgentControllerConfig {
    /// Hard cap on step() calls before the controller gives up and
    /// transitions to `AgentState::Error`.
    pub max_iterations: usize,
    /// Passed through to the `StuckDetector`; `true` scans the full history
    /// instead of scoping to events after the last user message.
    pub headless_mode: bool,
    /// Per-action execution timeout handed to the runtime.
    pub action_timeout: Duration,
}

impl Default for AgentControllerConfig {
    fn default() -> Self {
        Self { max_iterations: 250, headless_mode: false, action_timeout: Duration::from_secs(120) }
    }
}

/// Drives a single conversation's event stream forward one LLM turn at a
/// time. Cheap to hold behind an `Arc` — all mutable state is internally
/// locked so a `ConversationManager` can share one controller across the
/// websocket handler and any background task polling it.
pub struct AgentController {
    events: Arc<dyn EventStore>,
    runtime: Arc<dyn Runtime>,
    model: Arc<dyn ModelProvider>,
    tools: Arc<ToolRegistry>,
    pipeline: Arc<CondenserPipeline>,
    microagents: Option<Arc<MicroagentRepo>>,
    tool_policy: Arc<ToolPolicy>,
    state: Mutex<AgentState>,
    /// The `CmdRun` action left in `AWAITING_CONFIRMATION`, paired with the
    /// id of the event it was recorded under (so the eventual observation
    /// can carry the right `cause`). Cleared once resolved either way.
    pending_action: Mutex<Option<(u64, Action)>>,
    config: AgentControllerConfig,
    iterations: AtomicUsize,
}

impl AgentController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        events: Arc<dyn EventStore>,
        runtime: Arc<dyn Runtime>,
        model: Arc<dyn ModelProvider>,
        tools: Arc<ToolRegistry>,
        pipeline: Arc<CondenserPipeline>,
        microagents: Option<Arc<MicroagentRepo>>,
        tool_policy: Arc<ToolPolicy>,
        config: AgentControllerConfig,
    ) -> Self {
        Self {
            events,
            runtime,
            model,
            tools,
            pipeline,
            microagents,
            tool_policy,
            state: Mutex::new(AgentState::Loading),
            pending_action: Mutex::new(None),
            config,
            iterations: AtomicUsize::new(0),
        }
    }

    pub async fn state(&self) -> AgentState {
        *self.state.lock().await
    }

    async fn transition(&self, new_state: AgentState, reason: Option<String>) -> anyhow::Result<()> {
        *self.state.lock().await = new_state;
        self.events
            .append(EventSource::Environment, EventPayload::Observation(Observation::AgentStateChanged { state: new_state, reason }), None)
            .await?;
        Ok(())
    }

    /// Moves the conversation from `LOADING`/`INIT` into `RUNNING`. The
    /// controller will not call the model until this has been called.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.transition(AgentState::Init, None).await?;
        self.transition(AgentState::Running, None).await
    }

    /// Appends the user's message and, if the agent was waiting on input,
    /// resumes it to `RUNNING`.
    pub async fn submit_user_message(&self, text: impl Into<String>) -> anyhow::Result<()> {
        self.events
            .append(EventSource::User, EventPayload::Action(Action::Message { text: text.into(), images: vec![] }), None)
            .await?;
        if matches!(self.state().await, AgentState::AwaitingUserInput | AgentState::Paused) {
            self.transition(AgentState::Running, None).await?;
        }
        Ok(())
    }

    /// Approves or rejects the action left in `AWAITING_CONFIRMATION`.
    ///
    /// Approval executes the *same* action that was proposed — it does not
    /// ask the model again — and records its `Observation` before returning
    /// to `RUNNING`. Rejection never reaches the runtime: it records a
    /// `UserReject` observation and also returns to `RUNNING`, leaving the
    /// terminal `REJECTED` state reserved for the agent's own
    /// `AgentRejectAction` (a voluntary give-up, not a declined command).
    pub async fn resolve_confirmation(&self, approved: bool) -> anyhow::Result<()> {
        let pending = self.pending_action.lock().await.take();
        let Some((cause_id, action)) = pending else {
            return self.transition(AgentState::Running, None).await;
        };

        let observation = if approved {
            match self.runtime.run_action(&action, Some(self.config.action_timeout)).await {
                Ok(obs) => obs,
                Err(err) => Observation::error_content(err.to_string()),
            }
        } else {
            Observation::UserReject
        };
        self.events.append(EventSource::Environment, EventPayload::Observation(observation), Some(cause_id)).await?;
        self.transition(AgentState::Running, None).await
    }

    /// Runs one iteration of the step loop: build a view, call the model,
    /// dispatch the resulting action. Returns what the caller should do next.
    pub async fn step(&self) -> anyhow::Result<StepOutcome> {
        let current = self.state().await;
        if let Some(terminal) = StepOutcome::from_terminal_state(current) {
            return Ok(terminal);
        }

        if self.iterations.fetch_add(1, Ordering::SeqCst) >= self.config.max_iterations {
            self.transition(AgentState::Error, Some("iteration budget exceeded".into())).await?;
            return Ok(StepOutcome::Errored("iteration budget exceeded".into()));
        }

        let history = self.events.all_events().await?;

        let stuck_detector = crate::stuck::StuckDetector::new(self.config.headless_mode);
        if stuck_detector.is_stuck(&history) {
            self.transition(AgentState::Stuck, Some("stuck-loop detected".into())).await?;
            return Ok(StepOutcome::Stuck);
        }

        let (view, condensation) = self.pipeline.run(history).await?;
        if let Some(applied) = condensation {
            self.persist_condensation(applied).await?;
        }

        let action = match self.next_action(view).await {
            Ok(action) => action,
            Err(err) => {
                self.transition(AgentState::Error, Some(err.to_string())).await?;
                return Ok(StepOutcome::Errored(err.to_string()));
            }
        };

        self.dispatch(action).await
    }

    async fn persist_condensation(&self, applied: AppliedCondensation) -> anyhow::Result<()> {
        tracing::info!(condenser = %applied.condenser_name, dropped = applied.replaced_ids.len(), "condensation applied");
        self.events
            .append(EventSource::Environment, EventPayload::Observation(Observation::AgentCondensation { summary: applied.summary }), None)
            .await?;
        Ok(())
    }

    /// Calls the model once, retrying a single time with an emergency
    /// (more aggressive) condensation if the provider reports the context
    /// window was exceeded.
    async fn next_action(&self, view: View) -> anyhow::Result<Action> {
        let req = self.build_request(&view);
        match self.collect_action(req).await {
            Ok(action) => Ok(action),
            Err(err) if is_context_window_error(&err) => {
                warn!("context window exceeded, retrying once with emergency condensation");
                let emergency = conduit_memory::AmortizedForgettingCondenser { threshold: 1, keep: (view.len() / 4).max(1) };
                let shrunk = match conduit_memory::Condenser::condense(&emergency, view).await? {
                    conduit_memory::CondenserResult::Condensation { view, summary, replaced_ids } => {
                        self.persist_condensation(AppliedCondensation { condenser_name: "amortized_forgetting".into(), summary, replaced_ids }).await?;
                        view
                    }
                    conduit_memory::CondenserResult::View(view) => view,
                };
                let retry_req = self.build_request(&shrunk);
                self.collect_action(retry_req).await
            }
            Err(err) => Err(err),
        }
    }

    fn build_request(&self, view: &View) -> CompletionRequest {
        let tools = self
            .tools
            .schemas()
            .into_iter()
            .map(|s| conduit_model::ToolSchema { name: s.name, description: s.description, parameters: s.parameters })
            .collect();
        CompletionRequest { messages: render_view_as_messages(view), tools, stream: true, ..Default::default() }
    }

    async fn collect_action(&self, req: CompletionRequest) -> anyhow::Result<Action> {
        let mut stream = self.model.complete(req).await?;
        let mut text = String::new();
        let mut tool_call: Option<(String, String, String)> = None; // (id, name, accumulated args)

        while let Some(event) = stream.next().await {
            match event? {
                ResponseEvent::TextDelta(delta) => text.push_str(&delta),
                ResponseEvent::ToolCall { id, name, arguments } => {
                    let entry = tool_call.get_or_insert((id, name, String::new()));
                    entry.2.push_str(&arguments);
                }
                ResponseEvent::ThinkingDelta(_) | ResponseEvent::Usage { .. } => {}
                ResponseEvent::Done => break,
                ResponseEvent::Error(message) => anyhow::bail!(message),
            }
        }

        if let Some((id, name, raw_args)) = tool_call {
            return Ok(parse_tool_call(&id, &name, &raw_args, &self.tool_policy));
        }
        if !text.trim().is_empty() {
            return Ok(Action::Message { text, images: vec![] });
        }
        warn!("model turn produced neither text nor a tool call");
        Ok(Action::Null)
    }

    async fn dispatch(&self, action: Action) -> anyhow::Result<StepOutcome> {
        let event = self.events.append(EventSource::Agent, EventPayload::Action(action.clone()), None).await?;

        match action {
            Action::AgentFinish { .. } => {
                self.transition(AgentState::Finished, None).await?;
                Ok(StepOutcome::Finished)
            }
            Action::AgentReject { reason } => {
                self.transition(AgentState::Rejected, Some(reason)).await?;
                Ok(StepOutcome::Rejected)
            }
            Action::Message { .. } => {
                self.transition(AgentState::AwaitingUserInput, None).await?;
                Ok(StepOutcome::AwaitingUserInput)
            }
            Action::ChangeAgentState { new_state } => {
                self.transition(new_state, None).await?;
                Ok(outcome_for_state(new_state))
            }
            Action::AgentThink { .. } => Ok(StepOutcome::Continue),
            Action::AgentDelegate { agent, inputs } => {
                let outputs = self.run_delegate(&agent, inputs).await?;
                self.events
                    .append(
                        EventSource::Environment,
                        EventPayload::Observation(Observation::AgentDelegate { outputs }),
                        Some(event.id),
                    )
                    .await?;
                Ok(StepOutcome::Continue)
            }
            Action::Recall { query } => {
                let observation = self.recall(&query);
                self.events.append(EventSource::Environment, EventPayload::Observation(observation), Some(event.id)).await?;
                Ok(StepOutcome::Continue)
            }
            Action::Null => {
                self.events.append(EventSource::Environment, EventPayload::Observation(Observation::Null), Some(event.id)).await?;
                Ok(StepOutcome::Continue)
            }
            Action::CmdRun { confirmation_status: Some(ConfirmationStatus::Awaiting), command, timeout_secs, is_static } => {
                let confirmed = Action::CmdRun { command, timeout_secs, is_static, confirmation_status: Some(ConfirmationStatus::Confirmed) };
                *self.pending_action.lock().await = Some((event.id, confirmed));
                self.transition(AgentState::AwaitingConfirmation, None).await?;
                Ok(StepOutcome::AwaitingConfirmation)
            }
            Action::CmdRun { confirmation_status: Some(ConfirmationStatus::Rejected), command, .. } => {
                self.events
                    .append(
                        EventSource::Environment,
                        EventPayload::Observation(Observation::Error { content: format!("command denied by policy: {command}") }),
                        Some(event.id),
                    )
                    .await?;
                Ok(StepOutcome::Continue)
            }
            runtime_action => {
                let observation = match self.runtime.run_action(&runtime_action, Some(self.config.action_timeout)).await {
                    Ok(obs) => obs,
                    Err(err) => Observation::error_content(err.to_string()),
                };
                self.events.append(EventSource::Environment, EventPayload::Observation(observation), Some(event.id)).await?;
                Ok(StepOutcome::Continue)
            }
        }
    }

    /// Spawns a child controller on a fresh event store, seeded with
    /// `inputs` as its opening user message, and drives it to completion.
    /// The parent is not re-entered until the child reaches a terminal
    /// state, so delegation is effectively synchronous from the parent's
    /// point of view — it just costs the parent one `step()` call's worth
    /// of wall-clock time.
    async fn run_delegate(&self, agent: &str, inputs: Value) -> anyhow::Result<Value> {
        let child_events: Arc<dyn EventStore> = InMemoryEventStore::new();
        child_events
            .append(EventSource::User, EventPayload::Action(Action::Message { text: inputs.to_string(), images: vec![] }), None)
            .await?;

        let child = AgentController::new(
            child_events.clone(),
            self.runtime.clone(),
            self.model.clone(),
            self.tools.clone(),
            self.pipeline.clone(),
            self.microagents.clone(),
            self.tool_policy.clone(),
            AgentControllerConfig { max_iterations: self.config.max_iterations, headless_mode: true, action_timeout: self.config.action_timeout },
        );
        child.start().await?;

        let mut outcome = StepOutcome::Continue;
        while matches!(outcome, StepOutcome::Continue) {
            outcome = child.step().await?;
        }

        let outputs = match outcome {
            StepOutcome::Finished => {
                let history = child_events.all_events().await?;
                history
                    .iter()
                    .rev()
                    .find_map(|e| match &e.payload {
                        EventPayload::Action(Action::AgentFinish { outputs }) => Some(outputs.clone()),
                        _ => None,
                    })
                    .unwrap_or_else(|| serde_json::json!({}))
            }
            StepOutcome::Rejected => serde_json::json!({ "status": "rejected" }),
            StepOutcome::AwaitingUserInput | StepOutcome::AwaitingConfirmation => {
                serde_json::json!({ "status": "blocked", "reason": format!("{outcome:?}") })
            }
            StepOutcome::Stuck => serde_json::json!({ "status": "stuck" }),
            StepOutcome::Errored(msg) => serde_json::json!({ "status": "error", "message": msg }),
            StepOutcome::Continue => unreachable!("loop above only exits on a non-Continue outcome"),
        };

        Ok(serde_json::json!({ "agent": agent, "result": outputs }))
    }

    fn recall(&self, query: &str) -> Observation {
        match &self.microagents {
            Some(repo) => repo.recall(query, &McpConfig::default()).0,
            None => Observation::Recall { content: format!("no microagents configured; query was: {query}") },
        }
    }
}

fn outcome_for_state(state: AgentState) -> StepOutcome {
    StepOutcome::from_terminal_state(state).unwrap_or(StepOutcome::Continue)
}

fn is_context_window_error(err: &anyhow::Error) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("context") && (msg.contains("exceed") || msg.contains("too long") || msg.contains("maximum"))
}

/// Maps tool-call results back onto the typed `Action` vocabulary.
///
/// Core tools (`shell`, `read_file`, `write`, `edit_file`) round-trip into
/// their dedicated `Action` variant; the control tools the model calls to
/// steer its own loop (`finish`, `reject`, `think`, `delegate`, `recall`) map
/// onto the matching internal `Action` so `dispatch` can handle them without
/// ever reaching a `Runtime`; anything else is forwarded as `Action::Mcp`,
/// which already exists precisely to carry a named tool call with arbitrary
/// JSON arguments through to the runtime.
///
/// `shell` calls are additionally run through `policy` so the confirmation
/// gate (§4.E step 7) is decided once, here, rather than scattered across
/// the dispatch match: an auto-approved command is marked `Confirmed` and
/// runs immediately, a command matching no rule is marked `Awaiting` and
/// pauses the loop, and a denied command is marked `Rejected` and never
/// reaches the runtime.
fn parse_tool_call(id: &str, name: &str, raw_args: &str, policy: &ToolPolicy) -> Action {
    let args = parse_tool_arguments(id, name, raw_args);
    match name {
        "shell" => {
            let command = args.get("shell_command").and_then(Value::as_str).unwrap_or_default().to_string();
            let confirmation_status = Some(match policy.decide(&command) {
                ApprovalPolicy::Auto => ConfirmationStatus::Confirmed,
                ApprovalPolicy::Ask => ConfirmationStatus::Awaiting,
                ApprovalPolicy::Deny => ConfirmationStatus::Rejected,
            });
            Action::CmdRun { command, timeout_secs: args.get("timeout_secs").and_then(Value::as_u64), is_static: false, confirmation_status }
        }
        "read_file" => Action::FileRead {
            path: args.get("path").and_then(Value::as_str).unwrap_or_default().to_string(),
            start: args.get("offset").and_then(Value::as_u64).map(|v| v as u32),
            end: args
                .get("offset")
                .and_then(Value::as_u64)
                .zip(args.get("limit").and_then(Value::as_u64))
                .map(|(offset, limit)| (offset + limit) as u32),
        },
        "write" => Action::FileWrite {
            path: args.get("path").and_then(Value::as_str).unwrap_or_default().to_string(),
            content: args.get("content").and_then(Value::as_str).unwrap_or_default().to_string(),
            start: None,
            end: None,
        },
        "edit_file" => {
            let (old_str, new_str) = split_unified_hunk(args.get("diff").and_then(Value::as_str).unwrap_or_default());
            Action::FileEdit { path: args.get("path").and_then(Value::as_str).unwrap_or_default().to_string(), old_str, new_str, replace_all: false }
        }
        "finish" => Action::AgentFinish { outputs: args },
        "reject" => Action::AgentReject { reason: args.get("reason").and_then(Value::as_str).unwrap_or_default().to_string() },
        "think" => Action::AgentThink { thought: args.get("thought").and_then(Value::as_str).unwrap_or_default().to_string() },
        "delegate" => Action::AgentDelegate {
            agent: args.get("agent").and_then(Value::as_str).unwrap_or_default().to_string(),
            inputs: args.get("inputs").cloned().unwrap_or_else(|| Value::Object(Default::default())),
        },
        "recall" => Action::Recall { query: args.get("query").and_then(Value::as_str).unwrap_or_default().to_string() },
        _ => Action::Mcp { name: name.to_string(), arguments: args },
    }
}

/// Two-stage malformed-tool-call recovery: a strict parse first, then a
/// lenient repair pass (stray trailing commas, single-quoted strings) before
/// giving up and logging a warning — the turn still gets recorded (as an
/// empty-args call) rather than silently dropped.
fn parse_tool_arguments(id: &str, name: &str, raw_args: &str) -> Value {
    if let Ok(value) = serde_json::from_str(raw_args) {
        return value;
    }
    let repaired = raw_args.trim().trim_end_matches(',').replace('\'', "\"");
    if let Ok(value) = serde_json::from_str(&repaired) {
        warn!(call_id = id, tool = name, "repaired malformed tool-call JSON");
        return value;
    }
    warn!(call_id = id, tool = name, raw = raw_args, "dropping unparseable tool-call arguments");
    serde_json::json!({})
}

/// Inverse of the no-context unified hunk `LocalProcessRuntime` builds for
/// `FileEdit`: `-` lines become the old string, `+` lines become the new one.
fn split_unified_hunk(diff: &str) -> (String, String) {
    let mut old_lines = Vec::new();
    let mut new_lines = Vec::new();
    for line in diff.lines() {
        if let Some(rest) = line.strip_prefix('-') {
            old_lines.push(rest);
        } else if let Some(rest) = line.strip_prefix('+') {
            new_lines.push(rest);
        }
    }
    (old_lines.join("\n"), new_lines.join("\n"))
}

fn render_view_as_messages(view: &View) -> Vec<Message> {
    let mut messages = Vec::with_capacity(view.len());
    for event in &view.events {
        match &event.payload {
            EventPayload::Action(Action::Message { text, .. }) => {
                messages.push(match event.source {
                    EventSource::User => Message::user(text.clone()),
                    _ => Message::assistant(text.clone()),
                });
            }
            EventPayload::Action(action) => messages.push(Message::assistant(format!("[{}] {:?}", action.kind(), action))),
            EventPayload::Observation(observation) => messages.push(Message::tool_result(event.id.to_string(), render_observation(observation))),
        }
    }
    messages
}

fn render_observation(observation: &Observation) -> String {
    match observation {
        Observation::CmdOutput { command, exit_code, content } => format!("$ {command}\n(exit {exit_code})\n{content}"),
        Observation::Error { content } => format!("error: {content}"),
        Observation::AgentCondensation { summary } => format!("[conversation condensed] {summary}"),
        other => format!("{other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_events::InMemoryEventStore;
    use conduit_memory::NoOpCondenser;
    use conduit_model::MockProvider;
    use conduit_runtime::LocalProcessRuntime;
    use conduit_tools::builtin::shell::ShellTool;

    fn test_policy() -> Arc<ToolPolicy> {
        Arc::new(ToolPolicy::from_config(&conduit_config::ToolsConfig::default()))
    }

    fn test_controller() -> AgentController {
        let events: Arc<dyn EventStore> = InMemoryEventStore::new();
        let mut registry = ToolRegistry::new();
        registry.register(ShellTool::default());
        let registry = Arc::new(registry);
        let runtime: Arc<dyn Runtime> = Arc::new(LocalProcessRuntime::new(registry.clone(), "."));
        let model: Arc<dyn ModelProvider> = Arc::new(MockProvider::default());
        let pipeline = Arc::new(CondenserPipeline::new(vec![Box::new(NoOpCondenser)]));
        AgentController::new(events, runtime, model, registry, pipeline, None, test_policy(), AgentControllerConfig::default())
    }

    #[tokio::test]
    async fn starts_in_loading_and_moves_to_running() {
        let controller = test_controller();
        assert_eq!(controller.state().await, AgentState::Loading);
        controller.start().await.unwrap();
        assert_eq!(controller.state().await, AgentState::Running);
    }

    #[tokio::test]
    async fn step_on_terminal_state_is_a_noop_returning_that_state() {
        let controller = test_controller();
        controller.start().await.unwrap();
        controller.transition(AgentState::Finished, None).await.unwrap();
        assert_eq!(controller.step().await.unwrap(), StepOutcome::Finished);
    }

    #[tokio::test]
    async fn iteration_budget_transitions_to_error() {
        let mut controller = test_controller();
        controller.config.max_iterations = 0;
        controller.start().await.unwrap();
        let outcome = controller.step().await.unwrap();
        assert!(matches!(outcome, StepOutcome::Errored(_)));
        assert_eq!(controller.state().await, AgentState::Error);
    }

    #[test]
    fn parse_tool_call_maps_shell_to_cmd_run() {
        let action = parse_tool_call("1", "shell", r#"{"shell_command": "ls -la"}"#, &test_policy());
        assert!(matches!(action, Action::CmdRun { command, .. } if command == "ls -la"));
    }

    #[test]
    fn parse_tool_call_falls_back_to_mcp_for_unknown_tools() {
        let action = parse_tool_call("1", "grep", r#"{"pattern": "foo"}"#, &test_policy());
        assert!(matches!(action, Action::Mcp { name, .. } if name == "grep"));
    }

    #[test]
    fn parse_tool_call_maps_finish_to_agent_finish() {
        let action = parse_tool_call("1", "finish", r#"{"summary": "done"}"#, &test_policy());
        assert!(matches!(action, Action::AgentFinish { outputs } if outputs["summary"] == "done"));
    }

    #[test]
    fn parse_tool_call_maps_reject_to_agent_reject() {
        let action = parse_tool_call("1", "reject", r#"{"reason": "cannot comply"}"#, &test_policy());
        assert!(matches!(action, Action::AgentReject { reason } if reason == "cannot comply"));
    }

    #[test]
    fn parse_tool_call_maps_delegate_to_agent_delegate() {
        let action = parse_tool_call("1", "delegate", r#"{"agent": "reviewer", "inputs": {"task": "x"}}"#, &test_policy());
        assert!(matches!(action, Action::AgentDelegate { agent, inputs } if agent == "reviewer" && inputs["task"] == "x"));
    }

    #[test]
    fn malformed_json_is_repaired_via_quote_substitution() {
        let action = parse_tool_call("1", "shell", "{'shell_command': 'echo hi'}", &test_policy());
        assert!(matches!(action, Action::CmdRun { command, .. } if command == "echo hi"));
    }

    #[test]
    fn unrepairable_json_drops_to_empty_args_without_panicking() {
        let action = parse_tool_call("1", "shell", "not json at all {{{", &test_policy());
        assert!(matches!(action, Action::CmdRun { command, .. } if command.is_empty()));
    }

    #[test]
    fn parse_tool_call_marks_auto_approved_command_confirmed() {
        let action = parse_tool_call("1", "shell", r#"{"shell_command": "ls -la"}"#, &test_policy());
        assert!(matches!(action, Action::CmdRun { confirmation_status: Some(ConfirmationStatus::Confirmed), .. }));
    }

    #[test]
    fn parse_tool_call_marks_unmatched_command_awaiting_confirmation() {
        let action = parse_tool_call("1", "shell", r#"{"shell_command": "cargo build"}"#, &test_policy());
        assert!(matches!(action, Action::CmdRun { confirmation_status: Some(ConfirmationStatus::Awaiting), .. }));
    }

    #[test]
    fn parse_tool_call_marks_denied_command_rejected() {
        let action = parse_tool_call("1", "shell", r#"{"shell_command": "rm -rf /*"}"#, &test_policy());
        assert!(matches!(action, Action::CmdRun { confirmation_status: Some(ConfirmationStatus::Rejected), .. }));
    }

    #[tokio::test]
    async fn dispatching_a_rejected_command_records_denial_without_running_it() {
        let controller = test_controller();
        controller.start().await.unwrap();
        let action = Action::CmdRun {
            command: "rm -rf /*".into(),
            timeout_secs: None,
            is_static: false,
            confirmation_status: Some(ConfirmationStatus::Rejected),
        };
        let outcome = controller.dispatch(action).await.unwrap();
        assert_eq!(outcome, StepOutcome::Continue);

        let history = controller.events.all_events().await.unwrap();
        assert!(history
            .iter()
            .any(|e| matches!(&e.payload, EventPayload::Observation(Observation::Error { content }) if content.contains("denied by policy"))));
    }

    #[tokio::test]
    async fn dispatching_an_unmatched_command_pauses_for_confirmation() {
        let controller = test_controller();
        controller.start().await.unwrap();
        let action = Action::CmdRun {
            command: "cargo build".into(),
            timeout_secs: None,
            is_static: false,
            confirmation_status: Some(ConfirmationStatus::Awaiting),
        };
        let outcome = controller.dispatch(action).await.unwrap();
        assert_eq!(outcome, StepOutcome::AwaitingConfirmation);
        assert_eq!(controller.state().await, AgentState::AwaitingConfirmation);
    }

    #[tokio::test]
    async fn resolving_confirmation_approved_executes_the_pending_command() {
        let controller = test_controller();
        controller.start().await.unwrap();
        let action = Action::CmdRun {
            command: "echo hi".into(),
            timeout_secs: None,
            is_static: false,
            confirmation_status: Some(ConfirmationStatus::Awaiting),
        };
        let outcome = controller.dispatch(action).await.unwrap();
        assert_eq!(outcome, StepOutcome::AwaitingConfirmation);

        controller.resolve_confirmation(true).await.unwrap();
        assert_eq!(controller.state().await, AgentState::Running);

        let history = controller.events.all_events().await.unwrap();
        assert!(history
            .iter()
            .any(|e| matches!(&e.payload, EventPayload::Observation(Observation::CmdOutput { content, .. }) if content.contains("hi"))));
    }

    #[tokio::test]
    async fn resolving_confirmation_rejected_returns_to_running_with_user_reject() {
        let controller = test_controller();
        controller.start().await.unwrap();
        let action = Action::CmdRun {
            command: "echo hi".into(),
            timeout_secs: None,
            is_static: false,
            confirmation_status: Some(ConfirmationStatus::Awaiting),
        };
        controller.dispatch(action).await.unwrap();

        controller.resolve_confirmation(false).await.unwrap();
        assert_eq!(controller.state().await, AgentState::Running);

        let history = controller.events.all_events().await.unwrap();
        assert!(history.iter().any(|e| matches!(&e.payload, EventPayload::Observation(Observation::UserReject))));
    }

    #[tokio::test]
    async fn agent_delegate_runs_a_real_child_controller_instead_of_a_placeholder() {
        let controller = test_controller();
        controller.start().await.unwrap();
        let outcome = controller
            .dispatch(Action::AgentDelegate { agent: "reviewer".into(), inputs: serde_json::json!({"task": "look at diff"}) })
            .await
            .unwrap();
        assert_eq!(outcome, StepOutcome::Continue);

        let history = controller.events.all_events().await.unwrap();
        let outputs = history.iter().rev().find_map(|e| match &e.payload {
            EventPayload::Observation(Observation::AgentDelegate { outputs }) => Some(outputs.clone()),
            _ => None,
        }).expect("an AgentDelegate observation was appended");

        assert_eq!(outputs["agent"], "reviewer");
        assert_ne!(outputs["result"].get("status").and_then(Value::as_str), Some("not_dispatched"));
    }

    #[test]
    fn split_unified_hunk_recovers_old_and_new_strings() {
        let (old, new) = split_unified_hunk("@@ @@\n-foo\n-bar\n+baz\n");
        assert_eq!(old, "foo\nbar");
        assert_eq!(new, "baz");
    }
}
