// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use conduit_events::{Action, Observation};
use conduit_tools::{ToolCall, ToolOutputPart, ToolRegistry};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime unavailable: {0}")]
    Unavailable(String),
    #[error("action timed out after {0:?}")]
    Timeout(Duration),
    #[error("runtime disconnected")]
    Disconnected,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// MCP tools/config merged into a conversation's tool list — the runtime
/// contributes its own built-ins, microagents contribute the rest.
#[derive(Debug, Clone, Default)]
pub struct McpConfig {
    pub server_names: Vec<String>,
}

/// A sandbox (or local-process stand-in) that executes [`Action`]s.
///
/// Concrete backends (container, remote HTTP, E2B, Modal, Runloop, CLI-only)
/// are opaque to the controller: it only ever sees this trait. Selection is
/// by configuration name.
#[async_trait]
pub trait Runtime: Send + Sync {
    async fn connect(&self) -> Result<(), RuntimeError>;

    /// Dispatch `action`. Must resolve within `timeout` or the caller turns
    /// the elapsed deadline into an `ErrorObservation` itself — this method
    /// is allowed to run longer only when no timeout is given.
    async fn run_action(&self, action: &Action, timeout: Option<Duration>) -> Result<Observation, RuntimeError>;

    fn get_mcp_config(&self, extra: &McpConfig) -> McpConfig;

    async fn copy_to(&self, src: &str, dest: &str) -> Result<(), RuntimeError>;
    async fn copy_from(&self, src: &str) -> Result<Vec<u8>, RuntimeError>;

    async fn close(&self) -> Result<(), RuntimeError>;

    fn runtime_initialized(&self) -> bool;
    fn vscode_url(&self) -> Option<String> {
        None
    }
    fn web_hosts(&self) -> HashMap<String, u16> {
        HashMap::new()
    }
}

/// Default timeout applied to an action with no explicit `timeout_secs`.
const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(120);

/// Executes actions as local OS processes via the built-in tool set.
///
/// This is the `"local"` runtime: not a sandbox. Every action runs with the
/// same privileges as the server process. It exists for the CLI wrapper and
/// integration tests, grounded on the same subprocess-isolation discipline
/// (`stdin(null)`, `kill_on_drop`, `setsid`) the shell tool itself uses.
pub struct LocalProcessRuntime {
    registry: Arc<ToolRegistry>,
    workdir: std::sync::Mutex<String>,
    connected: std::sync::atomic::AtomicBool,
}

impl LocalProcessRuntime {
    pub fn new(registry: Arc<ToolRegistry>, workdir: impl Into<String>) -> Self {
        Self {
            registry,
            workdir: std::sync::Mutex::new(workdir.into()),
            connected: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn call_for(&self, action: &Action, call_id: &str) -> Option<ToolCall> {
        let workdir = self.workdir.lock().unwrap().clone();
        let (name, mut args) = match action {
            Action::CmdRun { command, timeout_secs, .. } => (
                "shell",
                serde_json::json!({
                    "shell_command": command,
                    "timeout_secs": timeout_secs,
                }),
            ),
            Action::FileRead { path, start, end } => (
                "read_file",
                serde_json::json!({
                    "path": path,
                    "offset": start,
                    "limit": end.zip(*start).map(|(e, s)| e.saturating_sub(s)),
                }),
            ),
            Action::FileWrite { path, content, .. } => (
                "write",
                serde_json::json!({ "path": path, "content": content }),
            ),
            Action::FileEdit { path, old_str, new_str, .. } => (
                "edit_file",
                serde_json::json!({
                    "path": path,
                    "diff": as_unified_hunk(old_str, new_str),
                }),
            ),
            _ => return None,
        };
        if let Some(obj) = args.as_object_mut() {
            obj.entry("workdir").or_insert(serde_json::Value::String(workdir));
        }
        Some(ToolCall { id: call_id.to_string(), name: name.to_string(), args })
    }
}

#[async_trait]
impl Runtime for LocalProcessRuntime {
    async fn connect(&self) -> Result<(), RuntimeError> {
        self.connected.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    async fn run_action(&self, action: &Action, timeout: Option<Duration>) -> Result<Observation, RuntimeError> {
        if !self.connected.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(RuntimeError::Disconnected);
        }

        let deadline = timeout.unwrap_or(DEFAULT_ACTION_TIMEOUT);
        let call_id = uuid_like_id();

        let observation = match action {
            Action::CmdRun { command, .. } => {
                let call = self.call_for(action, &call_id).expect("CmdRun maps to a call");
                let out = tokio::time::timeout(deadline, self.registry.execute(&call))
                    .await
                    .map_err(|_| RuntimeError::Timeout(deadline))?;
                Observation::CmdOutput {
                    command: command.clone(),
                    exit_code: if out.is_error { 1 } else { 0 },
                    content: out.content,
                }
            }
            Action::FileRead { path, .. } => {
                let call = self.call_for(action, &call_id).expect("FileRead maps to a call");
                let out = tokio::time::timeout(deadline, self.registry.execute(&call))
                    .await
                    .map_err(|_| RuntimeError::Timeout(deadline))?;
                if out.is_error {
                    Observation::error_content(out.content)
                } else {
                    Observation::FileRead { path: path.clone(), content: out.content }
                }
            }
            Action::FileWrite { path, .. } => {
                let call = self.call_for(action, &call_id).expect("FileWrite maps to a call");
                let out = tokio::time::timeout(deadline, self.registry.execute(&call))
                    .await
                    .map_err(|_| RuntimeError::Timeout(deadline))?;
                if out.is_error {
                    Observation::error_content(out.content)
                } else {
                    Observation::FileWrite { path: path.clone() }
                }
            }
            Action::FileEdit { path, .. } => {
                let call = self.call_for(action, &call_id).expect("FileEdit maps to a call");
                let out = tokio::time::timeout(deadline, self.registry.execute(&call))
                    .await
                    .map_err(|_| RuntimeError::Timeout(deadline))?;
                if out.is_error {
                    Observation::error_content(out.content)
                } else {
                    Observation::FileEdit { path: path.clone(), content: out.content }
                }
            }
            Action::IPythonRunCell { .. } => {
                Observation::error_content("IPython execution is not supported by the local process runtime")
            }
            Action::BrowseUrl { .. } | Action::BrowseInteractive { .. } => {
                Observation::error_content("browsing is not supported by the local process runtime")
            }
            Action::Mcp { name, arguments } => {
                let call = ToolCall { id: call_id.clone(), name: name.clone(), args: arguments.clone() };
                let out = tokio::time::timeout(deadline, self.registry.execute(&call))
                    .await
                    .map_err(|_| RuntimeError::Timeout(deadline))?;
                if out.is_error {
                    Observation::error_content(out.content)
                } else {
                    Observation::Mcp { name: name.clone(), arguments: arguments.clone(), content: out.content }
                }
            }
            Action::Message { .. }
            | Action::AgentDelegate { .. }
            | Action::AgentFinish { .. }
            | Action::AgentReject { .. }
            | Action::AgentThink { .. }
            | Action::ChangeAgentState { .. }
            | Action::Recall { .. }
            | Action::Null => {
                return Err(RuntimeError::Unavailable(format!(
                    "{} is a controller-internal action and never reaches the runtime",
                    action.kind()
                )));
            }
        };

        Ok(observation)
    }

    fn get_mcp_config(&self, extra: &McpConfig) -> McpConfig {
        let mut names = self.registry.names();
        names.extend(extra.server_names.iter().cloned());
        names.sort();
        names.dedup();
        McpConfig { server_names: names }
    }

    async fn copy_to(&self, src: &str, dest: &str) -> Result<(), RuntimeError> {
        tokio::fs::copy(src, dest).await?;
        Ok(())
    }

    async fn copy_from(&self, src: &str) -> Result<Vec<u8>, RuntimeError> {
        Ok(tokio::fs::read(src).await?)
    }

    async fn close(&self) -> Result<(), RuntimeError> {
        self.connected.store(false, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn runtime_initialized(&self) -> bool {
        self.connected.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Builds a minimal unified-diff hunk (`@@ @@` header, no context lines)
/// from an old/new string pair, the shape `edit_file`'s parser expects.
fn as_unified_hunk(old_str: &str, new_str: &str) -> String {
    let mut out = String::from("@@ @@\n");
    for line in old_str.lines() {
        out.push('-');
        out.push_str(line);
        out.push('\n');
    }
    for line in new_str.lines() {
        out.push('+');
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Cheap, collision-resistant-enough id for tool calls the runtime
/// synthesizes itself (the controller assigns the real event id).
fn uuid_like_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
    format!("local-{nanos:x}")
}

/// Checks the `parts` produced by a tool for images the pure-text Observation
/// variants above cannot carry — currently unused by any builtin tool still
/// in the registry, kept so browser/vision runtimes can reuse it later.
#[allow(dead_code)]
fn extract_images(parts: &[ToolOutputPart]) -> Vec<String> {
    parts
        .iter()
        .filter_map(|p| match p {
            ToolOutputPart::Image(data) => Some(data.clone()),
            ToolOutputPart::Text(_) => None,
        })
        .collect()
}
