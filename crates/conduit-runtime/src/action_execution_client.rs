// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! HTTP-backed [`Runtime`] that talks to an action-execution server running
//! inside a sandbox (container, microVM, remote box) instead of executing
//! actions in-process the way [`crate::runtime::LocalProcessRuntime`] does.
//!
//! Wire contract: every [`Action`] is serialized to JSON and POSTed to
//! `{base_url}/execute_action`; the server answers with a JSON-encoded
//! [`Observation`]. The sandbox may still be booting when the client is
//! constructed, so `connect()` polls `{base_url}/alive` with exponential
//! backoff before handing control back to the caller.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use conduit_events::{Action, Observation};

use crate::runtime::{McpConfig, Runtime, RuntimeError};

/// HTTP header carrying the per-session secret the sandbox was started
/// with; the server rejects any request missing it.
const SESSION_API_KEY_HEADER: &str = "X-Session-API-Key";

/// Upper bound on `/alive` polling attempts before giving up.
const MAX_ALIVE_ATTEMPTS: u32 = 10;

/// Ceiling on the backoff delay between `/alive` polls, regardless of how
/// many attempts have elapsed.
const MAX_ALIVE_BACKOFF: Duration = Duration::from_secs(10);

/// Base delay for the exponential `/alive` backoff (doubles each attempt).
const INITIAL_ALIVE_BACKOFF: Duration = Duration::from_millis(250);

/// Executes actions by forwarding them over HTTP to a sandboxed action
/// execution server, e.g. the process started inside a container runtime.
pub struct ActionExecutionClient {
    client: Client,
    base_url: String,
    session_api_key: String,
    connected: std::sync::atomic::AtomicBool,
    max_alive_attempts: u32,
    initial_alive_backoff: Duration,
    max_alive_backoff: Duration,
}

impl ActionExecutionClient {
    /// `base_url` should have no trailing slash, e.g. `http://127.0.0.1:3000`.
    pub fn new(base_url: impl Into<String>, session_api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            session_api_key: session_api_key.into(),
            connected: std::sync::atomic::AtomicBool::new(false),
            max_alive_attempts: MAX_ALIVE_ATTEMPTS,
            initial_alive_backoff: INITIAL_ALIVE_BACKOFF,
            max_alive_backoff: MAX_ALIVE_BACKOFF,
        }
    }

    /// Overrides the `/alive` retry policy — used by tests so an unreachable
    /// host fails fast instead of waiting out the production backoff.
    #[cfg(test)]
    fn with_alive_policy(mut self, max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        self.max_alive_attempts = max_attempts;
        self.initial_alive_backoff = initial_backoff;
        self.max_alive_backoff = max_backoff;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Polls `/alive` with exponential backoff (250ms, 500ms, ... capped at
    /// 10s by default) until the sandbox answers 2xx or the attempt budget
    /// is exhausted.
    async fn wait_until_alive(&self) -> Result<(), RuntimeError> {
        let mut backoff = self.initial_alive_backoff;
        for attempt in 1..=self.max_alive_attempts {
            match self.client.get(self.url("/alive")).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => tracing::debug!(attempt, status = %resp.status(), "runtime not alive yet"),
                Err(err) => tracing::debug!(attempt, error = %err, "runtime not alive yet"),
            }
            if attempt == self.max_alive_attempts {
                break;
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.max_alive_backoff);
        }
        Err(RuntimeError::Unavailable(format!(
            "runtime at {} did not become alive after {} attempts",
            self.base_url, self.max_alive_attempts
        )))
    }
}

#[async_trait]
impl Runtime for ActionExecutionClient {
    async fn connect(&self) -> Result<(), RuntimeError> {
        self.wait_until_alive().await?;
        self.connected.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    async fn run_action(&self, action: &Action, timeout: Option<Duration>) -> Result<Observation, RuntimeError> {
        if !self.runtime_initialized() {
            return Err(RuntimeError::Disconnected);
        }

        let mut req = self
            .client
            .post(self.url("/execute_action"))
            .header(SESSION_API_KEY_HEADER, &self.session_api_key)
            .json(action);

        if let Some(timeout) = timeout {
            req = req.timeout(timeout);
        }

        let resp = req.send().await.map_err(|err| {
            if err.is_timeout() {
                RuntimeError::Timeout(timeout.unwrap_or_default())
            } else {
                RuntimeError::Unavailable(err.to_string())
            }
        })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(RuntimeError::Unavailable(format!("runtime returned {status}: {text}")));
        }

        resp.json::<Observation>().await.map_err(|err| RuntimeError::Unavailable(format!("malformed observation body: {err}")))
    }

    fn get_mcp_config(&self, extra: &McpConfig) -> McpConfig {
        extra.clone()
    }

    async fn copy_to(&self, src: &str, dest: &str) -> Result<(), RuntimeError> {
        let bytes = tokio::fs::read(src).await?;
        let resp = self
            .client
            .post(self.url("/upload_file"))
            .header(SESSION_API_KEY_HEADER, &self.session_api_key)
            .query(&[("destination", dest)])
            .body(bytes)
            .send()
            .await
            .map_err(|err| RuntimeError::Unavailable(err.to_string()))?;
        if !resp.status().is_success() {
            return Err(RuntimeError::Unavailable(format!("upload to {dest} failed with {}", resp.status())));
        }
        Ok(())
    }

    async fn copy_from(&self, src: &str) -> Result<Vec<u8>, RuntimeError> {
        let resp = self
            .client
            .get(self.url("/download_file"))
            .header(SESSION_API_KEY_HEADER, &self.session_api_key)
            .query(&[("path", src)])
            .send()
            .await
            .map_err(|err| RuntimeError::Unavailable(err.to_string()))?;
        if !resp.status().is_success() {
            return Err(RuntimeError::Unavailable(format!("download of {src} failed with {}", resp.status())));
        }
        Ok(resp.bytes().await.map_err(|err| RuntimeError::Unavailable(err.to_string()))?.to_vec())
    }

    async fn close(&self) -> Result<(), RuntimeError> {
        self.connected.store(false, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn runtime_initialized(&self) -> bool {
        self.connected.load(std::sync::atomic::Ordering::SeqCst)
    }
}
