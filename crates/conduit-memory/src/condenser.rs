// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use conduit_events::{Event, EventPayload, Observation};

use crate::view::{CondenserResult, View};

/// Chain-of-responsibility step over a conversation's [`View`]. Condensers
/// compose left-to-right in a [`crate::pipeline::CondenserPipeline`]; the
/// first to return a `Condensation` short-circuits the rest.
#[async_trait]
pub trait Condenser: Send + Sync {
    async fn condense(&self, view: View) -> anyhow::Result<CondenserResult>;

    fn name(&self) -> &str;
}

/// Identity condenser — passes the view through unchanged. Useful as a
/// pipeline terminator or in tests that want to disable condensation.
pub struct NoOpCondenser;

#[async_trait]
impl Condenser for NoOpCondenser {
    async fn condense(&self, view: View) -> anyhow::Result<CondenserResult> {
        Ok(CondenserResult::View(view))
    }

    fn name(&self) -> &str {
        "noop"
    }
}

/// Retains the first `keep_first` events (typically the system and initial
/// user message) plus the most recent `max_events - keep_first`. Drops the
/// middle silently — callers that need a recorded summary should use
/// [`crate::llm_condenser::AmortizedForgettingCondenser`] or an LLM
/// condenser instead.
pub struct RecentEventsCondenser {
    pub keep_first: usize,
    pub max_events: usize,
}

#[async_trait]
impl Condenser for RecentEventsCondenser {
    async fn condense(&self, view: View) -> anyhow::Result<CondenserResult> {
        if view.len() <= self.max_events {
            return Ok(CondenserResult::View(view));
        }
        let keep_first = self.keep_first.min(view.events.len());
        let keep_recent = self.max_events.saturating_sub(keep_first);
        let recent_start = view.events.len().saturating_sub(keep_recent);

        let mut kept: Vec<Event> = view.events[..keep_first].to_vec();
        kept.extend(view.events[recent_start.max(keep_first)..].to_vec());
        Ok(CondenserResult::View(View::from_events(kept)))
    }

    fn name(&self) -> &str {
        "recent_events"
    }
}

const MASKED_PLACEHOLDER: &str = "<MASKED>";

/// Replaces observation content outside the last `attention_window`
/// observations with a placeholder, keeping actions (and their structural
/// shape) intact so the model still sees what it tried to do.
pub struct ObservationMaskingCondenser {
    pub attention_window: usize,
}

#[async_trait]
impl Condenser for ObservationMaskingCondenser {
    async fn condense(&self, view: View) -> anyhow::Result<CondenserResult> {
        let total_observations = view.events.iter().filter(|e| e.is_observation()).count();
        if total_observations <= self.attention_window {
            return Ok(CondenserResult::View(view));
        }

        let mut seen_from_tail = 0usize;
        let mut masked: Vec<Event> = Vec::with_capacity(view.events.len());
        for event in view.events.iter().rev() {
            if event.is_observation() {
                seen_from_tail += 1;
                if seen_from_tail > self.attention_window {
                    masked.push(mask_observation(event));
                    continue;
                }
            }
            masked.push(event.clone());
        }
        masked.reverse();
        Ok(CondenserResult::View(View::from_events(masked)))
    }

    fn name(&self) -> &str {
        "observation_masking"
    }
}

fn mask_observation(event: &Event) -> Event {
    let mut masked = event.clone();
    if let EventPayload::Observation(obs) = &masked.payload {
        let replaced = match obs {
            Observation::CmdOutput { command, exit_code, .. } => {
                Observation::CmdOutput { command: command.clone(), exit_code: *exit_code, content: MASKED_PLACEHOLDER.into() }
            }
            Observation::IPythonRunCell { .. } => Observation::IPythonRunCell { content: MASKED_PLACEHOLDER.into() },
            Observation::FileRead { path, .. } => Observation::FileRead { path: path.clone(), content: MASKED_PLACEHOLDER.into() },
            Observation::FileEdit { path, .. } => Observation::FileEdit { path: path.clone(), content: MASKED_PLACEHOLDER.into() },
            Observation::Recall { .. } => Observation::Recall { content: MASKED_PLACEHOLDER.into() },
            Observation::Mcp { name, arguments, .. } => {
                Observation::Mcp { name: name.clone(), arguments: arguments.clone(), content: MASKED_PLACEHOLDER.into() }
            }
            other => other.clone(),
        };
        masked.payload = EventPayload::Observation(replaced);
    }
    masked
}

/// Strips the bulky AXTree/screenshot payload from browser observations
/// that aren't the most recent one — they're rarely useful once the agent
/// has moved past that page.
pub struct BrowserOutputCondenser {
    pub keep_last_n: usize,
}

impl Default for BrowserOutputCondenser {
    fn default() -> Self {
        Self { keep_last_n: 1 }
    }
}

#[async_trait]
impl Condenser for BrowserOutputCondenser {
    async fn condense(&self, view: View) -> anyhow::Result<CondenserResult> {
        let browser_indices: Vec<usize> = view
            .events
            .iter()
            .enumerate()
            .filter(|(_, e)| matches!(e.as_observation(), Some(Observation::BrowserOutput { .. })))
            .map(|(i, _)| i)
            .collect();
        if browser_indices.len() <= self.keep_last_n {
            return Ok(CondenserResult::View(view));
        }
        let strip_before = browser_indices.len() - self.keep_last_n;
        let strip_set: std::collections::HashSet<usize> = browser_indices[..strip_before].iter().copied().collect();

        let events = view
            .events
            .into_iter()
            .enumerate()
            .map(|(i, mut e)| {
                if strip_set.contains(&i) {
                    if let EventPayload::Observation(Observation::BrowserOutput { url, error, .. }) = &e.payload {
                        e.payload = EventPayload::Observation(Observation::BrowserOutput {
                            url: url.clone(),
                            screenshot: None,
                            axtree: None,
                            error: error.clone(),
                        });
                    }
                }
                e
            })
            .collect();
        Ok(CondenserResult::View(View::from_events(events)))
    }

    fn name(&self) -> &str {
        "browser_output"
    }
}

/// When the view exceeds `threshold` events, drops the middle span,
/// preserving the first and last `keep` events, and reports a
/// `Condensation` whose summary names how many events (and which ids) were
/// dropped — the controller is responsible for persisting this marker.
pub struct AmortizedForgettingCondenser {
    pub threshold: usize,
    pub keep: usize,
}

#[async_trait]
impl Condenser for AmortizedForgettingCondenser {
    async fn condense(&self, view: View) -> anyhow::Result<CondenserResult> {
        if view.len() <= self.threshold {
            return Ok(CondenserResult::View(view));
        }
        let keep = self.keep.min(view.len() / 2);
        let first = &view.events[..keep];
        let last = &view.events[view.len() - keep..];
        let dropped = &view.events[keep..view.len() - keep];
        let replaced_ids: Vec<u64> = dropped.iter().map(|e| e.id).collect();

        let mut kept = first.to_vec();
        kept.extend(last.iter().cloned());

        Ok(CondenserResult::Condensation {
            view: View::from_events(kept),
            summary: format!("{} events forgotten (ids {:?}..{:?})", dropped.len(), replaced_ids.first(), replaced_ids.last()),
            replaced_ids,
        })
    }

    fn name(&self) -> &str {
        "amortized_forgetting"
    }
}
