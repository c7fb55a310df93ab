// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;

use conduit_events::Event;
use conduit_model::{CompletionRequest, Message, ModelProvider, ResponseEvent};

use crate::condenser::Condenser;
use crate::view::{CondenserResult, View};

/// Drains a provider's streaming response into its concatenated text delta.
async fn collect_text(provider: &dyn ModelProvider, req: CompletionRequest) -> anyhow::Result<String> {
    let mut stream = provider.complete(req).await?;
    let mut text = String::new();
    while let Some(event) = stream.next().await {
        match event? {
            ResponseEvent::TextDelta(delta) => text.push_str(&delta),
            ResponseEvent::Done => break,
            ResponseEvent::Error(e) => anyhow::bail!("model error during condensation: {e}"),
            _ => {}
        }
    }
    Ok(text)
}

fn render_events_for_summary(events: &[Event]) -> String {
    events
        .iter()
        .map(|e| match (e.as_action(), e.as_observation()) {
            (Some(a), _) => format!("[{}] action {}: {:?}", e.id, a.kind(), a),
            (_, Some(o)) => format!("[{}] observation {}: {:?}", e.id, o.kind(), o),
            _ => format!("[{}] <empty>", e.id),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Invokes the LLM to produce a natural-language summary of the span that
/// would otherwise be dropped, once the view exceeds `threshold` events.
pub struct LLMSummarizingCondenser {
    pub provider: Arc<dyn ModelProvider>,
    pub threshold: usize,
    pub keep: usize,
    pub max_summary_tokens: u32,
}

#[async_trait]
impl Condenser for LLMSummarizingCondenser {
    async fn condense(&self, view: View) -> anyhow::Result<CondenserResult> {
        if view.len() <= self.threshold {
            return Ok(CondenserResult::View(view));
        }
        let keep = self.keep.min(view.len() / 2);
        let dropped = &view.events[keep..view.len() - keep];
        let replaced_ids: Vec<u64> = dropped.iter().map(|e| e.id).collect();

        let prompt = format!(
            "Summarize the following agent trajectory span in at most {} tokens. \
             Focus on what was attempted and what the outcome was.\n\n{}",
            self.max_summary_tokens,
            render_events_for_summary(dropped)
        );
        let req = CompletionRequest { messages: vec![Message::user(prompt)], ..Default::default() };
        let summary = collect_text(self.provider.as_ref(), req).await?;

        let mut kept = view.events[..keep].to_vec();
        kept.extend(view.events[view.len() - keep..].iter().cloned());

        Ok(CondenserResult::Condensation { view: View::from_events(kept), summary, replaced_ids })
    }

    fn name(&self) -> &str {
        "llm_summarizing"
    }
}

/// Asks the LLM to select the `k` most important events to retain; the rest
/// are dropped via a `Condensation` whose summary records which ids survived.
pub struct LLMAttentionCondenser {
    pub provider: Arc<dyn ModelProvider>,
    pub keep_k: usize,
}

#[async_trait]
impl Condenser for LLMAttentionCondenser {
    async fn condense(&self, view: View) -> anyhow::Result<CondenserResult> {
        if view.len() <= self.keep_k {
            return Ok(CondenserResult::View(view));
        }

        let prompt = format!(
            "From the numbered events below, list the {} most important event ids to retain, \
             comma-separated, most important first. Reply with ids only.\n\n{}",
            self.keep_k,
            render_events_for_summary(&view.events)
        );
        let req = CompletionRequest { messages: vec![Message::user(prompt)], ..Default::default() };
        let reply = collect_text(self.provider.as_ref(), req).await?;

        let mut selected: Vec<u64> = reply.split(',').filter_map(|s| s.trim().parse::<u64>().ok()).collect();
        selected.sort_unstable();
        selected.dedup();

        if selected.is_empty() {
            // The model didn't return anything usable — fall back to keeping
            // the most recent keep_k events rather than dropping everything.
            let start = view.events.len() - self.keep_k;
            return Ok(CondenserResult::View(View::from_events(view.events[start..].to_vec())));
        }

        let selected_set: std::collections::HashSet<u64> = selected.iter().copied().collect();
        let replaced_ids: Vec<u64> = view.events.iter().map(|e| e.id).filter(|id| !selected_set.contains(id)).collect();
        let kept: Vec<Event> = view.events.into_iter().filter(|e| selected_set.contains(&e.id)).collect();

        Ok(CondenserResult::Condensation {
            view: View::from_events(kept),
            summary: format!("attention pass retained {} of {} events", selected_set.len(), replaced_ids.len() + selected_set.len()),
            replaced_ids,
        })
    }

    fn name(&self) -> &str {
        "llm_attention"
    }
}

/// Like [`LLMSummarizingCondenser`] but asks for a fixed JSON shape
/// (`goals`, `completed_steps`, `open_questions`) instead of free text, so
/// downstream prompts can render it consistently.
pub struct StructuredSummaryCondenser {
    pub provider: Arc<dyn ModelProvider>,
    pub threshold: usize,
    pub keep: usize,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StructuredSummary {
    pub goals: Vec<String>,
    pub completed_steps: Vec<String>,
    pub open_questions: Vec<String>,
}

impl StructuredSummary {
    pub fn to_text(&self) -> String {
        format!(
            "Goals:\n{}\nCompleted:\n{}\nOpen questions:\n{}",
            self.goals.join("\n"),
            self.completed_steps.join("\n"),
            self.open_questions.join("\n")
        )
    }
}

#[async_trait]
impl Condenser for StructuredSummaryCondenser {
    async fn condense(&self, view: View) -> anyhow::Result<CondenserResult> {
        if view.len() <= self.threshold {
            return Ok(CondenserResult::View(view));
        }
        let keep = self.keep.min(view.len() / 2);
        let dropped = &view.events[keep..view.len() - keep];
        let replaced_ids: Vec<u64> = dropped.iter().map(|e| e.id).collect();

        let prompt = format!(
            "Summarize the span below as JSON with keys goals, completed_steps, open_questions \
             (arrays of short strings). Reply with JSON only.\n\n{}",
            render_events_for_summary(dropped)
        );
        let req = CompletionRequest { messages: vec![Message::user(prompt)], ..Default::default() };
        let raw = collect_text(self.provider.as_ref(), req).await?;

        let summary: StructuredSummary = serde_json::from_str(raw.trim()).unwrap_or(StructuredSummary {
            goals: vec![],
            completed_steps: vec![],
            open_questions: vec![format!("summary parse failed, raw: {raw}")],
        });

        let mut kept = view.events[..keep].to_vec();
        kept.extend(view.events[view.len() - keep..].iter().cloned());

        Ok(CondenserResult::Condensation { view: View::from_events(kept), summary: summary.to_text(), replaced_ids })
    }

    fn name(&self) -> &str {
        "structured_summary"
    }
}
