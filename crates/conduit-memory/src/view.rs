// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use conduit_events::Event;

/// A window over a conversation's events, as seen by the LLM after the
/// condenser pipeline has run. Distinct from the raw `EventStore` log:
/// the View may omit, mask, or replace spans the condensers decided were
/// safe to forget.
#[derive(Debug, Clone)]
pub struct View {
    pub events: Vec<Event>,
}

impl View {
    pub fn from_events(events: Vec<Event>) -> Self {
        Self { events }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// The result of running a single condenser over a [`View`].
pub enum CondenserResult {
    /// The view, possibly rewritten in place (masking, stripping).
    View(View),
    /// A span of events was dropped and replaced by a summary marker; the
    /// pipeline must append this observation to the real event store so
    /// future prompts see the same condensation deterministically.
    Condensation {
        view: View,
        summary: String,
        /// ids of the events the summary replaces, for logging/debugging.
        replaced_ids: Vec<u64>,
    },
}

impl CondenserResult {
    pub fn into_view(self) -> View {
        match self {
            CondenserResult::View(v) => v,
            CondenserResult::Condensation { view, .. } => view,
        }
    }

    pub fn is_condensation(&self) -> bool {
        matches!(self, CondenserResult::Condensation { .. })
    }
}
