// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Memory and condensation over the event stream.
//!
//! The agent never prompts the model with the raw [`conduit_events::Event`]
//! log directly. Instead a [`pipeline::CondenserPipeline`] builds a
//! [`view::View`] by running a chain of [`condenser::Condenser`]s over it —
//! masking stale tool output, dropping spans the conversation has moved
//! past, or asking the model itself to summarize them. Separately,
//! [`microagent::MicroagentRepo`] answers `RecallAction`s with relevant
//! guidance fragments loaded from disk.

pub mod condenser;
pub mod llm_condenser;
pub mod microagent;
pub mod pipeline;
pub mod view;

pub use condenser::{
    AmortizedForgettingCondenser, BrowserOutputCondenser, Condenser, NoOpCondenser, ObservationMaskingCondenser,
    RecentEventsCondenser,
};
pub use llm_condenser::{LLMAttentionCondenser, LLMSummarizingCondenser, StructuredSummary, StructuredSummaryCondenser};
pub use microagent::{Microagent, MicroagentError, MicroagentFrontmatter, MicroagentRepo};
pub use pipeline::{AppliedCondensation, CondenserPipeline};
pub use view::{CondenserResult, View};
