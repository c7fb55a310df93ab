// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use conduit_events::Event;

use crate::condenser::Condenser;
use crate::view::{CondenserResult, View};

/// A record of a condensation the pipeline applied, so the caller can
/// append the matching `AgentCondensationObservation` to the real event
/// store. Without this, the next run would see the full history again and
/// redo (possibly differently) the same condensation.
pub struct AppliedCondensation {
    pub condenser_name: String,
    pub summary: String,
    pub replaced_ids: Vec<u64>,
}

/// Runs a sequence of condensers over a view, left to right. The first
/// condenser to return a `Condensation` short-circuits the rest — later
/// condensers never see events an earlier one already decided to drop.
pub struct CondenserPipeline {
    condensers: Vec<Box<dyn Condenser>>,
}

impl CondenserPipeline {
    pub fn new(condensers: Vec<Box<dyn Condenser>>) -> Self {
        Self { condensers }
    }

    /// Runs the pipeline over `events`, returning the resulting view and,
    /// if any condenser fired, the condensation record to persist.
    pub async fn run(&self, events: Vec<Event>) -> anyhow::Result<(View, Option<AppliedCondensation>)> {
        let mut view = View::from_events(events);
        for condenser in &self.condensers {
            match condenser.condense(view).await? {
                CondenserResult::View(next) => view = next,
                CondenserResult::Condensation { view: next, summary, replaced_ids } => {
                    return Ok((
                        next,
                        Some(AppliedCondensation { condenser_name: condenser.name().to_string(), summary, replaced_ids }),
                    ));
                }
            }
        }
        Ok((view, None))
    }
}
