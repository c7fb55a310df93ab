// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod controller;
mod stuck;

pub use controller::{AgentController, AgentControllerConfig, StepOutcome};
pub use stuck::StuckDetector;
