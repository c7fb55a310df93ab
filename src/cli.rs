// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};

/// `conduit` — an event-sourced, multi-tenant orchestration server for
/// interactive AI coding agents.
#[derive(Parser, Debug)]
#[command(name = "conduit", version, about)]
pub struct Cli {
    /// Path to a config file, merged over the default search path layers.
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Model override: "provider/model", a known provider id, or a bare
    /// model name. See `conduit show-config` for the resolved value.
    #[arg(long, short = 'm', global = true)]
    pub model: Option<String>,

    /// Increase log verbosity. Repeat for more (`-v`, `-vv`, `-vvv`).
    #[arg(long, short = 'v', global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a single conversation to completion and print its transcript.
    ///
    /// Starts one conversation, submits `prompt` as the first user message,
    /// drives the agent loop to a terminal state (finished, rejected,
    /// stuck, or errored), and prints the resulting event log. Confirmation
    /// gates are auto-approved in this mode since there is no attached
    /// client to resolve them.
    Run {
        /// The task to hand the agent.
        prompt: String,

        /// Directory the agent's runtime operates in.
        #[arg(long, default_value = ".")]
        workdir: PathBuf,

        /// Hard cap on agent step() iterations before giving up.
        #[arg(long, default_value_t = 250)]
        max_iterations: usize,

        /// Print the full CBOR-equivalent event log as JSON instead of a
        /// human-readable transcript.
        #[arg(long)]
        output_jsonl: bool,
    },

    /// Start the WebSocket control server.
    ///
    /// Exposes [`conduit_server::ConversationManager`] over `/ws`; any
    /// number of clients may join the same conversation id concurrently.
    Serve {
        /// Address to bind the HTTP/WebSocket listener on.
        #[arg(long, default_value = "127.0.0.1:8787")]
        listen: String,

        /// Directory the agent's runtime operates in.
        #[arg(long, default_value = ".")]
        workdir: PathBuf,

        /// Hard cap on concurrently running conversations.
        #[arg(long, default_value_t = 64)]
        max_conversations: usize,
    },

    /// Print the fully resolved configuration as YAML.
    ShowConfig,

    /// Generate shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

pub fn print_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut std::io::stdout());
}
