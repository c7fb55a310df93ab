// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use conduit_agent::{AgentController, AgentControllerConfig, StepOutcome};
use conduit_config::Config;
use conduit_events::{Event, EventPayload, EventSource, EventStore, InMemoryEventStore};
use conduit_memory::{CondenserPipeline, ObservationMaskingCondenser, RecentEventsCondenser};
use conduit_model::ModelProvider;
use conduit_runtime::{LocalProcessRuntime, Runtime};
use conduit_server::{ConversationManager, ConversationManagerConfig};
use conduit_tools::{
    DeleteFileTool, EditFileTool, FindFileTool, GrepTool, ListDirTool, ReadFileTool, ShellTool, ToolPolicy,
    ToolRegistry, WriteTool,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Completions { shell } => {
            cli::print_completions(shell);
            Ok(())
        }
        Commands::ShowConfig => {
            let config = load_config(cli.config.as_deref(), cli.model.as_deref())?;
            println!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
        Commands::Run { prompt, workdir, max_iterations, output_jsonl } => {
            run_headless(&cli, prompt, workdir, max_iterations, output_jsonl).await
        }
        Commands::Serve { listen, workdir, max_conversations } => serve(&cli, listen, workdir, max_conversations).await,
    }
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "conduit=info,conduit_server=info,conduit_agent=info",
        1 => "conduit=debug,conduit_server=debug,conduit_agent=debug",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
}

fn load_config(path: Option<&std::path::Path>, model_override: Option<&str>) -> anyhow::Result<Config> {
    let mut config = conduit_config::load(path).context("loading configuration")?;
    if let Some(over) = model_override {
        config.model = conduit_model::resolve_model_from_config(&config, over);
    }
    Ok(config)
}

fn build_tool_registry(config: &Config) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(ReadFileTool);
    registry.register(WriteTool);
    registry.register(EditFileTool);
    registry.register(DeleteFileTool);
    registry.register(FindFileTool);
    registry.register(ListDirTool);
    registry.register(GrepTool);
    registry.register(ShellTool { timeout_secs: config.tools.timeout_secs });
    registry
}

fn build_condenser_pipeline() -> CondenserPipeline {
    CondenserPipeline::new(vec![
        Box::new(ObservationMaskingCondenser { attention_window: 3 }),
        Box::new(RecentEventsCondenser { keep_first: 2, max_events: 80 }),
    ])
}

fn build_model_provider(config: &Config) -> anyhow::Result<Arc<dyn ModelProvider>> {
    let provider = conduit_model::from_config(&config.model).context("constructing model provider")?;
    Ok(Arc::from(provider))
}

async fn run_headless(
    cli: &Cli,
    prompt: String,
    workdir: std::path::PathBuf,
    max_iterations: usize,
    output_jsonl: bool,
) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref(), cli.model.as_deref())?;
    let tools = Arc::new(build_tool_registry(&config));
    let runtime: Arc<dyn Runtime> = Arc::new(LocalProcessRuntime::new(tools.clone(), workdir.to_string_lossy().into_owned()));
    let model = build_model_provider(&config)?;
    let pipeline = Arc::new(build_condenser_pipeline());
    let tool_policy = Arc::new(ToolPolicy::from_config(&config.tools));

    let events: Arc<dyn EventStore> = InMemoryEventStore::new();
    let controller = Arc::new(AgentController::new(
        events.clone(),
        runtime,
        model,
        tools,
        pipeline,
        None,
        tool_policy,
        AgentControllerConfig { max_iterations, headless_mode: true, action_timeout: Duration::from_secs(120) },
    ));

    controller.start().await?;
    controller.submit_user_message(prompt).await?;

    loop {
        match controller.step().await? {
            StepOutcome::Continue => continue,
            StepOutcome::AwaitingUserInput => break,
            // Headless runs have no client to resolve a gate; approve and proceed.
            StepOutcome::AwaitingConfirmation => controller.resolve_confirmation(true).await?,
            StepOutcome::Finished | StepOutcome::Rejected | StepOutcome::Stuck => break,
            StepOutcome::Errored(reason) => {
                anyhow::bail!("agent loop errored: {reason}");
            }
        }
    }

    print_transcript(&events.all_events().await?, output_jsonl)?;
    Ok(())
}

fn print_transcript(events: &[Event], as_jsonl: bool) -> anyhow::Result<()> {
    for event in events {
        if as_jsonl {
            println!("{}", serde_json::to_string(event)?);
            continue;
        }
        match &event.payload {
            EventPayload::Action(action) => println!("[{:?}] -> {}", event.source, action.kind()),
            EventPayload::Observation(obs) => println!("  <- {obs:?}"),
        }
    }
    Ok(())
}

async fn serve(cli: &Cli, listen: String, workdir: std::path::PathBuf, max_conversations: usize) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref(), cli.model.as_deref())?;
    let tools = Arc::new(build_tool_registry(&config));
    let model = build_model_provider(&config)?;
    let tool_policy = Arc::new(ToolPolicy::from_config(&config.tools));

    let manager = ConversationManager::new(
        model,
        tools.clone(),
        Arc::new(build_condenser_pipeline()),
        None,
        tool_policy,
        move || Arc::new(LocalProcessRuntime::new(tools.clone(), workdir.to_string_lossy().into_owned())) as Arc<dyn Runtime>,
        ConversationManagerConfig { max_conversations, ..Default::default() },
    );

    let app = axum::Router::new().route("/ws", axum::routing::get(conduit_server::http::ws_handler)).with_state(manager);

    let listener = tokio::net::TcpListener::bind(&listen).await.with_context(|| format!("binding {listen}"))?;
    tracing::info!(%listen, "conduit server listening");
    axum::serve(listener, app).await.context("serving")?;
    Ok(())
}
