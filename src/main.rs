//! Persona Runtime - Main entry point.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use persona_runtime::{
    agent::{AgentDeps, AgentRuntime, Mode},
    character::{Character, PlatformKind, load_characters},
    cli::{Cli, Command, run_characters_command},
    config::{Config, characters_path_from_env},
    db,
    embeddings::{OpenAiEmbeddings, StoredEmbeddings},
    llm::OpenAiCompatGenerator,
    platform::ConsoleFactory,
};

/// Initialize tracing for simple CLI commands (warn level).
fn init_cli_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();
}

/// Initialize tracing for the long-running runtime (info level).
fn init_runtime_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("persona_runtime=info")),
        )
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Command::Characters) => {
            init_cli_tracing();
            run_characters_command(&characters_path(&cli)?)
        }
        Some(Command::Chat { agent }) => {
            init_runtime_tracing();
            let runtime = build_runtime(&cli).await?;
            run_agents(runtime, vec![agent.clone()], PlatformKind::Console, Vec::new()).await
        }
        Some(Command::Run {
            agent,
            platform,
            mode,
        }) => {
            init_runtime_tracing();
            let runtime = build_runtime(&cli).await?;
            run_agents(runtime, agent.clone(), *platform, mode.clone()).await
        }
        None => {
            init_runtime_tracing();
            let runtime = build_runtime(&cli).await?;
            run_agents(runtime, Vec::new(), PlatformKind::Console, Vec::new()).await
        }
    }
}

fn characters_path(cli: &Cli) -> anyhow::Result<PathBuf> {
    match &cli.characters {
        Some(path) => Ok(path.clone()),
        None => Ok(characters_path_from_env()?),
    }
}

/// Wire config, storage, generation, and embeddings into a runtime.
async fn build_runtime(cli: &Cli) -> anyhow::Result<AgentRuntime> {
    let mut config = match Config::from_env() {
        Ok(c) => c,
        Err(persona_runtime::error::ConfigError::MissingEnvVar(key)) => {
            eprintln!("Configuration error: Missing required environment variable '{key}'");
            eprintln!("  Set it in the environment or in a .env file.");
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    };
    if let Some(path) = &cli.characters {
        config.characters_path = path.clone();
    }

    tracing::info!("Starting persona runtime...");
    tracing::info!(model = %config.llm.default_model, base_url = %config.llm.base_url, "LLM provider");

    let characters = load_characters(&config.characters_path)?;
    let store = db::connect_from_config(&config.database).await?;
    let generator = Arc::new(OpenAiCompatGenerator::new(config.llm.clone())?);

    let mut deps = AgentDeps::new(Arc::clone(&store), generator, config.runtime.clone());
    if config.embeddings.enabled {
        let provider = Arc::new(OpenAiEmbeddings::new(config.embeddings.clone())?);
        tracing::info!(
            model = %config.embeddings.model,
            dimension = config.embeddings.dimension,
            "Embeddings enabled"
        );
        deps = deps.with_embeddings(Arc::new(StoredEmbeddings::new(provider, store)));
    } else {
        tracing::info!("Embeddings disabled, novelty checks accept every post");
    }

    Ok(AgentRuntime::new(characters, Arc::new(ConsoleFactory), deps))
}

/// Start the requested agents and modes, then run until Ctrl-C.
async fn run_agents(
    runtime: AgentRuntime,
    agents: Vec<String>,
    platform: PlatformKind,
    modes: Vec<Mode>,
) -> anyhow::Result<()> {
    let names = select_agents(runtime.characters(), &agents)?;

    for name in &names {
        if modes.is_empty() && platform == PlatformKind::Console {
            runtime.connect(name, platform).await?;
            tracing::info!(agent = %name, "Chat started. Type a message and press Enter (Ctrl+C to quit)");
            continue;
        }
        let modes = if modes.is_empty() {
            Mode::ALL.to_vec()
        } else {
            modes.clone()
        };
        for mode in modes {
            runtime.start(name, platform, mode).await?;
        }
    }

    tracing::info!(active = ?runtime.list_active().await, "Agents running");
    tokio::signal::ctrl_c().await?;

    for name in &names {
        let status = runtime.status(name, platform).await;
        for mode in status.modes.iter().filter(|m| m.active) {
            tracing::info!(
                agent = %name,
                mode = %mode.mode,
                next_run = mode.next_run.as_deref().unwrap_or(""),
                "Stopping"
            );
        }
    }
    runtime.shutdown().await;
    tracing::info!("Persona runtime shutdown complete");
    Ok(())
}

/// Resolve requested agent names; empty means every character.
fn select_agents(characters: &[Arc<Character>], requested: &[String]) -> anyhow::Result<Vec<String>> {
    if requested.is_empty() {
        return Ok(characters.iter().map(|c| c.username.clone()).collect());
    }
    requested
        .iter()
        .map(|name| {
            characters
                .iter()
                .find(|c| c.username.eq_ignore_ascii_case(name) || c.agent_name.eq_ignore_ascii_case(name))
                .map(|c| c.username.clone())
                .ok_or_else(|| anyhow::anyhow!("no character named '{name}'"))
        })
        .collect()
}
