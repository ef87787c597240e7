//! dm-agent
//!
//! Interactive dungeon master: connects to an MCP tool registry and an
//! OpenAI-compatible model runner, then answers questions in character,
//! calling tools when the question needs them.

mod config;
mod console;

use std::sync::Arc;

use anyhow::Context;
use dm_agent_core::{
    AgentBuilder, AgentError, LlmProvider, Session, SessionPrompts, ToolCatalog, ToolClient, run_session,
};
use dm_agent_runtime::{McpConfig, McpHttpClient, OpenAiCompatProvider, OpenAiConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::AppConfig;
use crate::console::ConsoleOperator;

#[tokio::main]
async fn main() {
    // Load environment
    dotenvy::dotenv().ok();

    // Logs go to stderr so they never interleave with the reply stream
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run().await {
        let message = match e.downcast_ref::<AgentError>() {
            Some(err @ AgentError::Config(_)) => err.user_message(),
            _ => format!("{e:#}"),
        };
        eprintln!("🔴 {message}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    let persona = config.load_persona()?;
    println!("{}", config.banner());

    // Tool registry
    let registry = Arc::new(McpHttpClient::new(
        McpConfig::new(&config.mcp_url).timeout_secs(config.request_timeout_secs),
    )?);
    let server = registry
        .initialize()
        .await
        .context("Failed to initialize MCP client")?;
    println!("Streamable HTTP client connected & initialized with server! {server}");

    let catalog = ToolCatalog::list(registry.as_ref())
        .await
        .context("Failed to list MCP tools")?;
    println!("Available Tools:");
    for tool in catalog.iter() {
        println!("🛠️ Tool: {}", tool.name);
        println!("  Description: {}", tool.description);
    }

    // Completion service
    let provider = Arc::new(OpenAiCompatProvider::from_config(OpenAiConfig {
        base_url: config.base_url.clone(),
        api_key: config.api_key.clone(),
        timeout_secs: config.request_timeout_secs,
    })?);

    // Verify model runner connection
    if matches!(provider.health_check().await, Ok(true)) {
        tracing::info!("✓ Connected to model runner at {}", provider.base_url());
        if let Ok(models) = provider.list_models().await {
            for model in [&config.tools_model, &config.chat_model] {
                if !models.iter().any(|m| m == model) {
                    tracing::warn!("⚠ Model {} not listed by the runner", model);
                }
            }
        }
    } else {
        tracing::warn!("⚠ Model runner not available at {}", provider.base_url());
    }

    let agent = AgentBuilder::new()
        .provider(provider)
        .tool_client(registry.clone())
        .catalog(catalog)
        .config(config.agent_config())
        .build()
        .await?;

    let mut session = Session::with_persona(&persona.character_sheet, &persona.instructions);
    let mut operator = ConsoleOperator::stdio();

    run_session(&agent, &mut session, &mut operator, &SessionPrompts::default()).await?;

    if let Err(e) = registry.close().await {
        tracing::warn!("Failed to close registry session: {}", e);
    }

    Ok(())
}
