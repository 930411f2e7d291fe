//! Binary entry point: `gmod-bridge [CONFIG]` runs the bridge until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;

use gmod_bridge::agent_core::{ConversationStore, Correlator, SessionRegistry};
use gmod_bridge::bridge::BridgeServer;
use gmod_bridge::inference::{CompletionGateway, OpenAiClient};
use gmod_bridge::tools::ToolCatalog;
use gmod_bridge::{config, init_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let explicit = std::env::args_os().nth(1).map(PathBuf::from);
    let (config, loaded_from) =
        config::load(explicit.as_deref()).context("failed to load configuration")?;

    init_tracing(&config.logging).context("failed to initialize logging")?;

    let provider = config.provider.resolve()?;
    tracing::info!(
        config = ?loaded_from,
        provider = config.provider.kind.as_str(),
        base_url = %provider.base_url,
        model = %provider.model,
        stream = config.assistant.stream_responses,
        thinking_model = config.assistant.thinking_model,
        "configuration loaded"
    );

    let catalog = Arc::new(ToolCatalog::builtin().context("failed to load tool catalog")?);
    tracing::info!(tools = catalog.len(), "tool catalog loaded");

    let client = OpenAiClient::new(&provider.base_url, &provider.api_key)
        .context("failed to build provider client")?;
    if client.health_check().await {
        tracing::info!(base_url = %client.base_url(), "provider reachable");
    } else {
        tracing::warn!(base_url = %client.base_url(), "provider health check failed (non-fatal)");
    }

    let gateway = CompletionGateway::new(
        Arc::new(client),
        catalog.definitions(),
        config.request_options(provider.model),
        config.retry_policy(),
        config.reconstruct_options(),
    );

    let correlator = Correlator::new(
        gateway,
        catalog,
        ConversationStore::new(config.assistant.system_prompt.clone(), config.history_limits()),
        Arc::new(SessionRegistry::new()),
        config.correlator_settings(),
    );

    let server = BridgeServer::bind(&config.server.bind_addr(), correlator).await?;
    server
        .serve(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    tracing::info!("bridge stopped");
    Ok(())
}
