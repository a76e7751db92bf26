//! HTTP server entrypoint.
use anyhow::{Context, Result};
use clap::Parser;
use ragstream::{api, config, logging, pipeline::RagService};
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(
    name = "ragstream",
    about = "Retrieval-augmented answer streaming over a managed knowledge base"
)]
struct Cli {
    /// Interface to bind (overrides `SERVER_HOST`).
    #[arg(long)]
    host: Option<String>,
    /// Port to bind (overrides `SERVER_PORT`).
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::init_config().context("failed to load configuration")?;
    let _log_guard =
        logging::init_tracing(&config.logging).context("failed to initialize logging")?;
    tracing::info!(
        knowledge_base_id = %config.knowledge_base_id,
        region = %config.aws_region,
        model_region = %config.model_region,
        model = %config.model_id,
        has_session_token = config.credentials.session_token.is_some(),
        "Loaded configuration"
    );

    let service = RagService::from_config(&config).context("failed to initialize services")?;
    let app = api::create_router(Arc::new(service));

    let host = cli.host.unwrap_or_else(|| config.server_host.clone());
    let port = cli.port.unwrap_or(config.server_port);
    let listener = TcpListener::bind((host.as_str(), port))
        .await
        .with_context(|| format!("failed to bind {host}:{port}"))?;
    tracing::info!("Listening on http://{}:{}", host, port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server terminated unexpectedly")?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
