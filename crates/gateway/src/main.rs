mod catalog;
mod config;
mod error;
mod http;
mod native;
mod protocol;
mod router;
mod sessions;
mod upstream;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tracing::info;

use catalog::Catalog;
use config::GatewayConfig;
use native::NativeTools;
use router::Router as DispatchRouter;
use sessions::SessionsRegistry;
use upstream::UpstreamClient;

#[derive(Parser, Debug)]
#[command(name = "mcp-fed-gatewayd", about = "Federates tool catalogs across MCP upstreams")]
struct Cli {
    /// Path to the gateway's YAML configuration file.
    #[arg(long, env = "MCP_GATEWAY_CONFIG", default_value = "gateway.yaml")]
    config: PathBuf,

    /// Overrides the configured bind address.
    #[arg(long)]
    bind: Option<String>,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug,mcp_fed_gatewayd=trace" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    let mut config = GatewayConfig::load(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    let config = Arc::new(config);

    info!(
        upstreams = config.upstreams.len(),
        bind = %config.bind,
        "starting mcp federation gateway"
    );

    let http_client = reqwest::Client::builder()
        .danger_accept_invalid_certs(false)
        .build()
        .context("building shared http client")?;
    let client = UpstreamClient::new(http_client);

    let catalog = Arc::new(Catalog::new(config.clone()));
    let native = Arc::new(NativeTools::new());
    let sessions = Arc::new(SessionsRegistry::new());
    let router = Arc::new(DispatchRouter::new(catalog.clone(), client.clone(), native.clone()));

    // Eager refresh so the first client request never pays for a cold catalog.
    catalog.force_refresh(&client).await;

    let state = http::AppState {
        config: config.clone(),
        catalog,
        client,
        native,
        router,
        sessions,
    };

    let app = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    info!(addr = %config.bind, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received, draining in-flight requests");
}
