//! `musterd` CLI entry point: parses arguments, loads configuration, wires
//! the aggregator core together, and runs it until shutdown.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use muster_aggregator::aggregator::AggregatorCore;
use muster_aggregator::auth_provider::{AuthMetrics, AuthToolProvider};
use muster_aggregator::config::AggregatorConfig;
use muster_aggregator::event_handler::EventHandler;
use muster_aggregator::manager::Manager;
use muster_aggregator::mcp_surface::AggregatorMcpSurface;
use muster_aggregator::oauth_handler::InMemoryOauthHandler;
use muster_aggregator::rate_limiter::RateLimiter;
use muster_aggregator::server_registry::ServerRegistry;
use muster_aggregator::session_connection::SessionConnector;
use muster_aggregator::session_registry::SessionRegistry;
use muster_aggregator::static_catalog::StaticCatalog;

#[derive(Parser)]
#[command(name = "musterd", version, about = "MCP aggregator: federates upstream MCP servers behind one endpoint")]
struct Cli {
    /// Path to an `aggregator.toml`/`.yaml` config file.
    #[arg(long, global = true, env = "MUSTER_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the aggregator and serve its MCP endpoint.
    Serve,
    /// Print a snapshot of `auth://status` for the default session.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = AggregatorConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Status => status(config).await,
    }
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("MUSTER_LOG_FORMAT").map(|v| v == "json").unwrap_or(false);

    let subscriber = fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

struct Runtime {
    core: Arc<AggregatorCore>,
    manager: Arc<Manager>,
    surface: Arc<AggregatorMcpSurface>,
}

fn build(config: AggregatorConfig) -> Runtime {
    let servers = Arc::new(ServerRegistry::new(config.global_prefix.clone(), config.yolo));
    let sessions = SessionRegistry::new(config.max_sessions, config.session_timeout);

    let surface = AggregatorMcpSurface::new();

    let oauth: Arc<dyn muster_aggregator::oauth::OauthHandler> =
        Arc::new(InMemoryOauthHandler::new(format!("{}/oauth/challenge", config.bind_address)));
    let connector = Arc::new(SessionConnector::new(Some(oauth.clone()), surface.clone()));

    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit_max_attempts, config.rate_limit_window));
    let auth = Arc::new(AuthToolProvider::new(
        servers.clone(),
        sessions.clone(),
        connector,
        Some(oauth),
        rate_limiter,
        Arc::new(AuthMetrics::new()),
    ));

    let core = AggregatorCore::new(servers.clone(), sessions, auth, surface.clone(), Vec::new(), config.yolo);
    surface.bind_core(&core);

    let catalog = Arc::new(StaticCatalog::new(config.servers.clone()));
    let events = EventHandler::new(servers, catalog.clone());

    let manager = Manager::new(config, core.clone(), events, catalog);

    Runtime { core, manager, surface }
}

async fn serve(config: AggregatorConfig) -> anyhow::Result<()> {
    let transport = config.transport;
    let bind_address = config.bind_address.clone();
    let Runtime { manager, surface, .. } = build(config);

    manager.start().await;

    use muster_aggregator::config::TransportKind;
    match transport {
        TransportKind::Stdio => {
            surface.clone().run_stdio().await;
        }
        TransportKind::Sse | TransportKind::Http => {
            let router = surface.router();
            let listener = tokio::net::TcpListener::bind(&bind_address).await?;
            tracing::info!(address = %bind_address, "musterd listening");

            tokio::select! {
                result = axum::serve(listener, router) => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "http server exited with error");
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutdown signal received");
                }
            }
        }
    }

    manager.stop().await;
    Ok(())
}

async fn status(config: AggregatorConfig) -> anyhow::Result<()> {
    let Runtime { core, manager, .. } = build(config);
    manager.start().await;

    let snapshot = core.auth.status_resource(muster_aggregator::session_registry::DEFAULT_SESSION_ID).await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    manager.stop().await;
    Ok(())
}
