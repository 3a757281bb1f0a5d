#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # agentd
//!
//! Coding-agent session backend.
//!
//! agentd drives an interactive coding-agent CLI on behalf of a web frontend:
//! it keeps one persistent agent process alive per output project, streams the
//! agent's terminal to browsers over WebSockets (with replay on reconnect),
//! learns the agent's own conversation id from its first output frame, and
//! resumes that conversation on later spawns.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    middleware,
    routing::{delete, get},
    Extension, Router,
};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use agentd::{auth::ApiKey, config::Config, routes, state::AppState, ws, ProjectStore, SessionRegistry};

/// Coding-agent session backend.
#[derive(Parser)]
#[command(name = "agentd", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => None,
    };
    run_server(config_path.as_deref()).await;
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    // Validate config before proceeding
    let validation_errors = config.validate();
    if !validation_errors.is_empty() {
        for err in &validation_errors {
            tracing::error!("Config error: {err}");
        }
        std::process::exit(1);
    }

    info!("agentd v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);
    info!("Agent binary: {}", config.agent.binary);

    if config.auth.api_key == "change-me" {
        warn!("Using default API key — set AGENTD_API_KEY or update config");
    }

    let store = match ProjectStore::new(&config.store.db_path).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!("Failed to open store at {}: {e}", config.store.db_path);
            std::process::exit(1);
        }
    };
    info!("Store ready at {}", store.db_path().display());

    let (events, _) = broadcast::channel(256);
    let registry = SessionRegistry::new(
        config.server.max_sessions,
        config.server.replay_buffer_bytes,
        Duration::from_secs(config.agent.close_grace_secs),
        events.clone(),
    );

    let state = AppState {
        config: Arc::new(config),
        start_time: Instant::now(),
        registry: registry.clone(),
        store,
        events,
    };

    // Build router
    let public_routes = Router::new().route("/api/health", get(routes::health::health));

    let authed_routes = Router::new()
        .route("/api/sessions", get(routes::sessions::list_sessions))
        .route(
            "/api/sessions/{id}",
            delete(routes::sessions::shutdown_session),
        )
        .layer(middleware::from_fn(agentd::auth::require_api_key));

    // Terminal endpoints authenticate via ?token= inside the handlers.
    let ws_routes = Router::new()
        .route(
            "/api/milestones/{milestone_id}/terminal",
            get(ws::milestone_terminal),
        )
        .route(
            "/api/output-projects/{output_project_id}/terminal",
            get(ws::project_terminal),
        );

    // Allowed headers are named individually: Firefox refuses credentialed
    // requests when the server answers with a wildcard header list.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
            axum::http::header::ACCEPT,
        ]);

    let app = Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .merge(ws_routes)
        .layer(Extension(ApiKey(state.config.auth.api_key.clone())))
        .with_state(state.clone())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(tower::limit::ConcurrencyLimitLayer::new(
            state.config.server.max_connections,
        ));

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    // Janitor: periodically evict sessions that are detached and idle past
    // the configured timeout. Attached sessions are never touched.
    let janitor_registry = registry.clone();
    let idle_timeout = Duration::from_secs(state.config.server.idle_timeout_secs);
    let sweep_interval = Duration::from_secs(state.config.server.sweep_interval_secs);
    let janitor_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        loop {
            interval.tick().await;
            let closed = janitor_registry.sweep(idle_timeout).await;
            if closed > 0 {
                info!("Janitor closed {closed} idle session(s)");
            }
        }
    });

    // Stop serving on the first of SIGINT or SIGTERM
    let shutdown = async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = signal(SignalKind::terminate()).expect("SIGTERM handler");
            let which = tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT",
                _ = term.recv() => "SIGTERM",
            };
            info!("{which} received, stopping");
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("SIGINT received, stopping");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    info!("Draining live sessions before exit");
    janitor_task.abort();
    registry.shutdown_all().await;
    info!("Shutdown complete");
}
