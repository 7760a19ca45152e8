//! # Voice Relay Backend - Main Application Entry Point
//!
//! Actix-web server that relays realtime speech sessions between browsers and
//! the vendor speech service, and arbitrates which component may run a voice
//! session at any moment.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: The entire application is asynchronous
//! - **Actors**: Each relay connection is an independent actix actor
//! - **Result<T, E>**: Error handling using Rust's Result type
//! - **Arc & RwLock**: Thread-safe shared state management
//!
//! ## Application Architecture:
//! - **config**: Layered configuration (defaults, config.toml, environment)
//! - **state**: Shared state, metrics and the voice session lock handle
//! - **voice_lock**: Process-wide voice session mutual exclusion
//! - **relay**: Frame codec, session state machine, vendor link, WebSocket actor
//! - **handlers**: REST handlers (config, voice session lock)
//! - **health**: Health and metrics endpoints
//! - **middleware**: Request logging and metrics collection
//! - **error**: HTTP error type and JSON error responses

mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod relay;
mod state;
mod voice_lock;

use actix_cors::Cors;
use actix_web::{middleware::from_fn, web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging** for debugging and monitoring
/// 3. **Creates shared application state** that all requests and relays share
/// 4. **Configures the HTTP server** with middleware and routes
/// 5. **Handles graceful shutdown** when receiving system signals
#[actix_web::main]
async fn main() -> Result<()> {
    // .ok() means "ignore errors" - it's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    info!(
        vendor_url = %config.vendor.url,
        max_sessions = config.relay.max_concurrent_sessions,
        "Relay configured"
    );
    if !config.vendor.has_credentials() {
        warn!("Vendor credentials are not configured; relay connections will be refused");
    }

    let app_state = AppState::new(config.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let server_state = app_state.clone();
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(server_state.clone()))
            // Middleware executes in reverse order for responses
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(from_fn(middleware::collect_metrics))
            .wrap(from_fn(middleware::request_logging))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/voice-session", web::get().to(handlers::get_voice_session))
                    .route(
                        "/voice-session/acquire",
                        web::post().to(handlers::acquire_voice_session),
                    )
                    .route(
                        "/voice-session/release",
                        web::post().to(handlers::release_voice_session),
                    )
                    .route(
                        "/voice-session/force-release",
                        web::post().to(handlers::force_release_voice_session),
                    ),
            )
            .route("/ws/realtime", web::get().to(relay::realtime_websocket))
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    // Whichever finishes first wins: the server (usually an error) or a signal
    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    if let Some(holder) = app_state.voice_lock.holder() {
        info!(session_id = %holder.session_id, owner = %holder.owner, "Voice session still held at shutdown");
    }
    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "voice_relay_backend=trace")
/// - If not set, defaults to "voice_relay_backend=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_relay_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
///
/// A signal handler that cannot be installed is logged and never fires, so
/// the server keeps running instead of exiting at startup.
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT"),
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
