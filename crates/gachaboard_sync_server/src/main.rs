use axum::http::{Method, header};
use gachaboard_sync::engine::RecordEngineFactory;
use gachaboard_sync::storage::RoomStore;
use gachaboard_sync_server::{
    config::Config,
    handlers::{AppState, router},
    sync::RoomRegistry,
};
use std::sync::Arc;
use tokio::signal;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "gachaboard_sync_server=debug,gachaboard_sync=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting Gachaboard Sync Server v{}", env!("CARGO_PKG_VERSION"));
    info!("Rooms directory: {:?}", config.rooms_dir);
    info!("CORS origins: {:?}", config.cors_origins);
    info!(
        "Handshake timeout: {}s, idle timeout: {}",
        config.handshake_timeout_secs,
        match config.session_idle_timeout_secs {
            0 => "disabled".to_string(),
            secs => format!("{}s", secs),
        }
    );

    if let Err(e) = std::fs::create_dir_all(&config.rooms_dir) {
        error!("Failed to create rooms directory: {}", e);
        std::process::exit(1);
    }

    // Create shared state
    let store = RoomStore::new(config.rooms_dir.clone());
    let factory = Arc::new(RecordEngineFactory::new(config.engine_config()));
    let registry = RoomRegistry::new(store, factory);
    let state = AppState {
        registry: registry.clone(),
    };

    // Build CORS layer
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);
    let cors = if config.allows_any_origin() {
        cors.allow_origin(Any)
    } else {
        let origins: Vec<_> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        cors.allow_origin(AllowOrigin::list(origins))
    };

    // Build the router
    let app = router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // Create listener
    let addr = config.server_addr();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    info!("[sync] Listening on ws://{}/sync/:roomId", addr);

    // Run server with graceful shutdown
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", e);
    }

    registry.shutdown().await;
    info!("Server shut down gracefully");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
