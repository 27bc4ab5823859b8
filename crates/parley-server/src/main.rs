mod config;

use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use parley_api::{AppState, AppStateInner, chat_routes};
use parley_gateway::connection;
use parley_gateway::{ChatStore, PresenceTracker, RelayEngine};

use crate::config::ServerConfig;

#[derive(Clone)]
struct ServerState {
    engine: RelayEngine,
    jwt_secret: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let config = ServerConfig::from_env();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_filter.clone().into()),
        )
        .init();

    if config.is_dev_jwt_secret() {
        warn!("PARLEY_JWT_SECRET is unset; using the development secret");
    }

    // Init database
    let db = parley_db::Database::open(&config.db_path)?;
    let store: Arc<dyn ChatStore> = Arc::new(db);

    // Presence starts empty on every boot; clients re-join
    let engine = RelayEngine::new(store, PresenceTracker::new(), config.persist_timeout);

    let app_state: AppState = Arc::new(AppStateInner {
        engine: engine.clone(),
        jwt_secret: config.jwt_secret.clone(),
    });

    let state = ServerState {
        engine,
        jwt_secret: config.jwt_secret.clone(),
    };

    let ws_route = Router::new()
        .route("/relay", get(ws_upgrade))
        .with_state(state);

    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .merge(chat_routes(app_state))
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    info!("Parley server listening on {}", config.listen_addr);

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn ws_upgrade(
    State(state): State<ServerState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, state.engine, state.jwt_secret)
    })
}
