mod config;

use std::net::SocketAddr;
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

use snackngo_api::auth::{AppState, AppStateInner};
use snackngo_core::{OrderEngine, OrderStore};
use snackngo_extract::GeminiExtractor;
use snackngo_gateway::Dispatcher;
use snackngo_gateway::connection;

use crate::config::Settings;

#[derive(Clone)]
struct ServerState {
    engine: OrderEngine,
    dispatcher: Dispatcher,
    jwt_secret: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "snackngo=debug,tower_http=debug".into()),
        )
        .init();

    let settings = Settings::from_env()?;
    if settings.gemini.api_key.is_empty() {
        warn!("GOOGLE_API_KEY is not set; every screenshot will need manual entry");
    }
    if settings.admin_key.is_none() {
        warn!("SNACKNGO_ADMIN_KEY is not set; operator routes are unreachable");
    }

    // Init database
    let db = Arc::new(snackngo_db::Database::open(&settings.db_path)?);

    // Shared state
    let dispatcher = Dispatcher::new(settings.engine.utc_offset);
    let engine = OrderEngine::new(
        OrderStore::new(db),
        Arc::new(GeminiExtractor::new(settings.gemini.clone())?),
        Arc::new(dispatcher.clone()),
        settings.engine.clone(),
    );

    engine.resume_reminders().await?;

    let app_state: AppState = Arc::new(AppStateInner {
        engine: engine.clone(),
        jwt_secret: settings.jwt_secret.clone(),
        admin_key: settings.admin_key.clone(),
    });

    let state = ServerState {
        engine: engine.clone(),
        dispatcher,
        jwt_secret: settings.jwt_secret.clone(),
    };

    // Routes
    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(state);

    let app = Router::new()
        .merge(snackngo_api::router(app_state))
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", settings.host, settings.port).parse()?;
    info!("Snack'n'Go server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.shutdown().await;
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn ws_upgrade(
    State(state): State<ServerState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, state.engine, state.dispatcher, state.jwt_secret)
    })
}
