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
use tracing::info;

use tether_relay::{
    ConnectionRegistry, DeviceTokenValidator, JwtDeviceValidator, LoggingNotifier, SessionRouter,
    connection,
};

#[derive(Clone)]
struct ServerState {
    registry: ConnectionRegistry,
    router: SessionRouter,
    validator: Arc<dyn DeviceTokenValidator>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("TETHER_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let host = std::env::var("TETHER_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("TETHER_PORT")
        .unwrap_or_else(|_| "3400".into())
        .parse()?;

    // Shared relay state
    let registry = ConnectionRegistry::new(Arc::new(LoggingNotifier));
    let state = ServerState {
        registry: registry.clone(),
        router: SessionRouter::new(registry),
        validator: Arc::new(JwtDeviceValidator::new(&jwt_secret)),
    };

    let app = Router::new()
        .route("/gateway", get(ws_upgrade))
        .route("/healthz", get(healthz))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Tether relay listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn ws_upgrade(State(state): State<ServerState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, state.registry, state.router, state.validator)
    })
}

async fn healthz() -> &'static str {
    "ok"
}
