use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    middleware,
    response::IntoResponse,
    routing::{delete, get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use beacon_api::auth::{self, AppState, AppStateInner};
use beacon_api::middleware::require_auth;
use beacon_api::{channels, drafts, messages, notifications, reactions};
use beacon_gateway::connection;
use beacon_gateway::dispatcher::Dispatcher;

#[derive(Clone)]
struct ServerState {
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
                .unwrap_or_else(|_| "beacon=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("BEACON_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("BEACON_DB_PATH").unwrap_or_else(|_| "beacon.db".into());
    let host = std::env::var("BEACON_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("BEACON_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;
    let sweep_secs: u64 = std::env::var("BEACON_SWEEP_SECS")
        .unwrap_or_else(|_| "60".into())
        .parse()?;

    // Init database
    let db = Arc::new(beacon_db::Database::open(&PathBuf::from(&db_path))?);

    // Shared state — the dispatcher owns the presence registry for the
    // lifetime of the process.
    let dispatcher = Dispatcher::new(db.clone());
    let app_state: AppState = Arc::new(AppStateInner {
        db: db.clone(),
        jwt_secret: jwt_secret.clone(),
        dispatcher: dispatcher.clone(),
    });

    // Scheduled promotion sweep on the shared runtime
    tokio::spawn(beacon_sweep::run(
        db.clone(),
        dispatcher.clone(),
        Duration::from_secs(sweep_secs),
    ));

    let state = ServerState {
        dispatcher: dispatcher.clone(),
        jwt_secret: jwt_secret.clone(),
    };

    // Routes
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .with_state(app_state.clone());

    let protected_routes = Router::new()
        .route("/messages/{user_id}", post(messages::send_direct_message))
        .route("/messages/{user_id}", get(messages::get_direct_messages))
        .route("/messages/{message_id}/forward", post(messages::forward_message))
        .route("/messages/{message_id}/reactions", post(reactions::toggle_reaction))
        .route("/conversations/{peer_id}/read", post(messages::mark_conversation_read))
        .route("/channels", post(channels::create_channel))
        .route("/channels/{channel_id}/join", post(channels::join_channel))
        .route("/channels/{channel_id}/messages", get(channels::get_channel_messages))
        .route("/channels/{channel_id}/messages", post(channels::send_channel_message))
        .route("/channels/{channel_id}/read", post(channels::mark_channel_read))
        .route("/notifications", get(notifications::list_notifications))
        .route("/notifications/{notification_id}/read", post(notifications::mark_notification_read))
        .route("/drafts", post(drafts::create_draft))
        .route("/drafts/scheduled", get(drafts::list_scheduled))
        .route("/drafts/{draft_id}", delete(drafts::delete_draft))
        .layer(middleware::from_fn(require_auth))
        .with_state(app_state);

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(state);

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Beacon server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn ws_upgrade(State(state): State<ServerState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, state.dispatcher, state.jwt_secret)
    })
}
