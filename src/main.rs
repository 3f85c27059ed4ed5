mod config;
mod db;
mod frame;
mod routes;
mod services;
mod state;

use std::sync::Arc;

use services::store::{MemoryMessageStore, MessageStore, PgMessageStore};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt::init();

    let config = config::ServerConfig::from_env().expect("invalid configuration");

    // Postgres when configured; otherwise history lives only as long as the process.
    let store: Arc<dyn MessageStore> = match &config.database_url {
        Some(url) => {
            let pool = db::init_pool(url).await.expect("database init failed");
            Arc::new(PgMessageStore::open(pool).await.expect("message store init failed"))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; chat history is in-memory only");
            Arc::new(MemoryMessageStore::new())
        }
    };

    let state = state::AppState::new(store, config.chat);

    // Spawn background heartbeat sweeper.
    let _heartbeat = services::heartbeat::spawn_heartbeat_task(state.clone());

    let app = routes::app(state, &config);
    let port = config.port;
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "tunechat listening");
    axum::serve(listener, app).await.expect("server failed");
}
