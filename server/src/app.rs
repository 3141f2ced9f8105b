use std::sync::Arc;

use axum::{
    routing::{delete, get, patch, post},
    Router,
};
use tokio::signal;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    config::{self, Config},
    realtime::ws_handler,
    routes,
    store::{MemoryStore, PgStore, Store},
    types::AppState,
    webhook,
};

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/config", get(routes::get_config).post(routes::update_config))
        .route(
            "/webhook",
            get(webhook::verify_webhook).post(webhook::receive_webhook),
        )
        .route("/send-message", post(routes::send_message))
        .route("/test-webhook", post(webhook::test_webhook))
        .route("/test-socket", post(webhook::test_socket))
        .route("/api/contacts", get(routes::list_contacts))
        .route(
            "/api/contacts/{wa_id}",
            delete(routes::delete_contact),
        )
        .route("/api/chat-history/{wa_id}", get(routes::chat_history))
        .route("/api/flows", get(routes::list_flows).post(routes::create_flow))
        .route("/api/flows/suggestions", post(routes::suggest_flows))
        .route(
            "/api/flows/{flow_id}",
            get(routes::get_flow)
                .patch(routes::update_flow)
                .delete(routes::delete_flow),
        )
        .route(
            "/api/keywords",
            get(routes::list_keywords).post(routes::create_keyword),
        )
        .route(
            "/api/keywords/{keyword_id}",
            patch(routes::update_keyword).delete(routes::delete_keyword),
        )
        .route(
            "/api/broadcasts",
            get(routes::list_broadcasts).post(routes::create_broadcast),
        )
        .route("/api/broadcasts/send", post(routes::send_broadcast))
        .route(
            "/api/broadcasts/{broadcast_id}",
            get(routes::get_broadcast)
                .patch(routes::update_broadcast)
                .delete(routes::delete_broadcast),
        )
        .route(
            "/api/settings",
            get(routes::get_settings).post(routes::save_settings),
        )
        .route("/api/settings/test-whatsapp", post(routes::test_whatsapp))
        .route("/api/chat", post(routes::chat_preview))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(err) = result {
        eprintln!("tracing already initialised: {err}");
    }
}

async fn open_store(config: &Config) -> Arc<dyn Store> {
    match &config.database_url {
        Some(url) => Arc::new(
            PgStore::connect(url)
                .await
                .expect("failed to connect to postgres or run migrations"),
        ),
        None => {
            warn!("DATABASE_URL not set, keeping data in memory only");
            Arc::new(MemoryStore::new())
        }
    }
}

pub async fn run() {
    config::load_dotenv();
    init_tracing(config::json_logs_from_env());
    let config = Config::from_env();

    if !config.whatsapp.can_send() {
        warn!("WHATSAPP_TOKEN or PHONE_NUMBER_ID missing, replies will not be sent");
    }
    if config.openai.api_key.is_none() {
        info!("OPENAI_API_KEY not set, AI replies disabled");
    }

    let store = open_store(&config).await;
    let state = AppState::new(&config, store);
    let app = router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind TCP listener");

    info!(port = config.port, "webhook server listening");
    info!("webhook endpoint: http://localhost:{}/webhook", config.port);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server runtime failure");
    info!("server stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        info!("received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
        info!("received terminate signal, shutting down");
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
