use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use pitchey_events::rate_limit::{MemoryRateLimitStore, RedisRateLimitStore};
use pitchey_events::store::{MemoryStore, PgStore};
use pitchey_events::{
    EmailConfig, Engine, EngineConfig, NotificationStore, RateLimitStore, RealtimeFanout,
    SenderRegistry,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pitchey_api::background;
use pitchey_api::config::ServerConfig;
use pitchey_api::router::build_app_router;
use pitchey_api::state::AppState;
use pitchey_api::ws::{self, RoomRegistry};

#[tokio::main]
async fn main() {
    // Load .env file if present (ignored in production).
    dotenvy::dotenv().ok();

    // Initialise tracing (structured logging); JSON lines when LOG_FORMAT=json.
    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "pitchey_api=debug,pitchey_events=debug,tower_http=debug".into()
            }),
        )
        .with(json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json_logs).then(tracing_subscriber::fmt::layer))
        .init();

    // Load configuration.
    let config = ServerConfig::from_env();
    let engine_config = EngineConfig::from_env();
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");

    // Notification store: PostgreSQL when configured, in-memory otherwise.
    let store: Arc<dyn NotificationStore> = match &config.database_url {
        Some(url) => {
            let pool = pitchey_db::create_pool(url, config.db_max_connections)
                .await
                .expect("Failed to connect to database");
            tracing::info!("Database connection pool created");

            pitchey_db::health_check(&pool)
                .await
                .expect("Database health check failed");

            pitchey_db::run_migrations(&pool)
                .await
                .expect("Failed to run database migrations");
            tracing::info!("Database migrations applied");

            Arc::new(PgStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, notifications are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    // Rate limit counters: Redis when configured, in-process otherwise.
    let cancel = CancellationToken::new();
    let mut handles = Vec::new();
    let rate_store: Arc<dyn RateLimitStore> = match &config.redis_url {
        Some(url) => {
            let redis = RedisRateLimitStore::from_url(url).expect("Invalid REDIS_URL");
            if let Err(e) = redis.health_check().await {
                tracing::warn!(error = %e, "Redis unreachable at startup, rate limiting fails open");
            }
            Arc::new(redis)
        }
        None => {
            tracing::warn!("REDIS_URL not set, rate limit counters are per process");
            let memory: Arc<dyn RateLimitStore> = Arc::new(MemoryRateLimitStore::new());
            handles.push(tokio::spawn(background::rate_limit_reaper::run(
                Arc::clone(&memory),
                engine_config.reaper_interval,
                cancel.clone(),
            )));
            memory
        }
    };

    // Channel senders.
    let senders = SenderRegistry::from_config(&engine_config, EmailConfig::from_env());

    // WebSocket rooms and heartbeat.
    let rooms = Arc::new(RoomRegistry::new());
    let heartbeat_handle = ws::start_heartbeat(Arc::clone(&rooms));

    // Delivery engine: send workers, retry worker, digest scheduler.
    let fanout: Arc<dyn RealtimeFanout> = rooms.clone();
    let (engine, rx) = Engine::build(engine_config, store, rate_store, senders, fanout);
    handles.extend(engine.start(rx, cancel.clone()));
    tracing::info!("Notification engine started");

    let state = AppState {
        config: Arc::new(config.clone()),
        engine,
        rooms: Arc::clone(&rooms),
    };
    let app = build_app_router(state, &config);

    // Start server.
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    // Workers finish their in-flight sends; pending attempts are picked up
    // by the orphan sweep on the next start.
    cancel.cancel();
    let shutdown_timeout = Duration::from_secs(config.shutdown_timeout_secs);
    if tokio::time::timeout(shutdown_timeout, futures::future::join_all(handles))
        .await
        .is_err()
    {
        tracing::warn!("Background tasks did not stop within the shutdown timeout");
    }
    tracing::info!("Notification engine stopped");

    tracing::info!(
        count = rooms.connection_count(),
        "Closing remaining WebSocket connections"
    );
    rooms.close_all().await;

    heartbeat_handle.abort();
    tracing::info!("Graceful shutdown complete");
}

/// Wait for a shutdown signal (Ctrl-C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
