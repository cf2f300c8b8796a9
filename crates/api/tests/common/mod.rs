#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use jsonwebtoken::{encode, EncodingKey, Header};
use pitchey_core::types::DbId;
use pitchey_db::models::notification::DeliveryAttempt;
use pitchey_events::delivery::in_app::InAppSender;
use pitchey_events::rate_limit::MemoryRateLimitStore;
use pitchey_events::store::MemoryStore;
use pitchey_events::{Engine, EngineConfig, RealtimeFanout, SendJob, SenderRegistry};
use tokio::sync::mpsc;
use tower::ServiceExt;

use pitchey_api::auth::jwt::{Claims, JwtConfig};
use pitchey_api::config::ServerConfig;
use pitchey_api::router::build_app_router;
use pitchey_api::state::AppState;
use pitchey_api::ws::RoomRegistry;

pub const JWT_SECRET: &str = "test-jwt-secret";
pub const INTERNAL_TOKEN: &str = "test-internal-token";

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 30,
        database_url: None,
        db_max_connections: 1,
        redis_url: None,
        internal_token: INTERNAL_TOKEN.to_string(),
        jwt: JwtConfig {
            secret: JWT_SECRET.to_string(),
        },
    }
}

/// Engine settings with short timeouts so failure paths finish quickly.
pub fn test_engine_config() -> EngineConfig {
    EngineConfig {
        enqueue_timeout: Duration::from_millis(50),
        ..EngineConfig::default()
    }
}

/// Handles a test needs next to the router. No workers run: tests call
/// [`TestContext::drain`] to deliver queued jobs inline.
pub struct TestContext {
    pub engine: Engine,
    pub store: Arc<MemoryStore>,
    pub rooms: Arc<RoomRegistry>,
    pub rx: mpsc::Receiver<SendJob>,
}

impl TestContext {
    /// Deliver every queued send job.
    pub async fn drain(&mut self) -> Vec<DeliveryAttempt> {
        let mut delivered = Vec::new();
        while let Ok(job) = self.rx.try_recv() {
            if let Some(attempt) = self.engine.dispatcher.deliver(job).await.unwrap() {
                delivered.push(attempt);
            }
        }
        delivered
    }
}

/// Build the full application router over in-memory backends.
pub fn build_test_app() -> (Router, TestContext) {
    build_test_app_with(test_engine_config())
}

pub fn build_test_app_with(engine_config: EngineConfig) -> (Router, TestContext) {
    let config = test_config();
    let store = Arc::new(MemoryStore::new());
    let rooms = Arc::new(RoomRegistry::new());
    let senders = SenderRegistry::new().with(Arc::new(InAppSender));
    let fanout: Arc<dyn RealtimeFanout> = rooms.clone();

    let (engine, rx) = Engine::build(
        engine_config,
        store.clone(),
        Arc::new(MemoryRateLimitStore::new()),
        senders,
        fanout,
    );

    let state = AppState {
        config: Arc::new(config.clone()),
        engine: engine.clone(),
        rooms: Arc::clone(&rooms),
    };
    let app = build_app_router(state, &config);

    (
        app,
        TestContext {
            engine,
            store,
            rooms,
            rx,
        },
    )
}

/// Sign an access token for `user_id` with `role`.
pub fn token_for(user_id: DbId, role: &str) -> String {
    let now = chrono::Utc::now().timestamp();
    let claims = Claims {
        sub: user_id,
        role: role.to_string(),
        exp: now + 900,
        iat: now,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap()
}

/// Send a request with optional bearer token, extra header and JSON body.
pub async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    bearer: Option<&str>,
    header: Option<(&str, &str)>,
    body: Option<serde_json::Value>,
) -> Response<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = bearer {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    if let Some((name, value)) = header {
        builder = builder.header(name, value);
    }
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    app.clone().oneshot(builder.body(body).unwrap()).await.unwrap()
}

/// GET `uri` without credentials.
pub async fn get(app: &Router, uri: &str) -> Response<Body> {
    send(app, Method::GET, uri, None, None, None).await
}

/// GET `uri` as the bearer of `token`.
pub async fn get_as(app: &Router, uri: &str, token: &str) -> Response<Body> {
    send(app, Method::GET, uri, Some(token), None, None).await
}

/// PUT a JSON body as the bearer of `token`.
pub async fn put_json_as(
    app: &Router,
    uri: &str,
    token: &str,
    body: serde_json::Value,
) -> Response<Body> {
    send(app, Method::PUT, uri, Some(token), None, Some(body)).await
}

/// POST a JSON body to an internal endpoint with the shared token.
pub async fn post_internal(app: &Router, uri: &str, body: serde_json::Value) -> Response<Body> {
    send(
        app,
        Method::POST,
        uri,
        None,
        Some(("x-internal-token", INTERNAL_TOKEN)),
        Some(body),
    )
    .await
}

/// Collect a response body and parse it as JSON.
pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
