use crate::auth::AuthManager;
use crate::config::RuntimeConfig;
use crate::credentials;
use crate::error::{AppError, AppResult};
use crate::models::ModelCatalog;
use crate::upstream::KiroClient;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub kiro: KiroClient,
    pub catalog: ModelCatalog,
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

pub async fn load_state_with_runtime(mut runtime: RuntimeConfig) -> AppResult<AppState> {
    if runtime.proxy_api_key.is_empty() {
        return Err(AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "proxy_key_missing",
            "PROXY_API_KEY must be set",
        ));
    }

    let creds = credentials::load(&runtime)?;
    // A region stored with the credentials wins over the environment so the
    // endpoints and the token stay in the same partition.
    if let Some(region) = &creds.region {
        runtime.region = region.clone();
    }

    let http = reqwest::Client::builder()
        .user_agent("kiroxy/0.1")
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(|err| {
            AppError::new(
                axum::http::StatusCode::BAD_REQUEST,
                "http_client_init_failed",
                err.to_string(),
            )
        })?;

    let auth = AuthManager::new(http.clone(), &runtime, creds);
    let kiro = KiroClient::new(http, auth, &runtime);
    let catalog = ModelCatalog::new(kiro.clone(), runtime.model_cache_ttl);

    Ok(AppState {
        runtime: Arc::new(runtime),
        kiro,
        catalog,
    })
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(crate::handlers::health))
        .route("/health", get(crate::handlers::health))
        .route("/v1/models", get(crate::handlers::list_models))
        .route(
            "/v1/chat/completions",
            post(crate::handlers::chat_completions),
        )
        .with_state(state)
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}
