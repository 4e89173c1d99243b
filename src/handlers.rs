use crate::app::AppState;
use crate::convert::{self, ChatCompletionRequest};
use crate::error::{AppError, AppResult};
use crate::stream;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use axum::Json;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "kiroxy" }))
}

pub async fn list_models(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Response> {
    require_proxy_key(&headers, &state)?;
    let data: Vec<Value> = state
        .catalog
        .descriptors()
        .await
        .into_iter()
        .map(|descriptor| {
            json!({
                "id": descriptor.external_name,
                "object": "model",
                "created": 0,
                "owned_by": "kiro",
            })
        })
        .collect();
    Ok(Json(json!({ "object": "list", "data": data })).into_response())
}

pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> AppResult<Response> {
    require_proxy_key(&headers, &state)?;
    let req: ChatCompletionRequest = serde_json::from_value(body)
        .map_err(|err| AppError::invalid_request(err.to_string()))?;
    let model_id = state.catalog.resolve(&req.model)?;
    let profile_arn = state.kiro.auth().profile_arn().await;
    let payload = convert::build_payload(&req, &model_id, profile_arn.as_deref())?;

    tracing::debug!(model = %req.model, upstream_model = %model_id, stream = req.stream.unwrap_or(false), "forwarding completion");
    let upstream = state.kiro.generate(&payload).await?;

    if req.stream.unwrap_or(false) {
        let (tx, rx) = mpsc::channel::<String>(64);
        tokio::spawn(stream::stream_completion(upstream, req.model.clone(), tx));
        let events = tokio_stream::wrappers::ReceiverStream::new(rx)
            .map(|data| Ok::<_, std::convert::Infallible>(Event::default().data(data)));
        return Ok(Sse::new(events).into_response());
    }

    let value = stream::collect_completion(upstream, &req.model).await?;
    Ok(Json(value).into_response())
}

fn require_proxy_key(headers: &HeaderMap, state: &AppState) -> AppResult<()> {
    let auth_header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::unauthorized("missing auth"))?;
    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| AppError::unauthorized("invalid auth"))?;
    if token != state.runtime.proxy_api_key {
        return Err(AppError::unauthorized("invalid token"));
    }
    Ok(())
}
