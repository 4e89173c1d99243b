use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use http_body_util::BodyExt;
use kiroxy::config::RuntimeConfig;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

const PROXY_KEY: &str = "test-proxy-key";

/// Scripted stand-in for the Kiro endpoints: counts calls, records bearer
/// tokens, and replays failure statuses before serving the framed body.
#[derive(Clone)]
struct MockUpstream {
    generate_calls: Arc<AtomicUsize>,
    refresh_calls: Arc<AtomicUsize>,
    bearer_tokens: Arc<Mutex<Vec<String>>>,
    status_script: Arc<Mutex<VecDeque<u16>>>,
    stream_body: Arc<Mutex<Vec<u8>>>,
    hold_open: Arc<AtomicBool>,
    client_gone: Arc<tokio::sync::Notify>,
    last_payload: Arc<Mutex<Option<Value>>>,
}

impl MockUpstream {
    fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            generate_calls: Arc::new(AtomicUsize::new(0)),
            refresh_calls: Arc::new(AtomicUsize::new(0)),
            bearer_tokens: Arc::new(Mutex::new(Vec::new())),
            status_script: Arc::new(Mutex::new(VecDeque::new())),
            stream_body: Arc::new(Mutex::new(body.into())),
            hold_open: Arc::new(AtomicBool::new(false)),
            client_gone: Arc::new(tokio::sync::Notify::new()),
            last_payload: Arc::new(Mutex::new(None)),
        }
    }

    fn with_status_script(self, statuses: &[u16]) -> Self {
        *self.status_script.lock().unwrap() = statuses.iter().copied().collect();
        self
    }

    fn holding_open(self) -> Self {
        self.hold_open.store(true, Ordering::SeqCst);
        self
    }
}

/// Wrap a JSON payload the way the upstream frames it: a few envelope bytes,
/// then the payload itself.
fn frame(payload: &Value) -> Vec<u8> {
    let mut out = vec![0x00, 0x00, 0x00, 0x52, 0x0b, 0x3a, 0x65];
    out.extend_from_slice(payload.to_string().as_bytes());
    out
}

fn frames(payloads: &[Value]) -> Vec<u8> {
    payloads.iter().flat_map(|p| frame(p)).collect()
}

async fn refresh_handler(State(mock): State<MockUpstream>) -> Json<Value> {
    mock.refresh_calls.fetch_add(1, Ordering::SeqCst);
    Json(json!({
        "accessToken": "at-refreshed",
        "refreshToken": "rt-rotated",
        "expiresIn": 3600,
    }))
}

async fn models_handler(State(mock): State<MockUpstream>, headers: HeaderMap) -> Json<Value> {
    record_bearer(&mock, &headers);
    Json(json!({
        "models": [
            { "modelId": "claude-sonnet-4.5" },
            { "modelId": "auto" },
        ]
    }))
}

async fn generate_handler(
    State(mock): State<MockUpstream>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    mock.generate_calls.fetch_add(1, Ordering::SeqCst);
    record_bearer(&mock, &headers);
    *mock.last_payload.lock().unwrap() = Some(payload);

    if let Some(status) = mock.status_script.lock().unwrap().pop_front() {
        let status = StatusCode::from_u16(status).expect("scripted status");
        return (status, "scripted failure").into_response();
    }

    if mock.hold_open.load(Ordering::SeqCst) {
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(4);
        let notify = mock.client_gone.clone();
        tokio::spawn(async move {
            let first = frame(&json!({ "content": "first" }));
            let _ = tx.send(Ok(Bytes::from(first))).await;
            // Body stays open until the gateway drops the connection.
            tx.closed().await;
            notify.notify_one();
        });
        let stream = tokio_stream::wrappers::ReceiverStream::new(rx);
        return Response::builder()
            .status(StatusCode::OK)
            .body(Body::from_stream(stream))
            .unwrap();
    }

    let body = mock.stream_body.lock().unwrap().clone();
    Response::builder()
        .status(StatusCode::OK)
        .body(Body::from(body))
        .unwrap()
}

fn record_bearer(mock: &MockUpstream, headers: &HeaderMap) {
    if let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        mock.bearer_tokens.lock().unwrap().push(value.to_string());
    }
}

async fn start_mock_upstream(mock: MockUpstream) -> SocketAddr {
    let router = Router::new()
        .route("/refreshToken", post(refresh_handler))
        .route("/ListAvailableModels", get(models_handler))
        .route("/generateAssistantResponse", post(generate_handler))
        .with_state(mock);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock upstream");
    let addr = listener.local_addr().expect("mock addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve mock upstream");
    });
    addr
}

struct TestContext {
    router: Router,
    state: kiroxy::app::AppState,
    upstream: MockUpstream,
    creds_path: PathBuf,
    _creds_dir: TempDir,
}

async fn setup(upstream: MockUpstream) -> TestContext {
    setup_with_expiry(upstream, "2099-01-01T00:00:00Z").await
}

async fn setup_with_expiry(upstream: MockUpstream, expires_at: &str) -> TestContext {
    let addr = start_mock_upstream(upstream.clone()).await;
    let creds_dir = tempfile::tempdir().expect("tempdir");
    let creds_path = creds_dir.path().join("credentials.json");
    std::fs::write(
        &creds_path,
        json!({
            "accessToken": "at-initial",
            "refreshToken": "rt-initial",
            "expiresAt": expires_at,
            "region": "us-east-1",
        })
        .to_string(),
    )
    .expect("write creds");

    let runtime = RuntimeConfig {
        listen: "127.0.0.1:0".to_string(),
        proxy_api_key: PROXY_KEY.to_string(),
        region: "us-east-1".to_string(),
        refresh_token: None,
        creds_file: Some(creds_path.clone()),
        profile_arn: None,
        refresh_threshold: Duration::from_secs(600),
        max_retries: 3,
        model_cache_ttl: Duration::from_secs(3600),
        auth_base: Some(format!("http://{addr}")),
        api_base: Some(format!("http://{addr}")),
    };
    let state = kiroxy::app::load_state_with_runtime(runtime)
        .await
        .expect("state");
    let router = kiroxy::app::build_app(state.clone());
    TestContext {
        router,
        state,
        upstream,
        creds_path,
        _creds_dir: creds_dir,
    }
}

async fn send(ctx: &TestContext, request: Request<Body>) -> Response {
    ctx.router.clone().oneshot(request).await.expect("response")
}

fn chat_request(body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(CONTENT_TYPE, "application/json")
        .header(AUTHORIZATION, format!("Bearer {PROXY_KEY}"))
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_string(response: Response) -> String {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes();
    String::from_utf8(bytes.to_vec()).expect("utf8 body")
}

async fn body_json(response: Response) -> Value {
    serde_json::from_str(&body_string(response).await).expect("json body")
}

/// Split an SSE body into its `data:` payloads.
fn sse_data(body: &str) -> Vec<String> {
    body.split("\n\n")
        .filter_map(|block| {
            block
                .lines()
                .find_map(|line| line.strip_prefix("data: "))
                .map(str::to_string)
        })
        .collect()
}

fn delta_of(chunk: &str) -> Value {
    let value: Value = serde_json::from_str(chunk).expect("chunk json");
    value["choices"][0]["delta"].clone()
}

fn finish_of(chunk: &str) -> Option<String> {
    let value: Value = serde_json::from_str(chunk).ok()?;
    value["choices"][0]["finish_reason"]
        .as_str()
        .map(str::to_string)
}

#[tokio::test]
async fn health_endpoints_need_no_auth() {
    let ctx = setup(MockUpstream::new(Vec::new())).await;
    for uri in ["/", "/health"] {
        let response = send(
            &ctx,
            Request::builder().uri(uri).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], json!("ok"));
    }
}

#[tokio::test]
async fn missing_or_wrong_proxy_key_is_rejected() {
    let ctx = setup(MockUpstream::new(Vec::new())).await;

    let response = send(
        &ctx,
        Request::builder()
            .uri("/v1/models")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = send(
        &ctx,
        Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, "Bearer wrong-key")
            .body(Body::from(
                json!({"model": "claude-sonnet-4-5", "messages": []}).to_string(),
            ))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert!(body["error"]["message"].is_string());
    assert_eq!(ctx.upstream.generate_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unknown_model_is_a_400() {
    let ctx = setup(MockUpstream::new(Vec::new())).await;
    let response = send(
        &ctx,
        chat_request(&json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}]})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], json!("unknown_model"));
    assert_eq!(ctx.upstream.generate_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn models_endpoint_merges_upstream_and_fallback() {
    let ctx = setup(MockUpstream::new(Vec::new())).await;
    let response = send(
        &ctx,
        Request::builder()
            .uri("/v1/models")
            .header(AUTHORIZATION, format!("Bearer {PROXY_KEY}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["object"], json!("list"));
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    // Discovered upstream names plus built-in names they do not cover.
    assert!(ids.contains(&"claude-sonnet-4.5"));
    assert!(ids.contains(&"auto"));
    assert!(ids.contains(&"claude-sonnet-4-5"));
    assert!(ids.contains(&"claude-opus-4-5"));
    for model in body["data"].as_array().unwrap() {
        assert_eq!(model["object"], json!("model"));
    }
}

#[tokio::test]
async fn basic_streaming_completion() {
    let body = frames(&[json!({"content": "Hello"}), json!({"content": " world"})]);
    let ctx = setup(MockUpstream::new(body)).await;

    let response = send(
        &ctx,
        chat_request(&json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "Hi"}],
            "stream": true,
        })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get(CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let body = body_string(response).await;
    let data = sse_data(&body);
    assert_eq!(data.last().map(String::as_str), Some("[DONE]"));

    assert_eq!(delta_of(&data[0])["content"], json!("Hello"));
    assert_eq!(delta_of(&data[0])["role"], json!("assistant"));
    assert_eq!(delta_of(&data[1])["content"], json!(" world"));

    let finishes: Vec<String> = data.iter().filter_map(|d| finish_of(d)).collect();
    assert_eq!(finishes, vec!["stop".to_string()]);

    // The upstream payload carried the converted conversation.
    let payload = ctx.upstream.last_payload.lock().unwrap().clone().unwrap();
    let current = &payload["conversationState"]["currentMessage"]["userInputMessage"];
    assert_eq!(current["content"], json!("Hi"));
    assert_eq!(current["modelId"], json!("CLAUDE_SONNET_4_5_20250929_V1_0"));
}

#[tokio::test]
async fn token_refresh_on_403() {
    let body = frames(&[json!({"content": "ok"})]);
    let ctx = setup(MockUpstream::new(body).with_status_script(&[403])).await;

    let response = send(
        &ctx,
        chat_request(&json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "Hi"}],
        })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let completion = body_json(response).await;
    assert_eq!(
        completion["choices"][0]["message"]["content"],
        json!("ok")
    );

    assert_eq!(ctx.upstream.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.upstream.generate_calls.load(Ordering::SeqCst), 2);
    let tokens = ctx.upstream.bearer_tokens.lock().unwrap().clone();
    assert_eq!(tokens[0], "Bearer at-initial");
    assert_eq!(tokens[1], "Bearer at-refreshed");

    // The refreshed credentials were rewritten in place.
    let saved: Value =
        serde_json::from_str(&std::fs::read_to_string(&ctx.creds_path).unwrap()).unwrap();
    assert_eq!(saved["accessToken"], json!("at-refreshed"));
    assert_eq!(saved["refreshToken"], json!("rt-rotated"));
}

#[tokio::test]
async fn second_403_fails_with_auth_unavailable() {
    let ctx = setup(MockUpstream::new(Vec::new()).with_status_script(&[403, 403])).await;
    let response = send(
        &ctx,
        chat_request(&json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "Hi"}],
        })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], json!("auth_unavailable"));
    assert_eq!(ctx.upstream.refresh_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rate_limit_backoff_then_success() {
    let body = frames(&[json!({"content": "recovered"})]);
    let ctx = setup(MockUpstream::new(body).with_status_script(&[429, 429])).await;

    let started = std::time::Instant::now();
    let response = send(
        &ctx,
        chat_request(&json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "Hi"}],
        })),
    )
    .await;
    let elapsed = started.elapsed();

    assert_eq!(response.status(), StatusCode::OK);
    let completion = body_json(response).await;
    assert_eq!(
        completion["choices"][0]["message"]["content"],
        json!("recovered")
    );
    assert_eq!(ctx.upstream.generate_calls.load(Ordering::SeqCst), 3);
    // 1 s + 2 s of backoff before the third attempt.
    assert!(elapsed >= Duration::from_secs(3), "elapsed {elapsed:?}");
}

#[tokio::test]
async fn retries_exhausted_is_a_502() {
    let ctx = setup(MockUpstream::new(Vec::new()).with_status_script(&[500, 500, 500])).await;
    let response = send(
        &ctx,
        chat_request(&json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "Hi"}],
        })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], json!("upstream_unavailable"));
    assert_eq!(ctx.upstream.generate_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn non_retryable_4xx_passes_the_status_through() {
    let ctx = setup(MockUpstream::new(Vec::new()).with_status_script(&[422])).await;
    let response = send(
        &ctx,
        chat_request(&json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "Hi"}],
        })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], json!("upstream_rejected"));
    assert_eq!(ctx.upstream.generate_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn bracketed_tool_call_streams_as_tool_call_deltas() {
    let body = frames(&[json!({
        "content": "I will check. [Called get_weather({\"city\":\"Paris\"})] Done."
    })]);
    let ctx = setup(MockUpstream::new(body)).await;

    let response = send(
        &ctx,
        chat_request(&json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "weather?"}],
            "stream": true,
            "tools": [{
                "type": "function",
                "function": {
                    "name": "get_weather",
                    "parameters": {"type": "object", "properties": {"city": {"type": "string"}}},
                },
            }],
        })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    let data = sse_data(&body);

    let mut texts = Vec::new();
    let mut tool_name = None;
    let mut tool_args = String::new();
    for chunk in &data {
        if chunk == "[DONE]" {
            continue;
        }
        let delta = delta_of(chunk);
        if let Some(text) = delta["content"].as_str() {
            texts.push(text.to_string());
        }
        if let Some(calls) = delta["tool_calls"].as_array() {
            if let Some(name) = calls[0]["function"]["name"].as_str() {
                tool_name = Some(name.to_string());
            }
            if let Some(args) = calls[0]["function"]["arguments"].as_str() {
                tool_args.push_str(args);
            }
        }
    }
    assert_eq!(texts, vec!["I will check. ".to_string(), " Done.".to_string()]);
    assert_eq!(tool_name.as_deref(), Some("get_weather"));
    assert_eq!(tool_args, "{\"city\":\"Paris\"}");

    let finishes: Vec<String> = data.iter().filter_map(|d| finish_of(d)).collect();
    assert_eq!(finishes, vec!["tool_calls".to_string()]);

    // Tool declarations were rewritten into the upstream schema.
    let payload = ctx.upstream.last_payload.lock().unwrap().clone().unwrap();
    let tools = &payload["conversationState"]["currentMessage"]["userInputMessage"]
        ["userInputMessageContext"]["tools"];
    assert_eq!(
        tools[0]["toolSpecification"]["name"],
        json!("get_weather")
    );
}

#[tokio::test]
async fn redelivered_fragments_are_emitted_once() {
    let hello = json!({"content": "Hello"});
    let body = frames(&[hello.clone(), hello.clone(), hello.clone()]);
    let ctx = setup(MockUpstream::new(body)).await;

    let response = send(
        &ctx,
        chat_request(&json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "Hi"}],
            "stream": true,
        })),
    )
    .await;
    let body = body_string(response).await;
    let hellos = sse_data(&body)
        .iter()
        .filter(|chunk| {
            chunk.as_str() != "[DONE]" && delta_of(chunk.as_str())["content"] == json!("Hello")
        })
        .count();
    assert_eq!(hellos, 1);
}

#[tokio::test]
async fn client_disconnect_closes_the_upstream_connection() {
    let ctx = setup(MockUpstream::new(Vec::new()).holding_open()).await;

    let response = send(
        &ctx,
        chat_request(&json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "Hi"}],
            "stream": true,
        })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    // Read the first frame, then hang up.
    let mut body = response.into_body();
    let first = body.frame().await.expect("first frame").expect("frame");
    assert!(first.data_ref().is_some());
    drop(body);

    tokio::time::timeout(Duration::from_secs(2), ctx.upstream.client_gone.notified())
        .await
        .expect("upstream connection should close after the client disconnects");
    assert_eq!(ctx.upstream.refresh_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn truncated_stream_ends_with_an_error_chunk() {
    let mut body = frames(&[json!({"content": "ok"})]);
    body.extend_from_slice(br#"{"content":"cut of"#);
    let ctx = setup(MockUpstream::new(body)).await;

    let response = send(
        &ctx,
        chat_request(&json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "Hi"}],
            "stream": true,
        })),
    )
    .await;
    let body = body_string(response).await;
    let data = sse_data(&body);
    assert_eq!(data.last().map(String::as_str), Some("[DONE]"));
    let finishes: Vec<String> = data.iter().filter_map(|d| finish_of(d)).collect();
    assert_eq!(finishes, vec!["error".to_string()]);
}

#[tokio::test]
async fn truncated_stream_is_a_502_when_not_streaming() {
    let ctx = setup(MockUpstream::new(br#"{"content":"cut of"#.to_vec())).await;
    let response = send(
        &ctx,
        chat_request(&json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "Hi"}],
        })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], json!("parse_error"));
}

#[tokio::test]
async fn aggregated_completion_carries_usage_and_credits() {
    let body = frames(&[
        json!({"content": "done"}),
        json!({"usage": {"inputTokens": 9, "outputTokens": 4, "credits": 0.5}}),
    ]);
    let ctx = setup(MockUpstream::new(body)).await;

    let response = send(
        &ctx,
        chat_request(&json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "Hi"}],
        })),
    )
    .await;
    let completion = body_json(response).await;
    assert_eq!(completion["object"], json!("chat.completion"));
    assert_eq!(completion["model"], json!("claude-sonnet-4-5"));
    assert_eq!(completion["usage"]["prompt_tokens"], json!(9));
    assert_eq!(completion["usage"]["completion_tokens"], json!(4));
    assert_eq!(completion["usage"]["credits_used"]["credits"], json!(0.5));
    assert_eq!(completion["choices"][0]["finish_reason"], json!("stop"));
}

#[tokio::test]
async fn empty_messages_still_reach_the_upstream() {
    let body = frames(&[json!({"content": "hm"})]);
    let ctx = setup(MockUpstream::new(body)).await;

    let response = send(
        &ctx,
        chat_request(&json!({"model": "claude-sonnet-4-5", "messages": []})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(ctx.upstream.generate_calls.load(Ordering::SeqCst), 1);
    let payload = ctx.upstream.last_payload.lock().unwrap().clone().unwrap();
    assert_eq!(
        payload["conversationState"]["currentMessage"]["userInputMessage"]["content"],
        json!("")
    );
    assert!(payload["conversationState"].get("history").is_none());
}

#[tokio::test]
async fn concurrent_token_requests_refresh_once() {
    let ctx = setup_with_expiry(MockUpstream::new(Vec::new()), "2000-01-01T00:00:00Z").await;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let auth = ctx.state.kiro.auth().clone();
        tasks.push(tokio::spawn(async move { auth.access_token().await }));
    }
    let mut tokens = Vec::new();
    for task in tasks {
        tokens.push(task.await.expect("join").expect("token"));
    }

    assert_eq!(ctx.upstream.refresh_calls.load(Ordering::SeqCst), 1);
    assert!(tokens.iter().all(|t| t == "at-refreshed"));
}
