use crate::auth::AuthManager;
use crate::config::RuntimeConfig;
use crate::error::{AppError, AppResult};
use axum::http::StatusCode;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;
use std::time::Duration;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(4);
const MODELS_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for the Kiro endpoints. Couples transport failures back into
/// the auth manager: a 403 forces one token refresh, 429/5xx/network errors
/// back off exponentially up to the configured attempt cap.
#[derive(Clone)]
pub struct KiroClient {
    http: reqwest::Client,
    auth: AuthManager,
    generate_url: String,
    models_url: String,
    max_retries: u32,
}

impl KiroClient {
    pub fn new(http: reqwest::Client, auth: AuthManager, config: &RuntimeConfig) -> Self {
        Self {
            http,
            auth,
            generate_url: config.generate_url(),
            models_url: config.models_url(),
            max_retries: config.max_retries,
        }
    }

    pub fn auth(&self) -> &AuthManager {
        &self.auth
    }

    /// Streaming POST to `generateAssistantResponse`. Returns as soon as the
    /// response status is known; the body has not been consumed. Retries only
    /// cover connection establishment — once this returns, stream failures
    /// propagate to the caller.
    pub async fn generate(&self, payload: &Value) -> AppResult<reqwest::Response> {
        let mut attempt: u32 = 1;
        loop {
            let token = self.auth.access_token().await?;
            let result = self
                .http
                .post(&self.generate_url)
                .headers(self.request_headers(&token))
                .json(payload)
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) if response.status() == StatusCode::FORBIDDEN => {
                    if attempt == 1 {
                        tracing::debug!("upstream returned 403, forcing token refresh");
                        self.auth.force_refresh().await?;
                        attempt += 1;
                        continue;
                    }
                    let body = response.text().await.unwrap_or_default();
                    return Err(AppError::auth_unavailable(format!(
                        "upstream rejected refreshed token: {body}"
                    )));
                }
                Ok(response) if is_retryable_status(response.status()) => {
                    tracing::debug!(status = %response.status(), attempt, "retryable upstream status");
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    return Err(AppError::upstream_rejected(
                        status,
                        format!("upstream status {status}: {body}"),
                    ));
                }
                Err(err) => {
                    tracing::debug!(error = %err, attempt, "upstream request failed");
                }
            }

            // 429, 5xx, timeout, or network error: bounded exponential backoff.
            if attempt >= self.max_retries {
                return Err(AppError::upstream_unavailable(format!(
                    "upstream unavailable after {attempt} attempts"
                )));
            }
            tokio::time::sleep(backoff_delay(attempt)).await;
            attempt += 1;
        }
    }

    /// GET `ListAvailableModels`. Failures here are soft: the model catalog
    /// falls back to its built-in table.
    pub async fn list_models(&self) -> AppResult<Vec<Value>> {
        let token = self.auth.access_token().await?;
        let mut params: Vec<(&str, String)> = vec![("origin", "AI_EDITOR".to_string())];
        if let Some(arn) = self.auth.profile_arn().await {
            params.push(("profileArn", arn));
        }
        let response = self
            .http
            .get(&self.models_url)
            .headers(self.request_headers(&token))
            .query(&params)
            .timeout(MODELS_TIMEOUT)
            .send()
            .await
            .map_err(|err| AppError::upstream_unavailable(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::upstream_unavailable(format!(
                "ListAvailableModels failed: {status}: {body}"
            )));
        }
        let payload: Value = response
            .json()
            .await
            .map_err(|err| AppError::upstream_unavailable(err.to_string()))?;
        Ok(payload
            .get("models")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default())
    }

    fn request_headers(&self, token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
            headers.insert(AUTHORIZATION, value);
        }
        let fingerprint = self.auth.fingerprint();
        let user_agent = format!(
            "aws-sdk-js/1.0.27 ua/2.1 os/other lang/js md/nodejs#22.21.1 \
             api/codewhispererstreaming#1.0.27 m/E KiroIDE-0.7.45-{fingerprint}"
        );
        if let Ok(value) = HeaderValue::from_str(&user_agent) {
            headers.insert("User-Agent", value);
        }
        if let Ok(value) = HeaderValue::from_str(&format!("aws-sdk-js/1.0.27 KiroIDE-0.7.45-{fingerprint}")) {
            headers.insert("x-amz-user-agent", value);
        }
        headers.insert(
            "x-amzn-codewhisperer-optout",
            HeaderValue::from_static("true"),
        );
        if let Ok(value) = HeaderValue::from_str(&uuid::Uuid::new_v4().to_string()) {
            headers.insert("amz-sdk-invocation-id", value);
        }
        headers.insert(
            "amz-sdk-request",
            HeaderValue::from_static("attempt=1; max=3"),
        );
        headers
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    (BACKOFF_BASE * 2u32.saturating_pow(exp)).min(BACKOFF_CAP)
}
