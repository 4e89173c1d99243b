use crate::config::RuntimeConfig;
use crate::credentials::{self, Credentials};
use crate::error::{AppError, AppResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

const REFRESH_TIMEOUT: Duration = Duration::from_secs(30);
/// Window in which a forced refresh reuses the previous refresh result
/// instead of hitting the endpoint again. Keeps a burst of 403s from
/// different request tasks down to a single refresh call.
const FORCED_REFRESH_REUSE: Duration = Duration::from_secs(5);
/// Safety margin applied when the upstream only reports `expiresIn` seconds.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// Owns the process-wide credential set: hands out a valid access token,
/// refreshes it ahead of expiry, and serializes concurrent refreshes so the
/// refresh endpoint sees at most one call per staleness episode.
#[derive(Clone)]
pub struct AuthManager {
    inner: Arc<AuthInner>,
}

struct AuthInner {
    http: reqwest::Client,
    refresh_url: String,
    threshold: Duration,
    creds_file: Option<PathBuf>,
    fingerprint: String,
    creds: RwLock<Credentials>,
    // Refresh gate: held for the duration of a refresh, remembers when the
    // last refresh completed. Waiters that queued up behind an in-flight
    // refresh observe its result instead of issuing their own.
    refresh_gate: Mutex<Option<Instant>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_at: Option<String>,
    expires_in: Option<i64>,
    profile_arn: Option<String>,
}

impl AuthManager {
    pub fn new(http: reqwest::Client, config: &RuntimeConfig, creds: Credentials) -> Self {
        Self {
            inner: Arc::new(AuthInner {
                http,
                refresh_url: config.refresh_url(),
                threshold: config.refresh_threshold,
                creds_file: config.creds_file.clone(),
                fingerprint: machine_fingerprint(),
                creds: RwLock::new(creds),
                refresh_gate: Mutex::new(None),
            }),
        }
    }

    /// Stable opaque identifier embedded in the upstream user-agent headers.
    pub fn fingerprint(&self) -> &str {
        &self.inner.fingerprint
    }

    pub async fn profile_arn(&self) -> Option<String> {
        self.inner.creds.read().await.profile_arn.clone()
    }

    /// Current access token, refreshing first if it is stale. The cache-hit
    /// path takes only the read lock, never the refresh gate.
    pub async fn access_token(&self) -> AppResult<String> {
        {
            let creds = self.inner.creds.read().await;
            if creds.is_fresh(self.inner.threshold) {
                return Ok(creds.access_token.clone());
            }
        }
        self.refresh_serialized(false).await
    }

    /// Unconditional refresh, used after the upstream rejected a token with
    /// 403 regardless of what the expiry claimed.
    pub async fn force_refresh(&self) -> AppResult<String> {
        self.refresh_serialized(true).await
    }

    async fn refresh_serialized(&self, forced: bool) -> AppResult<String> {
        let mut last_refresh = self.inner.refresh_gate.lock().await;
        // Re-check after acquiring the gate: another task may have finished a
        // refresh while this one waited.
        {
            let creds = self.inner.creds.read().await;
            let refreshed_just_now = last_refresh
                .map(|at| at.elapsed() < FORCED_REFRESH_REUSE)
                .unwrap_or(false);
            let usable = if forced {
                refreshed_just_now && !creds.access_token.is_empty()
            } else {
                creds.is_fresh(self.inner.threshold)
            };
            if usable {
                return Ok(creds.access_token.clone());
            }
        }

        let refresh_token = self.inner.creds.read().await.refresh_token.clone();
        let refreshed = self.request_refresh(&refresh_token).await?;
        *last_refresh = Some(Instant::now());

        let mut creds = self.inner.creds.write().await;
        creds.access_token = refreshed.access_token;
        if let Some(token) = refreshed.refresh_token {
            creds.refresh_token = token;
        }
        creds.expires_at = refreshed.expires_at;
        if let Some(arn) = refreshed.profile_arn {
            creds.profile_arn = Some(arn);
        }
        if let Some(path) = &self.inner.creds_file {
            if let Err(err) = credentials::save_atomic(path, &creds) {
                tracing::warn!("failed to persist refreshed credentials: {err}");
            }
        }
        tracing::debug!(expires_at = ?creds.expires_at, "access token refreshed");
        Ok(creds.access_token.clone())
    }

    async fn request_refresh(&self, refresh_token: &str) -> AppResult<RefreshedCredentials> {
        let response = self
            .inner
            .http
            .post(&self.inner.refresh_url)
            .timeout(REFRESH_TIMEOUT)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(|err| AppError::auth_unavailable(format!("token refresh failed: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::auth_unavailable(format!(
                "token refresh failed: {status}: {body}"
            )));
        }
        let payload: RefreshResponse = response
            .json()
            .await
            .map_err(|err| AppError::auth_unavailable(format!("token refresh failed: {err}")))?;
        let access_token = payload
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                AppError::auth_unavailable("token refresh response missing accessToken")
            })?;
        Ok(RefreshedCredentials {
            access_token,
            refresh_token: payload.refresh_token,
            expires_at: parse_expiry(payload.expires_at.as_deref(), payload.expires_in),
            profile_arn: payload.profile_arn,
        })
    }
}

struct RefreshedCredentials {
    access_token: String,
    refresh_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    profile_arn: Option<String>,
}

fn parse_expiry(expires_at: Option<&str>, expires_in: Option<i64>) -> Option<DateTime<Utc>> {
    if let Some(raw) = expires_at {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Some(parsed.with_timezone(&Utc));
        }
    }
    expires_in.map(|secs| Utc::now() + chrono::Duration::seconds(secs - EXPIRY_MARGIN_SECS))
}

fn machine_fingerprint() -> String {
    let hostname = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown-host".to_string());
    let username = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown-user".to_string());
    let mut hasher = Sha256::new();
    hasher.update(format!("{hostname}-{username}-kiroxy").as_bytes());
    format!("{:x}", hasher.finalize())
}
