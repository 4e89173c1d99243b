use crate::config::RuntimeConfig;
use crate::error::{AppError, AppResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// The single upstream credential set owned by this process.
///
/// `access_token` may be empty right after startup when only a refresh token
/// was provided; the first request then triggers a refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    #[serde(default)]
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_arn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

impl Credentials {
    /// A token is stale once the refresh threshold reaches into its expiry
    /// window. Without a known expiry it is trusted until the upstream says
    /// otherwise with a 403.
    pub fn is_fresh(&self, threshold: std::time::Duration) -> bool {
        if self.access_token.is_empty() {
            return false;
        }
        match self.expires_at {
            Some(expires_at) => {
                let threshold = chrono::Duration::from_std(threshold)
                    .unwrap_or_else(|_| chrono::Duration::seconds(0));
                Utc::now() + threshold < expires_at
            }
            None => true,
        }
    }
}

/// Load credentials from the configured file, falling back to the
/// environment-provided refresh token.
pub fn load(config: &RuntimeConfig) -> AppResult<Credentials> {
    if let Some(path) = &config.creds_file {
        if path.exists() {
            return read_file(path);
        }
    }
    let refresh_token = config.refresh_token.clone().ok_or_else(|| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "credentials_missing",
            "set REFRESH_TOKEN or point KIRO_CREDS_FILE at a credentials file",
        )
    })?;
    Ok(Credentials {
        access_token: String::new(),
        refresh_token,
        expires_at: None,
        profile_arn: config.profile_arn.clone(),
        region: Some(config.region.clone()),
    })
}

fn read_file(path: &Path) -> AppResult<Credentials> {
    let content = std::fs::read_to_string(path).map_err(|err| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "credentials_unreadable",
            format!("{}: {err}", path.display()),
        )
    })?;
    serde_json::from_str(&content).map_err(|err| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "credentials_invalid",
            format!("{}: {err}", path.display()),
        )
    })
}

/// Rewrite the credentials file atomically: write a sibling temp file, then
/// rename it over the target.
pub fn save_atomic(path: &Path, creds: &Credentials) -> std::io::Result<()> {
    let content = serde_json::to_string_pretty(creds)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)
}
