use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_REFRESH_THRESHOLD_SECS: u64 = 600;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_MODEL_CACHE_TTL_SECS: u64 = 3600;

/// Immutable runtime configuration, resolved from the environment at startup
/// and shared behind an `Arc` for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub proxy_api_key: String,
    pub region: String,
    pub refresh_token: Option<String>,
    pub creds_file: Option<PathBuf>,
    pub profile_arn: Option<String>,
    pub refresh_threshold: Duration,
    pub max_retries: u32,
    pub model_cache_ttl: Duration,
    /// Override for the auth host, used by tests to point at a local server.
    pub auth_base: Option<String>,
    /// Override for the API hosts, used by tests to point at a local server.
    pub api_base: Option<String>,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let listen = env_string("KIRO_LISTEN").unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let proxy_api_key = env_string("PROXY_API_KEY").unwrap_or_default();
        let region = env_string("KIRO_REGION").unwrap_or_else(|| DEFAULT_REGION.to_string());
        let refresh_token = env_string("REFRESH_TOKEN");
        let creds_file = env_string("KIRO_CREDS_FILE").map(PathBuf::from);
        let profile_arn = env_string("PROFILE_ARN");
        let refresh_threshold = Duration::from_secs(
            env_parsed("TOKEN_REFRESH_THRESHOLD").unwrap_or(DEFAULT_REFRESH_THRESHOLD_SECS),
        );
        let max_retries = env_parsed("MAX_RETRIES").unwrap_or(DEFAULT_MAX_RETRIES).max(1);
        let model_cache_ttl = Duration::from_secs(
            env_parsed("MODEL_CACHE_TTL").unwrap_or(DEFAULT_MODEL_CACHE_TTL_SECS),
        );
        Self {
            listen,
            proxy_api_key,
            region,
            refresh_token,
            creds_file,
            profile_arn,
            refresh_threshold,
            max_retries,
            model_cache_ttl,
            auth_base: env_string("KIRO_AUTH_BASE"),
            api_base: env_string("KIRO_API_BASE"),
        }
    }

    pub fn refresh_url(&self) -> String {
        match &self.auth_base {
            Some(base) => format!("{}/refreshToken", base.trim_end_matches('/')),
            None => format!("https://prod.{}.auth.desktop.kiro.dev/refreshToken", self.region),
        }
    }

    pub fn generate_url(&self) -> String {
        match &self.api_base {
            Some(base) => format!(
                "{}/generateAssistantResponse",
                base.trim_end_matches('/')
            ),
            None => format!(
                "https://codewhisperer.{}.amazonaws.com/generateAssistantResponse",
                self.region
            ),
        }
    }

    pub fn models_url(&self) -> String {
        match &self.api_base {
            Some(base) => format!("{}/ListAvailableModels", base.trim_end_matches('/')),
            None => format!("https://q.{}.amazonaws.com/ListAvailableModels", self.region),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse::<T>().ok())
}
