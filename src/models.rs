use crate::error::{AppError, AppResult};
use crate::upstream::KiroClient;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

/// Authoritative external name → upstream model id map. Resolution for
/// completions always goes through this table; names outside it are rejected.
const MODEL_MAP: &[(&str, &str)] = &[
    ("claude-opus-4-5", "claude-opus-4.5"),
    ("claude-opus-4-5-20251101", "claude-opus-4.5"),
    ("claude-haiku-4-5", "claude-haiku-4.5"),
    ("claude-sonnet-4-5", "CLAUDE_SONNET_4_5_20250929_V1_0"),
    ("claude-sonnet-4-5-20250929", "CLAUDE_SONNET_4_5_20250929_V1_0"),
    ("claude-sonnet-4", "CLAUDE_SONNET_4_20250514_V1_0"),
    ("claude-sonnet-4-20250514", "CLAUDE_SONNET_4_20250514_V1_0"),
    ("claude-3-7-sonnet-20250219", "CLAUDE_3_7_SONNET_20250219_V1_0"),
];

pub fn internal_id(external: &str) -> Option<&'static str> {
    MODEL_MAP
        .iter()
        .find(|(name, _)| *name == external)
        .map(|(_, id)| *id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelOrigin {
    Upstream,
    Fallback,
}

#[derive(Debug, Clone)]
pub struct ModelDescriptor {
    pub external_name: String,
    pub internal_id: String,
    pub origin: ModelOrigin,
}

struct Snapshot {
    descriptors: Vec<ModelDescriptor>,
    fetched_at: Instant,
}

/// Lazily populated, TTL'd view of the upstream model list merged with the
/// built-in table. Reads never wait for a fetch in flight: a stale snapshot
/// is served while one task repopulates behind the gate.
#[derive(Clone)]
pub struct ModelCatalog {
    inner: Arc<CatalogInner>,
}

struct CatalogInner {
    kiro: KiroClient,
    ttl: Duration,
    snapshot: RwLock<Option<Snapshot>>,
    refresh_gate: Mutex<()>,
}

impl ModelCatalog {
    pub fn new(kiro: KiroClient, ttl: Duration) -> Self {
        Self {
            inner: Arc::new(CatalogInner {
                kiro,
                ttl,
                snapshot: RwLock::new(None),
                refresh_gate: Mutex::new(()),
            }),
        }
    }

    /// Map an external model name to the upstream id.
    pub fn resolve(&self, external: &str) -> AppResult<String> {
        internal_id(external)
            .map(str::to_string)
            .ok_or_else(|| AppError::unknown_model(external))
    }

    pub async fn descriptors(&self) -> Vec<ModelDescriptor> {
        if let Some(fresh) = self.read_snapshot(true).await {
            return fresh;
        }
        match self.inner.refresh_gate.try_lock() {
            Ok(_guard) => self.repopulate().await,
            Err(_) => {
                // Another task is already fetching; prefer whatever snapshot
                // exists over blocking behind it.
                if let Some(stale) = self.read_snapshot(false).await {
                    return stale;
                }
                let _guard = self.inner.refresh_gate.lock().await;
                if let Some(fresh) = self.read_snapshot(true).await {
                    return fresh;
                }
                self.repopulate().await
            }
        }
    }

    async fn read_snapshot(&self, require_fresh: bool) -> Option<Vec<ModelDescriptor>> {
        let guard = self.inner.snapshot.read().await;
        let snapshot = guard.as_ref()?;
        if require_fresh && snapshot.fetched_at.elapsed() >= self.inner.ttl {
            return None;
        }
        Some(snapshot.descriptors.clone())
    }

    async fn repopulate(&self) -> Vec<ModelDescriptor> {
        let descriptors = match self.inner.kiro.list_models().await {
            Ok(models) => merge_with_fallback(&models),
            Err(err) => {
                tracing::warn!("model listing failed, using fallback table: {}", err.message);
                fallback_descriptors()
            }
        };
        let mut guard = self.inner.snapshot.write().await;
        *guard = Some(Snapshot {
            descriptors: descriptors.clone(),
            fetched_at: Instant::now(),
        });
        descriptors
    }
}

fn fallback_descriptors() -> Vec<ModelDescriptor> {
    MODEL_MAP
        .iter()
        .map(|(external, internal)| ModelDescriptor {
            external_name: external.to_string(),
            internal_id: internal.to_string(),
            origin: ModelOrigin::Fallback,
        })
        .collect()
}

fn merge_with_fallback(upstream: &[Value]) -> Vec<ModelDescriptor> {
    let mut descriptors: Vec<ModelDescriptor> = upstream
        .iter()
        .filter_map(|model| model.get("modelId").and_then(|v| v.as_str()))
        .map(|model_id| ModelDescriptor {
            external_name: model_id.to_string(),
            internal_id: internal_id(model_id).unwrap_or(model_id).to_string(),
            origin: ModelOrigin::Upstream,
        })
        .collect();
    for fallback in fallback_descriptors() {
        if !descriptors
            .iter()
            .any(|d| d.external_name == fallback.external_name)
        {
            descriptors.push(fallback);
        }
    }
    descriptors
}
