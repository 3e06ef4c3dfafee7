use crate::backends::{BackendRegistry, reconcile_keys};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ModelFilterConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub allowed_ids: Vec<String>,
}

/// Backend configuration as held by the config store.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct GatewayConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub base_urls: Vec<String>,
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default)]
    pub model_filter: ModelFilterConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_urls: vec![DEFAULT_OPENAI_BASE_URL.to_string()],
            api_keys: vec![String::new()],
            model_filter: ModelFilterConfig::default(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let enabled = env_bool("ENABLE_OPENAI_API").unwrap_or(defaults.enabled);
        let base_urls = env_list("OPENAI_API_BASE_URLS")
            .map(|urls| {
                urls.into_iter()
                    .map(|url| url.trim_end_matches('/').to_string())
                    .collect()
            })
            .unwrap_or(defaults.base_urls);
        let api_keys = env_list("OPENAI_API_KEYS").unwrap_or(defaults.api_keys);
        let model_filter = ModelFilterConfig {
            enabled: env_bool("ENABLE_MODEL_FILTER").unwrap_or(false),
            allowed_ids: env_list("MODEL_FILTER_LIST").unwrap_or_default(),
        };
        let mut config = Self {
            enabled,
            base_urls,
            api_keys,
            model_filter,
        };
        config.reconcile();
        config
    }

    /// Keeps the key list the same length as the URL list.
    pub fn reconcile(&mut self) {
        reconcile_keys(&mut self.api_keys, self.base_urls.len());
    }

    /// True when there is nothing to query: the API is switched off or the
    /// only configured key is blank.
    pub fn is_unconfigured(&self) -> bool {
        !self.enabled || (self.api_keys.len() == 1 && self.api_keys[0].is_empty())
    }
}

fn env_list(name: &str) -> Option<Vec<String>> {
    let raw = std::env::var(name).ok()?;
    Some(raw.split(';').map(|part| part.trim().to_string()).collect())
}

fn env_bool(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Shared handle to the gateway configuration.
///
/// Updates are whole-field replacements followed by key reconciliation, so
/// any reader sees consistent URL and key lists.
#[derive(Clone)]
pub struct ConfigStore {
    inner: Arc<RwLock<GatewayConfig>>,
}

impl ConfigStore {
    pub fn new(mut config: GatewayConfig) -> Self {
        config.reconcile();
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Every mutator reconciles, so readers never need the write lock.
    pub async fn snapshot(&self) -> GatewayConfig {
        self.inner.read().await.clone()
    }

    pub async fn registry(&self) -> BackendRegistry {
        BackendRegistry::from_config(&self.snapshot().await)
    }

    pub async fn set_enabled(&self, enabled: bool) {
        self.inner.write().await.enabled = enabled;
    }

    pub async fn set_base_urls(&self, urls: Vec<String>) {
        let mut guard = self.inner.write().await;
        guard.base_urls = urls;
        guard.reconcile();
    }

    pub async fn set_api_keys(&self, keys: Vec<String>) {
        let mut guard = self.inner.write().await;
        guard.api_keys = keys;
        guard.reconcile();
    }

    pub async fn set_model_filter(&self, filter: ModelFilterConfig) {
        self.inner.write().await.model_filter = filter;
    }
}
