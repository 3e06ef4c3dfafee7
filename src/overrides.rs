use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

/// Per-model parameters maintained outside the gateway.
///
/// `params` stays loosely typed; the normalizer reads each field leniently.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ModelOverrideProfile {
    pub id: String,
    #[serde(default)]
    pub base_model_id: Option<String>,
    #[serde(default)]
    pub params: Value,
}

#[async_trait]
pub trait ModelOverrideStore: Send + Sync + 'static {
    async fn get(&self, model_id: &str) -> Option<ModelOverrideProfile>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticOverrideStore {
    profiles: HashMap<String, ModelOverrideProfile>,
}

impl StaticOverrideStore {
    pub fn new(profiles: impl IntoIterator<Item = ModelOverrideProfile>) -> Self {
        Self {
            profiles: profiles
                .into_iter()
                .map(|profile| (profile.id.clone(), profile))
                .collect(),
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| format!("read {}: {err}", path.display()))?;
        let profiles: Vec<ModelOverrideProfile> =
            serde_json::from_str(&raw).map_err(|err| format!("parse {}: {err}", path.display()))?;
        Ok(Self::new(profiles))
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[async_trait]
impl ModelOverrideStore for StaticOverrideStore {
    async fn get(&self, model_id: &str) -> Option<ModelOverrideProfile> {
        self.profiles.get(model_id).cloned()
    }
}
