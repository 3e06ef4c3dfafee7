use crate::backends::BackendRegistry;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub const OWNED_BY: &str = "openai";

const MOONSHOT_MODELS: &[&str] = &["moonshot-v1-8k", "moonshot-v1-32k", "moonshot-v1-64k"];

const QIANFAN_MODELS: &[&str] = &[
    "ERNIE-4.0-8K",
    "ERNIE-4.0-8K-Preview",
    "ERNIE-4.0-8K-Preview-0518",
    "ERNIE-4.0-8K-Latest",
    "ERNIE-4.0-8K-0329",
    "ERNIE-4.0-8K-0613",
    "ERNIE-4.0-Turbo-8K",
    "ERNIE-4.0-Turbo-8K-Preview",
    "ERNIE-3.5-8K",
];

#[derive(Debug, Clone, PartialEq)]
pub struct ModelEntry {
    pub id: String,
    pub name: String,
    pub owned_by: String,
    /// `None` for synthetic entries served by a specialized provider.
    pub backend_index: Option<usize>,
    pub pipeline: bool,
    pub raw: Value,
}

impl ModelEntry {
    /// Tags one upstream model record with the backend it came from.
    pub fn from_backend_record(record: &Value, backend_index: usize) -> Option<Self> {
        let id = record.get("id")?.as_str()?.to_string();
        let name = record
            .get("name")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| id.clone());
        let pipeline = record.get("pipeline").is_some_and(is_truthy);
        Some(Self {
            id,
            name,
            owned_by: OWNED_BY.to_string(),
            backend_index: Some(backend_index),
            pipeline,
            raw: record.clone(),
        })
    }

    pub fn synthetic(id: &str, created: i64) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            owned_by: OWNED_BY.to_string(),
            backend_index: None,
            pipeline: false,
            raw: json!({
                "id": id,
                "object": "model",
                "created": created,
                "owned_by": "system",
            }),
        }
    }

    /// Listing shape: the provider record with gateway fields layered on top.
    pub fn to_listing_json(&self) -> Value {
        let mut out = match &self.raw {
            Value::Object(obj) => obj.clone(),
            _ => Map::new(),
        };
        out.insert("id".to_string(), Value::String(self.id.clone()));
        out.insert("name".to_string(), Value::String(self.name.clone()));
        out.insert("owned_by".to_string(), Value::String(self.owned_by.clone()));
        out.insert("openai".to_string(), self.raw.clone());
        if let Some(idx) = self.backend_index {
            out.insert("urlIdx".to_string(), json!(idx));
        }
        Value::Object(out)
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Immutable merged view of every backend's models, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: Vec<ModelEntry>,
    positions: HashMap<String, usize>,
}

impl Catalog {
    /// Later entries with an already-seen id replace the earlier one in place.
    pub fn from_entries(entries: impl IntoIterator<Item = ModelEntry>) -> Self {
        let mut catalog = Self::default();
        for entry in entries {
            match catalog.positions.get(&entry.id) {
                Some(&pos) => catalog.entries[pos] = entry,
                None => {
                    catalog
                        .positions
                        .insert(entry.id.clone(), catalog.entries.len());
                    catalog.entries.push(entry);
                }
            }
        }
        catalog
    }

    pub fn get(&self, id: &str) -> Option<&ModelEntry> {
        self.positions.get(id).map(|&pos| &self.entries[pos])
    }

    pub fn entries(&self) -> &[ModelEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_listing_json(&self) -> Value {
        let data: Vec<Value> = self.entries.iter().map(ModelEntry::to_listing_json).collect();
        json!({ "object": "list", "data": data })
    }
}

/// Process-wide catalog handle. Readers get a snapshot; refreshes swap in a
/// whole new catalog.
#[derive(Clone, Default)]
pub struct ModelCatalog {
    inner: Arc<RwLock<Arc<Catalog>>>,
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Arc<Catalog> {
        self.inner.read().await.clone()
    }

    pub async fn replace(&self, catalog: Arc<Catalog>) {
        *self.inner.write().await = catalog;
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

/// Pulls the model array out of one backend's `/models` reply.
///
/// Accepts both `{"data": [...]}` and a bare array; anything else, including
/// an error object, counts as no result.
pub fn extract_model_list(response: Option<Value>) -> Option<Vec<Value>> {
    match response? {
        Value::Object(mut obj) => match obj.remove("data") {
            Some(Value::Array(list)) => Some(list),
            _ => None,
        },
        Value::Array(list) => Some(list),
        _ => None,
    }
}

fn carries_error_marker(list: &[Value]) -> bool {
    list.iter().any(|item| item.as_str() == Some("error"))
}

/// Merges per-backend lists in backend order. `lists[i]` belongs to the
/// backend at index `i` of `registry`.
pub fn merge_model_lists(
    registry: &BackendRegistry,
    lists: Vec<Option<Vec<Value>>>,
) -> Vec<ModelEntry> {
    let mut merged = Vec::new();
    for (idx, list) in lists.into_iter().enumerate() {
        let Some(list) = list else {
            continue;
        };
        if carries_error_marker(&list) {
            continue;
        }
        let gpt_only = registry
            .resolve(idx)
            .map(|endpoint| endpoint.is_canonical_openai())
            .unwrap_or(false);
        merged.extend(
            list.iter()
                .filter_map(|record| ModelEntry::from_backend_record(record, idx))
                .filter(|entry| !gpt_only || entry.id.contains("gpt")),
        );
    }
    merged
}

/// Entries for specialized providers; they are never attached to a backend.
pub fn synthetic_entries(created: i64) -> Vec<ModelEntry> {
    MOONSHOT_MODELS
        .iter()
        .chain(QIANFAN_MODELS.iter())
        .map(|id| ModelEntry::synthetic(id, created))
        .collect()
}
