use crate::auth::CallerIdentity;
use crate::catalog::{Catalog, ModelEntry};
use crate::error::GatewayError;
use serde_json::{Map, Value};

/// Non-catalog providers reached through a dedicated streaming adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecializedProvider {
    Leagent,
    Moonshot,
    Qianfan,
}

impl SpecializedProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Leagent => "leagent",
            Self::Moonshot => "moonshot",
            Self::Qianfan => "qianfan",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProviderPrefix {
    pub prefix: &'static str,
    pub provider: SpecializedProvider,
}

/// Reserved model-id prefixes, matched case-insensitively in order.
pub const PROVIDER_PREFIXES: &[ProviderPrefix] = &[
    ProviderPrefix {
        prefix: "leagent",
        provider: SpecializedProvider::Leagent,
    },
    ProviderPrefix {
        prefix: "moonshot",
        provider: SpecializedProvider::Moonshot,
    },
    ProviderPrefix {
        prefix: "ernie",
        provider: SpecializedProvider::Qianfan,
    },
];

pub fn match_specialized(model_id: &str) -> Option<SpecializedProvider> {
    let lowered = model_id.to_lowercase();
    PROVIDER_PREFIXES
        .iter()
        .find(|entry| lowered.starts_with(entry.prefix))
        .map(|entry| entry.provider)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    Specialized(SpecializedProvider),
    Backend {
        index: usize,
        entry: Option<ModelEntry>,
    },
}

/// Decides who serves `model_id`.
///
/// Reserved prefixes win over everything. Otherwise an explicit backend
/// index is honoured as-is, and without one the catalog must know the model.
pub fn route(
    model_id: &str,
    catalog: &Catalog,
    explicit_index: Option<usize>,
) -> Result<Route, GatewayError> {
    if let Some(provider) = match_specialized(model_id) {
        return Ok(Route::Specialized(provider));
    }
    let entry = catalog.get(model_id).cloned();
    match (explicit_index, entry) {
        (Some(index), entry) => Ok(Route::Backend { index, entry }),
        (None, Some(entry)) => match entry.backend_index {
            Some(index) => Ok(Route::Backend {
                index,
                entry: Some(entry),
            }),
            None => Err(GatewayError::ModelNotFound(model_id.to_string())),
        },
        (None, None) => Err(GatewayError::ModelNotFound(model_id.to_string())),
    }
}

/// Adds the caller's identity to payloads bound for pipeline models.
pub fn attach_pipeline_identity(
    payload: &mut Map<String, Value>,
    entry: Option<&ModelEntry>,
    caller: &CallerIdentity,
) {
    if entry.is_some_and(|e| e.pipeline) {
        payload.insert("user".to_string(), caller.envelope());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn catalog() -> Catalog {
        Catalog::from_entries(vec![
            ModelEntry::from_backend_record(&json!({ "id": "llama3" }), 1).unwrap(),
            ModelEntry::from_backend_record(&json!({ "id": "flow", "pipeline": { "type": "filter" } }), 0)
                .unwrap(),
            ModelEntry::synthetic("orphan-model", 0),
        ])
    }

    fn caller() -> CallerIdentity {
        CallerIdentity {
            id: "u".into(),
            name: "N".into(),
            email: "e@x".into(),
            role: "admin".into(),
            location: None,
        }
    }

    #[test]
    fn prefixes_match_case_insensitively() {
        assert_eq!(
            match_specialized("Moonshot-v1-8k"),
            Some(SpecializedProvider::Moonshot)
        );
        assert_eq!(
            match_specialized("ERNIE-4.0-8K"),
            Some(SpecializedProvider::Qianfan)
        );
        assert_eq!(
            match_specialized("leagent-qa"),
            Some(SpecializedProvider::Leagent)
        );
        assert_eq!(match_specialized("gpt-4o"), None);
        assert_eq!(match_specialized("my-moonshot"), None);
    }

    #[test]
    fn specialized_prefix_bypasses_catalog() {
        let route = route("moonshot-v1-8k", &Catalog::default(), None).unwrap();
        assert_eq!(route, Route::Specialized(SpecializedProvider::Moonshot));
    }

    #[test]
    fn catalog_lookup_returns_backend_index() {
        match route("llama3", &catalog(), None).unwrap() {
            Route::Backend { index, entry } => {
                assert_eq!(index, 1);
                assert_eq!(entry.unwrap().id, "llama3");
            }
            other => panic!("unexpected route {other:?}"),
        }
    }

    #[test]
    fn unknown_model_is_not_found() {
        let err = route("nope", &catalog(), None).unwrap_err();
        assert!(matches!(err, GatewayError::ModelNotFound(ref m) if m == "nope"));
        let err = route("orphan-model", &catalog(), None).unwrap_err();
        assert!(matches!(err, GatewayError::ModelNotFound(_)));
    }

    #[test]
    fn explicit_index_overrides_catalog() {
        match route("llama3", &catalog(), Some(0)).unwrap() {
            Route::Backend { index, entry } => {
                assert_eq!(index, 0);
                assert!(entry.is_some());
            }
            other => panic!("unexpected route {other:?}"),
        }
        assert!(matches!(
            route("unlisted", &catalog(), Some(2)).unwrap(),
            Route::Backend { index: 2, entry: None }
        ));
    }

    #[test]
    fn pipeline_entries_receive_identity() {
        let catalog = catalog();
        let mut payload = Map::new();
        attach_pipeline_identity(&mut payload, catalog.get("llama3"), &caller());
        assert!(payload.get("user").is_none());

        attach_pipeline_identity(&mut payload, catalog.get("flow"), &caller());
        assert_eq!(payload["user"]["email"], "e@x");
        assert_eq!(payload["user"]["role"], "admin");
    }
}
