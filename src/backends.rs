use crate::config::GatewayConfig;
use crate::error::GatewayError;

const CANONICAL_OPENAI_HOST: &str = "api.openai.com";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendEndpoint {
    pub index: usize,
    pub base_url: String,
    pub api_key: String,
}

impl BackendEndpoint {
    pub fn is_canonical_openai(&self) -> bool {
        is_canonical_openai_url(&self.base_url)
    }

    pub fn url_for(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

pub fn is_canonical_openai_url(url: &str) -> bool {
    url.contains(CANONICAL_OPENAI_HOST)
}

/// Truncates or pads `keys` with empty strings until it has `url_count` entries.
pub fn reconcile_keys(keys: &mut Vec<String>, url_count: usize) {
    if keys.len() > url_count {
        keys.truncate(url_count);
    } else if keys.len() < url_count {
        keys.resize(url_count, String::new());
    }
}

/// Ordered, indexed view over the configured backends.
#[derive(Debug, Clone, Default)]
pub struct BackendRegistry {
    endpoints: Vec<BackendEndpoint>,
}

impl BackendRegistry {
    pub fn from_config(config: &GatewayConfig) -> Self {
        let mut keys = config.api_keys.clone();
        reconcile_keys(&mut keys, config.base_urls.len());
        let endpoints = config
            .base_urls
            .iter()
            .zip(keys)
            .enumerate()
            .map(|(index, (base_url, api_key))| BackendEndpoint {
                index,
                base_url: base_url.clone(),
                api_key,
            })
            .collect();
        Self { endpoints }
    }

    pub fn count(&self) -> usize {
        self.endpoints.len()
    }

    pub fn resolve(&self, index: usize) -> Result<&BackendEndpoint, GatewayError> {
        self.endpoints
            .get(index)
            .ok_or(GatewayError::IndexOutOfRange {
                index,
                count: self.endpoints.len(),
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = &BackendEndpoint> {
        self.endpoints.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(urls: &[&str], keys: &[&str]) -> GatewayConfig {
        GatewayConfig {
            enabled: true,
            base_urls: urls.iter().map(|s| s.to_string()).collect(),
            api_keys: keys.iter().map(|s| s.to_string()).collect(),
            model_filter: Default::default(),
        }
    }

    #[test]
    fn reconcile_truncates_and_pads() {
        let mut keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        reconcile_keys(&mut keys, 2);
        assert_eq!(keys, vec!["a", "b"]);

        reconcile_keys(&mut keys, 4);
        assert_eq!(keys, vec!["a", "b", "", ""]);

        reconcile_keys(&mut keys, 0);
        assert!(keys.is_empty());
    }

    #[test]
    fn registry_pairs_urls_with_keys_by_position() {
        let registry = BackendRegistry::from_config(&config(
            &["https://api.openai.com/v1", "http://local:8000/v1"],
            &["sk-1"],
        ));
        assert_eq!(registry.count(), 2);
        let second = registry.resolve(1).unwrap();
        assert_eq!(second.base_url, "http://local:8000/v1");
        assert_eq!(second.api_key, "");
        assert!(registry.resolve(0).unwrap().is_canonical_openai());
        assert!(!second.is_canonical_openai());
    }

    #[test]
    fn resolve_rejects_out_of_range_index() {
        let registry = BackendRegistry::from_config(&config(&["http://a"], &["k"]));
        let err = registry.resolve(1).unwrap_err();
        assert!(matches!(
            err,
            GatewayError::IndexOutOfRange { index: 1, count: 1 }
        ));
    }

    #[test]
    fn url_for_joins_without_double_slashes() {
        let registry = BackendRegistry::from_config(&config(&["http://a/v1/"], &["k"]));
        assert_eq!(
            registry.resolve(0).unwrap().url_for("/chat/completions"),
            "http://a/v1/chat/completions"
        );
    }
}
