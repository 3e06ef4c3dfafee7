use crate::backends::{BackendEndpoint, BackendRegistry};
use crate::catalog::{Catalog, ModelCatalog, extract_model_list, merge_model_lists, synthetic_entries};
use crate::config::ConfigStore;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_MODEL_LIST_TIMEOUT_MS: u64 = 5_000;

/// Builds the model catalog by querying every backend concurrently.
#[derive(Clone)]
pub struct CatalogAggregator {
    http: reqwest::Client,
    config: ConfigStore,
    catalog: ModelCatalog,
    timeout: Duration,
}

impl CatalogAggregator {
    pub fn new(
        http: reqwest::Client,
        config: ConfigStore,
        catalog: ModelCatalog,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            config,
            catalog,
            timeout,
        }
    }

    /// Rebuilds the catalog and swaps it in.
    ///
    /// A backend that fails, times out, or answers with something other than
    /// a model list only leaves a gap; the refresh itself never fails.
    pub async fn refresh(&self) -> Arc<Catalog> {
        metrics::counter!("relaygate_catalog_refresh_total").increment(1);
        let config = self.config.snapshot().await;
        if config.is_unconfigured() {
            tracing::debug!(enabled = config.enabled, "backend api not configured, catalog left empty");
            let empty = Arc::new(Catalog::default());
            self.catalog.replace(empty.clone()).await;
            return empty;
        }

        let registry = BackendRegistry::from_config(&config);
        let responses = futures_util::future::join_all(
            registry
                .iter()
                .map(|endpoint| fetch_model_list(&self.http, endpoint, self.timeout)),
        )
        .await;
        let lists = responses.into_iter().map(extract_model_list).collect();

        let mut entries = merge_model_lists(&registry, lists);
        entries.extend(synthetic_entries(chrono::Utc::now().timestamp()));
        let catalog = Arc::new(Catalog::from_entries(entries));
        tracing::debug!(
            backends = registry.count(),
            models = catalog.len(),
            "model catalog rebuilt"
        );
        self.catalog.replace(catalog.clone()).await;
        catalog
    }

    /// Refreshes only when no catalog has been built yet. Concurrent callers
    /// that all see an empty catalog each run their own refresh.
    pub async fn ensure_populated(&self) {
        if self.catalog.is_empty().await {
            self.refresh().await;
        }
    }
}

async fn fetch_model_list(
    client: &reqwest::Client,
    endpoint: &BackendEndpoint,
    timeout: Duration,
) -> Option<Value> {
    let url = endpoint.url_for("models");
    let result = async {
        client
            .get(&url)
            .bearer_auth(&endpoint.api_key)
            .timeout(timeout)
            .send()
            .await?
            .json::<Value>()
            .await
    }
    .await;
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            metrics::counter!("relaygate_backend_list_failures_total").increment(1);
            tracing::warn!(
                backend_index = endpoint.index,
                url = %url,
                timed_out = err.is_timeout(),
                "model list request failed: {err}"
            );
            None
        }
    }
}
