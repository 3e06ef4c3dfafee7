use crate::adapters::AdapterSettings;
use crate::aggregator::{CatalogAggregator, DEFAULT_MODEL_LIST_TIMEOUT_MS};
use crate::auth::{IdentityProvider, TrustedHeaderIdentity};
use crate::catalog::{Catalog, ModelCatalog};
use crate::config::{ConfigStore, GatewayConfig};
use crate::error::{AppError, AppResult};
use crate::overrides::{ModelOverrideStore, StaticOverrideStore};
use crate::upstream::SessionTracker;
use axum::Router;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::path::PathBuf;
use std::sync::{Arc, Once, OnceLock};
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub http: reqwest::Client,
    pub metrics: PrometheusHandle,
    pub config: ConfigStore,
    pub catalog: ModelCatalog,
    pub aggregator: CatalogAggregator,
    pub identity: Arc<dyn IdentityProvider>,
    pub overrides: Arc<dyn ModelOverrideStore>,
    pub adapters: Arc<AdapterSettings>,
    pub sessions: SessionTracker,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub model_list_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub overrides_path: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            metrics_path: "/metrics".to_string(),
            model_list_timeout_ms: DEFAULT_MODEL_LIST_TIMEOUT_MS,
            request_timeout_ms: 30_000,
            overrides_path: None,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let listen = env_string("RELAYGATE_LISTEN").unwrap_or(defaults.listen);
        let metrics_path = env_string("RELAYGATE_METRICS_PATH").unwrap_or(defaults.metrics_path);
        let model_list_timeout_ms = env_string("RELAYGATE_MODEL_LIST_TIMEOUT_MS")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults.model_list_timeout_ms)
            .max(1);
        let request_timeout_ms = env_string("RELAYGATE_REQUEST_TIMEOUT_MS")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults.request_timeout_ms)
            .max(1);
        let overrides_path = env_string("RELAYGATE_MODEL_OVERRIDES").map(PathBuf::from);
        Self {
            listen,
            metrics_path,
            model_list_timeout_ms,
            request_timeout_ms,
            overrides_path,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with(
        RuntimeConfig::from_env(),
        GatewayConfig::from_env(),
        AdapterSettings::from_env(),
    )
    .await
}

pub async fn load_state_with(
    runtime: RuntimeConfig,
    gateway: GatewayConfig,
    adapters: AdapterSettings,
) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent("relaygate/0.1")
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|err| {
            AppError::new(
                axum::http::StatusCode::BAD_REQUEST,
                "http_client_init_failed",
                err.to_string(),
            )
        })?;

    let overrides = match &runtime.overrides_path {
        Some(path) => StaticOverrideStore::from_json_file(path).map_err(|err| {
            AppError::new(
                axum::http::StatusCode::BAD_REQUEST,
                "model_overrides_load_failed",
                err,
            )
        })?,
        None => StaticOverrideStore::default(),
    };
    tracing::info!(profiles = overrides.len(), "model override profiles loaded");

    let metrics = init_metrics()?;
    let config = ConfigStore::new(gateway);
    let catalog = ModelCatalog::new();
    let aggregator = CatalogAggregator::new(
        http.clone(),
        config.clone(),
        catalog.clone(),
        Duration::from_millis(runtime.model_list_timeout_ms),
    );

    Ok(AppState {
        runtime: Arc::new(runtime),
        http,
        metrics,
        config,
        catalog,
        aggregator,
        identity: Arc::new(TrustedHeaderIdentity),
        overrides: Arc::new(overrides),
        adapters: Arc::new(adapters),
        sessions: SessionTracker::new(),
    })
}

impl AppState {
    pub fn with_overrides(mut self, overrides: Arc<dyn ModelOverrideStore>) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_identity(mut self, identity: Arc<dyn IdentityProvider>) -> Self {
        self.identity = identity;
        self
    }

    /// Replaces the backend URL list and rebuilds the catalog against it.
    pub async fn replace_base_urls(&self, urls: Vec<String>) -> Arc<Catalog> {
        self.config.set_base_urls(urls).await;
        self.aggregator.refresh().await
    }
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    axum::http::StatusCode::BAD_REQUEST,
                    "metrics_init_failed",
                    err.to_string(),
                ));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "metrics_init_failed",
            "metrics recorder not available",
        )
    })
}

/// Builds the catalog on the first request, of any route, that finds it empty.
async fn ensure_catalog(State(state): State<AppState>, req: Request, next: Next) -> Response {
    state.aggregator.ensure_populated().await;
    next.run(req).await
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    let api_router = build_api_router();
    Router::<AppState>::new()
        .merge(api_router.clone())
        .nest("/api", api_router)
        .route(&metrics_path, get(crate::handlers::metrics))
        .fallback(crate::handlers::proxy_passthrough)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            ensure_catalog,
        ))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}

fn build_api_router() -> Router<AppState> {
    Router::new()
        .route("/models", get(crate::handlers::list_models))
        .route("/models/{url_idx}", get(crate::handlers::list_backend_models))
        .route(
            "/chat/completions",
            post(crate::handlers::create_chat_completions),
        )
        .route(
            "/chat/completions/{url_idx}",
            post(crate::handlers::create_chat_completions_at),
        )
}
