use crate::adapters;
use crate::app::AppState;
use crate::auth::CallerIdentity;
use crate::backends::is_canonical_openai_url;
use crate::error::{AppError, AppResult, GatewayError};
use crate::normalize::normalize;
use crate::router::{self, Route};
use crate::upstream::{self, ProxyOutcome, ProxyRequest};
use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde_json::{Map, Value};

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

/// Aggregated listing. Always rebuilds the catalog first.
pub async fn list_models(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Response> {
    let caller = authorize(&headers, &state).await?;
    let catalog = state.aggregator.refresh().await;
    let mut listing = catalog.to_listing_json();

    let config = state.config.snapshot().await;
    if config.model_filter.enabled && caller.is_least_privileged() {
        if let Some(data) = listing.get_mut("data").and_then(|v| v.as_array_mut()) {
            data.retain(|model| {
                model
                    .get("id")
                    .and_then(|id| id.as_str())
                    .is_some_and(|id| config.model_filter.allowed_ids.iter().any(|a| a == id))
            });
        }
    }
    Ok(Json(listing).into_response())
}

/// Lists one backend's models directly, bypassing the catalog.
pub async fn list_backend_models(
    State(state): State<AppState>,
    Path(url_idx): Path<usize>,
    headers: HeaderMap,
) -> AppResult<Response> {
    authorize(&headers, &state).await?;
    let registry = state.config.registry().await;
    let endpoint = registry.resolve(url_idx)?;

    let request = ProxyRequest::new(Method::GET, endpoint.url_for("models"), &endpoint.api_key)
        .with_timeout(state.runtime.request_timeout());
    let mut value = match upstream::forward(&state.http, &state.sessions, request).await? {
        ProxyOutcome::Buffered(value) => value,
        ProxyOutcome::Streaming(_) => {
            return Err(GatewayError::MalformedBody(
                "model listing answered with an event stream".to_string(),
            )
            .into());
        }
    };
    if is_canonical_openai_url(&endpoint.base_url) {
        if let Some(data) = value.get_mut("data").and_then(|v| v.as_array_mut()) {
            data.retain(|model| {
                model
                    .get("id")
                    .and_then(|id| id.as_str())
                    .is_some_and(|id| id.contains("gpt"))
            });
        }
    }
    Ok(Json(value).into_response())
}

pub async fn create_chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> AppResult<Response> {
    chat_completion(state, headers, body, None).await
}

pub async fn create_chat_completions_at(
    State(state): State<AppState>,
    Path(url_idx): Path<usize>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> AppResult<Response> {
    chat_completion(state, headers, body, Some(url_idx)).await
}

async fn chat_completion(
    state: AppState,
    headers: HeaderMap,
    body: Value,
    explicit_index: Option<usize>,
) -> AppResult<Response> {
    let caller = authorize(&headers, &state).await?;
    let Value::Object(mut payload) = body else {
        return Err(GatewayError::InvalidRequest("body must be object".to_string()).into());
    };
    let model_id = requested_model(&payload)?;

    if let Some(provider) = router::match_specialized(&model_id) {
        tracing::debug!(model = %model_id, provider = provider.as_str(), "specialized provider");
        return Ok(adapters::dispatch(
            state.http.clone(),
            &state.adapters,
            provider,
            payload,
            caller,
        ));
    }

    let profile = state.overrides.get(&model_id).await;
    normalize(&mut payload, profile.as_ref(), Some(&caller));
    let resolved = requested_model(&payload)?;

    let catalog = state.catalog.snapshot().await;
    match router::route(&resolved, &catalog, explicit_index)? {
        Route::Specialized(provider) => Ok(adapters::dispatch(
            state.http.clone(),
            &state.adapters,
            provider,
            payload,
            caller,
        )),
        Route::Backend { index, entry } => {
            router::attach_pipeline_identity(&mut payload, entry.as_ref(), &caller);
            let registry = state.config.registry().await;
            let endpoint = registry.resolve(index)?;
            tracing::debug!(
                model = %resolved,
                requested = %model_id,
                backend_index = index,
                "forwarding chat completion"
            );
            let request = ProxyRequest::new(
                Method::POST,
                endpoint.url_for("chat/completions"),
                &endpoint.api_key,
            )
            .with_json(&Value::Object(payload));
            let outcome = upstream::forward(&state.http, &state.sessions, request).await?;
            Ok(outcome.into_response())
        }
    }
}

/// Forwards any other path to the first configured backend.
pub async fn proxy_passthrough(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    if !matches!(
        method,
        Method::GET | Method::POST | Method::PUT | Method::DELETE
    ) {
        return Err(AppError::new(
            StatusCode::METHOD_NOT_ALLOWED,
            "method_not_allowed",
            format!("{method} is not proxied"),
        ));
    }
    authorize(&headers, &state).await?;
    let registry = state.config.registry().await;
    let endpoint = registry
        .resolve(0)
        .map_err(|_| GatewayError::ConfigurationNotFound)?;

    let path = uri.path();
    let path = path.strip_prefix("/api").unwrap_or(path);
    let mut url = endpoint.url_for(path);
    if let Some(query) = uri.query() {
        url.push('?');
        url.push_str(query);
    }

    let mut request = ProxyRequest::new(method, url, &endpoint.api_key);
    if !body.is_empty() {
        request = request.with_body(body);
    }
    let outcome = upstream::forward(&state.http, &state.sessions, request).await?;
    Ok(outcome.into_response())
}

async fn authorize(headers: &HeaderMap, state: &AppState) -> Result<CallerIdentity, GatewayError> {
    state
        .identity
        .verify(headers)
        .await
        .ok_or_else(|| GatewayError::Unauthorized("missing verified identity".to_string()))
}

fn requested_model(payload: &Map<String, Value>) -> Result<String, GatewayError> {
    payload
        .get("model")
        .and_then(|v| v.as_str())
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .ok_or_else(|| GatewayError::InvalidRequest("missing model".to_string()))
}
