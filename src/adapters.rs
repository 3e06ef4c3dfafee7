use crate::auth::CallerIdentity;
use crate::router::SpecializedProvider;
use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;

pub const TASK_DONE: &str = "TASK_DONE";
const DONE_LINE: &str = "data: [DONE]\n\n";
const ADAPTER_TEMPERATURE: f64 = 0.3;

/// Endpoint and key of one OpenAI-compatible specialized provider.
#[derive(Debug, Clone)]
pub struct CompatibleProvider {
    pub base_url: String,
    pub api_key: String,
}

#[derive(Debug, Clone)]
pub struct AdapterSettings {
    pub moonshot: CompatibleProvider,
    pub qianfan: CompatibleProvider,
    pub leagent_url: String,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            moonshot: CompatibleProvider {
                base_url: "https://api.moonshot.cn/v1".to_string(),
                api_key: String::new(),
            },
            qianfan: CompatibleProvider {
                base_url: "https://qianfan.baidubce.com/v2".to_string(),
                api_key: String::new(),
            },
            leagent_url: "http://localhost:8101/process".to_string(),
        }
    }
}

impl AdapterSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            moonshot: CompatibleProvider {
                base_url: env_or("MOONSHOT_BASE_URL", defaults.moonshot.base_url),
                api_key: env_or("MOONSHOT_API_KEY", defaults.moonshot.api_key),
            },
            qianfan: CompatibleProvider {
                base_url: env_or("QIANFAN_BASE_URL", defaults.qianfan.base_url),
                api_key: env_or("QIANFAN_API_KEY", defaults.qianfan.api_key),
            },
            leagent_url: env_or("LEAGENT_URL", defaults.leagent_url),
        }
    }
}

fn env_or(name: &str, fallback: String) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(fallback)
}

#[derive(Debug, thiserror::Error)]
enum AdapterError {
    #[error("provider request failed: {0}")]
    Upstream(String),
    #[error("provider returned {0}")]
    Status(StatusCode),
    #[error("caller disconnected")]
    CallerGone,
}

type ChunkSender = mpsc::Sender<Result<Bytes, std::io::Error>>;

/// Streams a specialized provider's answer back as gateway SSE chunks.
///
/// The response starts immediately; a provider failure shows up as a body
/// error that cuts the stream.
pub fn dispatch(
    http: reqwest::Client,
    settings: &AdapterSettings,
    provider: SpecializedProvider,
    payload: Map<String, Value>,
    caller: CallerIdentity,
) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(64);
    let settings = settings.clone();
    tokio::spawn(async move {
        let relay = async {
            match provider {
                SpecializedProvider::Leagent => {
                    relay_leagent(&http, &settings.leagent_url, &payload, &caller, &tx).await
                }
                SpecializedProvider::Moonshot => {
                    relay_compatible(&http, &settings.moonshot, &payload, &tx).await
                }
                SpecializedProvider::Qianfan => {
                    relay_compatible(&http, &settings.qianfan, &payload, &tx).await
                }
            }
        };
        let result = until_caller_leaves(&tx, relay).await;
        match result {
            Ok(()) => {
                let _ = tx.send(Ok(Bytes::from_static(DONE_LINE.as_bytes()))).await;
            }
            Err(AdapterError::CallerGone) => {
                tracing::debug!(provider = provider.as_str(), "caller left specialized stream");
            }
            Err(err) => {
                tracing::warn!(provider = provider.as_str(), "specialized stream failed: {err}");
                let _ = tx.send(Err(std::io::Error::other(err.to_string()))).await;
            }
        }
    });

    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(tokio_stream::wrappers::ReceiverStream::new(rx)),
    )
        .into_response()
}

/// Runs `relay` until it finishes or the response body is dropped, so a
/// provider that never answers does not outlive its caller.
async fn until_caller_leaves<F>(tx: &ChunkSender, relay: F) -> Result<(), AdapterError>
where
    F: Future<Output = Result<(), AdapterError>>,
{
    tokio::select! {
        result = relay => result,
        _ = tx.closed() => Err(AdapterError::CallerGone),
    }
}

pub fn delta_chunk(content: &str) -> Bytes {
    let data = json!({ "choices": [{ "delta": { "content": content } }] });
    Bytes::from(format!("data: {data}\n\n"))
}

fn task_done_chunk() -> Bytes {
    let data = json!({ "choices": [{ "message": { "role": "assistant", "content": TASK_DONE } }] });
    Bytes::from(format!("data: {data}\n\n"))
}

async fn emit(tx: &ChunkSender, chunk: Bytes) -> Result<(), AdapterError> {
    tx.send(Ok(chunk)).await.map_err(|_| AdapterError::CallerGone)
}

async fn relay_compatible(
    http: &reqwest::Client,
    provider: &CompatibleProvider,
    payload: &Map<String, Value>,
    tx: &ChunkSender,
) -> Result<(), AdapterError> {
    let body = json!({
        "model": payload.get("model").cloned().unwrap_or(Value::Null),
        "messages": payload.get("messages").cloned().unwrap_or_else(|| json!([])),
        "temperature": ADAPTER_TEMPERATURE,
        "stream": true,
    });
    let url = format!("{}/chat/completions", provider.base_url.trim_end_matches('/'));
    let resp = http
        .post(&url)
        .bearer_auth(&provider.api_key)
        .json(&body)
        .send()
        .await
        .map_err(|err| AdapterError::Upstream(err.to_string()))?;
    if !resp.status().is_success() {
        return Err(AdapterError::Status(resp.status()));
    }

    let mut events = resp.bytes_stream().eventsource();
    while let Some(event) = events.next().await {
        let event = event.map_err(|err| AdapterError::Upstream(err.to_string()))?;
        let data = event.data.trim();
        if data == "[DONE]" {
            break;
        }
        let Ok(value) = serde_json::from_str::<Value>(data) else {
            continue;
        };
        let content = value
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content"))
            .and_then(|c| c.as_str());
        if let Some(content) = content {
            emit(tx, delta_chunk(content)).await?;
        }
    }
    Ok(())
}

async fn relay_leagent(
    http: &reqwest::Client,
    url: &str,
    payload: &Map<String, Value>,
    caller: &CallerIdentity,
    tx: &ChunkSender,
) -> Result<(), AdapterError> {
    let messages = payload.get("messages").cloned().unwrap_or_else(|| json!([]));
    let content = messages
        .as_array()
        .and_then(|m| m.last())
        .and_then(|m| m.get("content"))
        .cloned()
        .unwrap_or_else(|| Value::String(String::new()));
    let body = json!({
        "model": payload.get("model").cloned().unwrap_or(Value::Null),
        "content": content,
        "messages": messages,
        "user": caller.to_json(),
    });
    let resp = http
        .post(url)
        .json(&body)
        .send()
        .await
        .map_err(|err| AdapterError::Upstream(err.to_string()))?;
    if !resp.status().is_success() {
        return Err(AdapterError::Status(resp.status()));
    }

    let mut stream = resp.bytes_stream();
    let mut pending = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| AdapterError::Upstream(err.to_string()))?;
        pending.extend_from_slice(&chunk);
        while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
            let line = pending.split_to(pos + 1);
            if forward_agent_line(&line, tx).await? {
                return Ok(());
            }
        }
    }
    if !pending.is_empty() {
        forward_agent_line(&pending, tx).await?;
    }
    Ok(())
}

/// Emits one agent output line. Returns true once the agent reported completion.
async fn forward_agent_line(line: &[u8], tx: &ChunkSender) -> Result<bool, AdapterError> {
    let text = String::from_utf8_lossy(line);
    let message = text.trim();
    if message.is_empty() {
        return Ok(false);
    }
    if message == TASK_DONE {
        emit(tx, task_done_chunk()).await?;
        return Ok(true);
    }
    emit(tx, delta_chunk(&format!("{message}\n"))).await?;
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_chunk_uses_gateway_envelope() {
        let chunk = delta_chunk("he said \"hi\"");
        let text = std::str::from_utf8(&chunk).unwrap();
        assert!(text.starts_with("data: "));
        assert!(text.ends_with("\n\n"));
        let value: Value = serde_json::from_str(text.trim_start_matches("data: ").trim()).unwrap();
        assert_eq!(value["choices"][0]["delta"]["content"], "he said \"hi\"");
    }

    #[tokio::test]
    async fn agent_lines_stop_at_task_done() {
        let (tx, mut rx) = mpsc::channel(8);
        assert!(!forward_agent_line(b"  step one \n", &tx).await.unwrap());
        assert!(!forward_agent_line(b"\n", &tx).await.unwrap());
        assert!(forward_agent_line(b"TASK_DONE\n", &tx).await.unwrap());
        drop(tx);

        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!(first, delta_chunk("step one\n"));
        let second = rx.recv().await.unwrap().unwrap();
        assert!(std::str::from_utf8(&second).unwrap().contains("\"message\""));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn stalled_provider_is_abandoned_when_caller_leaves() {
        let (tx, rx) = mpsc::channel(1);
        let stalled = std::future::pending::<Result<(), AdapterError>>();
        let waiter = tokio::spawn(async move { until_caller_leaves(&tx, stalled).await });
        drop(rx);
        let result = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("relay abandoned promptly")
            .unwrap();
        assert!(matches!(result, Err(AdapterError::CallerGone)));
    }

    #[tokio::test]
    async fn finished_relay_result_is_returned() {
        let (tx, _rx) = mpsc::channel(1);
        let result = until_caller_leaves(&tx, async { Err(AdapterError::Status(StatusCode::BAD_GATEWAY)) }).await;
        assert!(matches!(result, Err(AdapterError::Status(StatusCode::BAD_GATEWAY))));
    }

    #[tokio::test]
    async fn closed_receiver_reports_caller_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let err = emit(&tx, delta_chunk("x")).await.unwrap_err();
        assert!(matches!(err, AdapterError::CallerGone));
    }
}
