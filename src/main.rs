use axum::http::StatusCode;
use relaygate::error::AppError;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,relaygate=debug")),
        )
        .json()
        .init();

    if let Err(err) = run().await {
        eprintln!("error: {}", err.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    let state = relaygate::app::load_state().await?;
    let config = state.config.snapshot().await;
    tracing::info!(
        enabled = config.enabled,
        backends = config.base_urls.len(),
        model_filter = config.model_filter.enabled,
        "gateway configuration loaded"
    );

    let addr: std::net::SocketAddr = state
        .runtime
        .listen
        .parse()
        .map_err(|err: std::net::AddrParseError| startup_error("listen_invalid", err))?;
    let app = relaygate::app::build_app(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| startup_error("listen_failed", err))?;
    tracing::info!("listening on {}", addr);
    axum::serve(listener, app)
        .await
        .map_err(|err| startup_error("serve_failed", err))?;
    Ok(())
}

fn startup_error(code: &str, err: impl std::fmt::Display) -> AppError {
    AppError::new(StatusCode::INTERNAL_SERVER_ERROR, code, err.to_string())
}
