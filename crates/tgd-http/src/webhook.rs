//! Webhook HTTP endpoint.
//!
//! Telegram POSTs one update per request and retries on any non-2xx answer,
//! so only updates that could not be queued get an error status.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Router,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use tgd_core::{
    errors::Error,
    webhook::{AcceptOutcome, WebhookReceiver},
    Result,
};

pub const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

#[derive(Clone)]
struct AppState {
    receiver: WebhookReceiver,
    secret: Option<Arc<str>>,
}

/// Router serving `POST {path}`.
pub fn router(path: &str, receiver: WebhookReceiver, secret: Option<String>) -> Router {
    let state = AppState {
        receiver,
        secret: secret.map(Arc::from),
    };
    Router::new()
        .route(path, post(handle_update))
        .with_state(state)
}

/// Serve `app` on `listen` until `shutdown` fires.
pub async fn serve(listen: SocketAddr, app: Router, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    tracing::info!(addr = %listen, "webhook server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!("webhook server stopped");
    Ok(())
}

#[instrument(name = "telegram.webhook", skip_all, fields(update_id = tracing::field::Empty))]
async fn handle_update(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if let Some(secret) = &state.secret {
        let given = headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok());
        if given != Some(secret.as_ref()) {
            warn!("webhook request with missing or wrong secret token");
            return StatusCode::UNAUTHORIZED;
        }
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "webhook body is not JSON");
            return StatusCode::BAD_REQUEST;
        }
    };
    if let Some(id) = payload.get("update_id").and_then(Value::as_i64) {
        tracing::Span::current().record("update_id", id);
    }

    match state.receiver.accept(payload).await {
        Ok(AcceptOutcome::Enqueued) => StatusCode::OK,
        Ok(outcome) => {
            tracing::debug!(?outcome, "webhook update acknowledged without queuing");
            StatusCode::OK
        }
        Err(Error::InvalidUpdate(reason)) => {
            warn!(%reason, "rejecting invalid update");
            StatusCode::BAD_REQUEST
        }
        // Full or closed queue: let Telegram redeliver later.
        Err(Error::Queue(_)) => StatusCode::SERVICE_UNAVAILABLE,
        Err(e) => {
            warn!(error = %e, "webhook update failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
