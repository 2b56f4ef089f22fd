//! Telegram Bot API adapter (reqwest + axum).
//!
//! Implements the `tgd-core` [`UpdateSource`] over `getUpdates` and serves the
//! webhook endpoint that feeds [`tgd_core::webhook::WebhookReceiver`].

use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use tokio::time::sleep;

pub mod webhook;

use tgd_core::{
    config::Config,
    domain::Update,
    errors::{Error, FetchError},
    source::UpdateSource,
    Result,
};

/// Extra time on top of the long-poll timeout before the HTTP request is abandoned.
const POLL_SLACK: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<u16>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

/// Map a failed Bot API call to a retry decision.
pub fn classify_status(status: u16, description: &str, retry_after: Option<u64>) -> FetchError {
    let reason = format!("{status} {description}");
    match status {
        429 => FetchError::Transient {
            reason,
            retry_after: retry_after.map(Duration::from_secs),
        },
        401 | 404 => FetchError::fatal(format!("{reason} (is the bot token valid?)")),
        409 => FetchError::fatal(format!(
            "{reason} (another getUpdates consumer or an active webhook)"
        )),
        408 => FetchError::transient(reason),
        400..=499 => FetchError::fatal(reason),
        _ => FetchError::transient(reason),
    }
}

/// Decode a Bot API response body.
fn decode_response<T: DeserializeOwned>(
    status: u16,
    body: &[u8],
) -> std::result::Result<T, FetchError> {
    let parsed: ApiResponse<T> = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) if (200..300).contains(&status) => {
            return Err(FetchError::transient(format!("malformed response body: {e}")))
        }
        Err(_) => {
            let text = String::from_utf8_lossy(body);
            return Err(classify_status(
                status,
                &text.chars().take(200).collect::<String>(),
                None,
            ));
        }
    };

    if parsed.ok {
        if let Some(result) = parsed.result {
            return Ok(result);
        }
        return Err(FetchError::transient("response without result"));
    }

    Err(classify_status(
        parsed.error_code.unwrap_or(status),
        parsed.description.as_deref().unwrap_or("unknown error"),
        parsed.parameters.and_then(|p| p.retry_after),
    ))
}

#[derive(Clone)]
pub struct BotApiClient {
    // `{api_url}/bot{token}`
    base: String,
    http: reqwest::Client,
}

impl std::fmt::Debug for BotApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the token.
        f.debug_struct("BotApiClient").finish_non_exhaustive()
    }
}

impl BotApiClient {
    pub fn new(api_url: &str, token: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::External(format!("http client error: {e}")))?;
        Ok(Self {
            base: format!("{}/bot{token}", api_url.trim_end_matches('/')),
            http,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        Self::new(&cfg.api_url, &cfg.bot_token)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: &Value,
        timeout: Duration,
    ) -> std::result::Result<T, FetchError> {
        let resp = self
            .http
            .post(format!("{}/{method}", self.base))
            .timeout(timeout)
            .json(body)
            .send()
            .await
            // reqwest errors carry the URL, which contains the token.
            .map_err(|e| {
                FetchError::transient(format!("{method} request failed: {}", e.without_url()))
            })?;

        let status = resp.status().as_u16();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| {
                FetchError::transient(format!("{method} body read failed: {}", e.without_url()))
            })?;
        decode_response(status, &bytes)
    }

    /// Retries once when the server asks us to slow down.
    async fn call_with_retry<T: DeserializeOwned>(&self, method: &str, body: &Value) -> Result<T> {
        const MAX_RETRIES: usize = 1;
        let mut attempts = 0usize;
        loop {
            match self.call(method, body, REQUEST_TIMEOUT).await {
                Ok(v) => return Ok(v),
                Err(FetchError::Transient {
                    retry_after: Some(d),
                    ..
                }) if attempts < MAX_RETRIES => {
                    attempts += 1;
                    sleep(d).await;
                }
                Err(e) => return Err(Error::External(format!("telegram {method}: {e}"))),
            }
        }
    }

    /// Raw `getUpdates` call.
    pub async fn get_updates(
        &self,
        offset: i64,
        timeout: Duration,
        allowed_updates: &[String],
    ) -> std::result::Result<Vec<Value>, FetchError> {
        let body = json!({
            "offset": offset,
            "timeout": timeout.as_secs(),
            "allowed_updates": allowed_updates,
        });
        self.call("getUpdates", &body, timeout + POLL_SLACK).await
    }

    /// Required before polling: `getUpdates` fails with 409 while a webhook is set.
    pub async fn delete_webhook(&self, drop_pending_updates: bool) -> Result<()> {
        let body = json!({ "drop_pending_updates": drop_pending_updates });
        let _: bool = self.call_with_retry("deleteWebhook", &body).await?;
        tracing::info!(drop_pending_updates, "webhook removed");
        Ok(())
    }

    pub async fn set_webhook(
        &self,
        url: &str,
        secret: Option<&str>,
        allowed_updates: &[String],
        drop_pending_updates: bool,
    ) -> Result<()> {
        let mut body = json!({
            "url": url,
            "allowed_updates": allowed_updates,
            "drop_pending_updates": drop_pending_updates,
        });
        if let Some(secret) = secret {
            body["secret_token"] = Value::from(secret);
        }
        let _: bool = self.call_with_retry("setWebhook", &body).await?;
        tracing::info!(%url, "webhook registered");
        Ok(())
    }
}

/// Long-polling [`UpdateSource`] over `getUpdates`.
#[derive(Clone, Debug)]
pub struct BotApiSource {
    client: BotApiClient,
    allowed_updates: Vec<String>,
}

impl BotApiSource {
    pub fn new(client: BotApiClient, allowed_updates: Vec<String>) -> Self {
        Self {
            client,
            allowed_updates,
        }
    }
}

#[async_trait]
impl UpdateSource for BotApiSource {
    async fn fetch(
        &self,
        cursor: i64,
        timeout: Duration,
    ) -> std::result::Result<Vec<Update>, FetchError> {
        let raw = self
            .client
            .get_updates(cursor, timeout, &self.allowed_updates)
            .await?;

        let mut updates = Vec::with_capacity(raw.len());
        for value in raw {
            match Update::from_json(value) {
                Ok(u) => updates.push(u),
                Err(e) => tracing::warn!(error = %e, "skipping undecodable update"),
            }
        }
        Ok(updates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, routing::post, Json, Router};
    use std::sync::{Arc, Mutex};

    #[test]
    fn status_classification() {
        assert!(classify_status(401, "Unauthorized", None).is_fatal());
        assert!(classify_status(404, "Not Found", None).is_fatal());
        assert!(classify_status(409, "Conflict", None).is_fatal());
        assert!(classify_status(400, "Bad Request", None).is_fatal());
        assert!(!classify_status(500, "Internal", None).is_fatal());
        assert!(!classify_status(502, "Bad Gateway", None).is_fatal());
        assert_eq!(
            classify_status(429, "Too Many Requests", Some(7)),
            FetchError::Transient {
                reason: "429 Too Many Requests".into(),
                retry_after: Some(Duration::from_secs(7)),
            }
        );
    }

    #[test]
    fn decodes_ok_and_error_envelopes() {
        let ok: Vec<Value> =
            decode_response(200, br#"{"ok":true,"result":[{"update_id":1}]}"#).unwrap();
        assert_eq!(ok.len(), 1);

        let err = decode_response::<Vec<Value>>(
            429,
            br#"{"ok":false,"error_code":429,"description":"Too Many Requests: retry after 5","parameters":{"retry_after":5}}"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            FetchError::Transient { retry_after: Some(d), .. } if d == Duration::from_secs(5)
        ));

        let err = decode_response::<Vec<Value>>(502, b"<html>bad gateway</html>").unwrap_err();
        assert!(!err.is_fatal());
        let err = decode_response::<Vec<Value>>(200, b"not json").unwrap_err();
        assert!(!err.is_fatal());
    }

    #[derive(Clone, Default)]
    struct FakeApi {
        requests: Arc<Mutex<Vec<Value>>>,
        reply: Arc<Mutex<(u16, Value)>>,
    }

    async fn get_updates(
        State(api): State<FakeApi>,
        Json(body): Json<Value>,
    ) -> (axum::http::StatusCode, Json<Value>) {
        api.requests.lock().unwrap().push(body);
        let (status, reply) = api.reply.lock().unwrap().clone();
        (
            axum::http::StatusCode::from_u16(status).unwrap(),
            Json(reply),
        )
    }

    async fn fake_server(api: FakeApi) -> String {
        let app = Router::new()
            .route("/botTEST/getUpdates", post(get_updates))
            .with_state(api);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn source_sends_cursor_and_decodes_updates() {
        let api = FakeApi::default();
        *api.reply.lock().unwrap() = (
            200,
            json!({"ok": true, "result": [
                {"update_id": 7, "message": {"text": "hi"}},
                {"no_id": true},
            ]}),
        );
        let url = fake_server(api.clone()).await;

        let client = BotApiClient::new(&url, "TEST").unwrap();
        let source = BotApiSource::new(client, vec!["message".into()]);
        let updates = source.fetch(7, Duration::from_secs(1)).await.unwrap();

        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].text(), Some("hi"));
        let sent = api.requests.lock().unwrap()[0].clone();
        assert_eq!(sent["offset"], 7);
        assert_eq!(sent["timeout"], 1);
        assert_eq!(sent["allowed_updates"], json!(["message"]));
    }

    #[tokio::test]
    async fn revoked_token_is_fatal() {
        let api = FakeApi::default();
        *api.reply.lock().unwrap() = (
            401,
            json!({"ok": false, "error_code": 401, "description": "Unauthorized"}),
        );
        let url = fake_server(api).await;

        let source = BotApiSource::new(BotApiClient::new(&url, "TEST").unwrap(), Vec::new());
        let err = source.fetch(0, Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn unreachable_server_is_transient() {
        let source = BotApiSource::new(
            BotApiClient::new("http://127.0.0.1:1", "TEST").unwrap(),
            Vec::new(),
        );
        let err = source.fetch(0, Duration::from_secs(1)).await.unwrap_err();
        assert!(!err.is_fatal());
    }
}
