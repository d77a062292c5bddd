// =============================================================================
// RestClient — one HTTP client with deadlines and classified retries
// =============================================================================

use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Request, RequestBuilder, StatusCode};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::rest::retry::{execute_with_retry, RestError, RetryPolicy};

/// Upper bound on how much of an error body is kept in a `RestError`.
const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Clone)]
pub struct RestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl RestClient {
    pub fn new(
        policy: RetryPolicy,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            policy,
            cancel: cancel.child_token(),
        })
    }

    /// The underlying client, for building requests.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub async fn send(&self, builder: RequestBuilder) -> Result<RestResponse, RestError> {
        let request = builder
            .build()
            .map_err(|e| RestError::Invalid(e.to_string()))?;
        self.execute(request).await
    }

    /// Execute `request`, retrying transient failures under the client's
    /// policy. The request is cloned per attempt.
    pub async fn execute(&self, request: Request) -> Result<RestResponse, RestError> {
        let label = format!("{} {}", request.method(), request.url().path());
        execute_with_retry(&self.policy, &label, &self.cancel, || {
            let attempt = request.try_clone();
            async move {
                let attempt = attempt
                    .ok_or_else(|| RestError::Invalid("request body cannot be replayed".into()))?;
                self.send_once(attempt).await
            }
        })
        .await
    }

    async fn send_once(&self, request: Request) -> Result<RestResponse, RestError> {
        let resp = self
            .http
            .execute(request)
            .await
            .map_err(|e| RestError::from_reqwest(&e))?;

        let status = resp.status();
        let headers = resp.headers().clone();
        let text = resp.text().await.map_err(|e| RestError::from_reqwest(&e))?;

        if !status.is_success() {
            let retry_after = parse_retry_after(&headers);
            let body: String = text.chars().take(ERROR_BODY_LIMIT).collect();
            return Err(RestError::from_status(status, body, retry_after));
        }

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).map_err(|e| RestError::Decode(e.to_string()))?
        };
        debug!(status = status.as_u16(), "REST call succeeded");
        Ok(RestResponse {
            status,
            headers,
            body,
        })
    }
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("policy", &self.policy)
            .finish()
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use axum::extract::State;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::get;
    use axum::{Json, Router};

    async fn flaky(State(calls): State<Arc<AtomicU32>>) -> (AxumStatus, Json<Value>) {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        if n < 2 {
            (AxumStatus::SERVICE_UNAVAILABLE, Json(serde_json::json!({"msg": "busy"})))
        } else {
            (AxumStatus::OK, Json(serde_json::json!({"ok": true, "attempt": n})))
        }
    }

    async fn forbidden(State(calls): State<Arc<AtomicU32>>) -> (AxumStatus, &'static str) {
        calls.fetch_add(1, Ordering::SeqCst);
        (AxumStatus::FORBIDDEN, "nope")
    }

    async fn serve(calls: Arc<AtomicU32>) -> String {
        let app = Router::new()
            .route("/flaky", get(flaky))
            .route("/forbidden", get(forbidden))
            .with_state(calls);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn client() -> RestClient {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            jitter: true,
        };
        RestClient::new(policy, Duration::from_secs(5), &CancellationToken::new()).unwrap()
    }

    #[tokio::test]
    async fn unavailable_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let base = serve(calls.clone()).await;
        let c = client();
        let resp = c.send(c.http().get(format!("{base}/flaky"))).await.unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.body["attempt"], 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permission_errors_return_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let base = serve(calls.clone()).await;
        let c = client();
        let err = c.send(c.http().get(format!("{base}/forbidden"))).await.unwrap_err();
        assert_eq!(
            err,
            RestError::Auth {
                status: 403,
                body: "nope".into()
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn retry_after_header_is_parsed() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, "7".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));
        headers.insert(RETRY_AFTER, "soon".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), None);
    }
}
