//! Typed HTTP transport for the remote knowledge-base service.
//!
//! Every call ends in either the parsed JSON body or exactly one
//! [`ApiError`]. Rate limits (429) and server errors (5xx) are retried
//! according to [`RetryPolicy`]; everything else surfaces immediately.

mod retry;
mod upload;

use std::time::Duration;

use refkb_shared::{ApiError, ApiErrorKind, RefKbError, Result, TransportConfig};
use reqwest::header::RETRY_AFTER;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde_json::Value;
use tracing::{debug, error, warn};

pub use retry::RetryPolicy;
pub use upload::UploadFile;

/// User-Agent string for knowledge-base requests.
const USER_AGENT: &str = concat!("refkb/", env!("CARGO_PKG_VERSION"));

/// Result of a single transport call.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Request body
// ---------------------------------------------------------------------------

/// What a request carries besides its query string.
#[derive(Debug, Clone, Copy)]
pub enum RequestBody<'a> {
    Empty,
    Json(&'a Value),
    /// Multipart: a binary `file` part plus a `data` JSON text part.
    File {
        file: &'a UploadFile,
        data: &'a Value,
    },
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Authenticated client bound to one service base URL.
#[derive(Debug, Clone)]
pub struct Transport {
    client: Client,
    base_url: String,
    api_key: String,
    policy: RetryPolicy,
}

impl Transport {
    /// Build a transport from runtime config and a resolved API key.
    pub fn new(config: &TransportConfig, api_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.timeout)
            .build()
            .map_err(|e| RefKbError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            policy: RetryPolicy::from(config),
        })
    }

    /// Replace the retry policy (tests shrink the backoff unit).
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Join the base URL and an endpoint with exactly one `/`.
    pub fn url_for(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }

    pub async fn get(&self, endpoint: &str, query: &[(&str, String)]) -> ApiResult<Value> {
        self.execute(Method::GET, endpoint, RequestBody::Empty, query)
            .await
    }

    pub async fn post_json(&self, endpoint: &str, body: &Value) -> ApiResult<Value> {
        self.execute(Method::POST, endpoint, RequestBody::Json(body), &[])
            .await
    }

    pub async fn patch_json(&self, endpoint: &str, body: &Value) -> ApiResult<Value> {
        self.execute(Method::PATCH, endpoint, RequestBody::Json(body), &[])
            .await
    }

    pub async fn delete(&self, endpoint: &str) -> ApiResult<Value> {
        self.execute(Method::DELETE, endpoint, RequestBody::Empty, &[])
            .await
    }

    pub async fn post_file(
        &self,
        endpoint: &str,
        file: &UploadFile,
        data: &Value,
    ) -> ApiResult<Value> {
        self.execute(Method::POST, endpoint, RequestBody::File { file, data }, &[])
            .await
    }

    /// Issue one logical call, retrying 429 and 5xx within the policy budget.
    pub async fn execute(
        &self,
        method: Method,
        endpoint: &str,
        body: RequestBody<'_>,
        query: &[(&str, String)],
    ) -> ApiResult<Value> {
        let url = self.url_for(endpoint);
        let mut attempt: u32 = 0;

        loop {
            debug!(%method, endpoint, attempt, "sending request");
            let request = self.build_request(&method, &url, body, query);

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => return Err(self.surface(send_error(&method, endpoint, &e))),
            };

            let status = response.status();
            if status.is_success() {
                return read_success(&method, endpoint, response)
                    .await
                    .map_err(|e| self.surface(e));
            }

            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            let text = response.text().await.unwrap_or_default();
            let detail = extract_detail(status, &text);

            let kind = match status.as_u16() {
                401 | 403 => ApiErrorKind::Authentication,
                429 => {
                    let delay = self.policy.rate_limit_delay(retry_after.as_deref());
                    if self.policy.should_retry(attempt) {
                        warn!(
                            endpoint,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "rate limited, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    ApiErrorKind::RateLimited {
                        retry_after_secs: as_secs_ceil(delay),
                    }
                }
                code @ 500..=599 => {
                    if self.policy.should_retry(attempt) {
                        let delay = self.policy.server_backoff(attempt);
                        warn!(
                            endpoint,
                            attempt,
                            status = code,
                            delay_ms = delay.as_millis() as u64,
                            "server error, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    ApiErrorKind::ServerError { status: code }
                }
                code => ApiErrorKind::Unclassified { status: Some(code) },
            };

            return Err(self.surface(ApiError::new(kind, method.as_str(), endpoint, detail)));
        }
    }

    fn build_request(
        &self,
        method: &Method,
        url: &str,
        body: RequestBody<'_>,
        query: &[(&str, String)],
    ) -> RequestBuilder {
        let mut request = self
            .client
            .request(method.clone(), url)
            .bearer_auth(&self.api_key);

        if !query.is_empty() {
            request = request.query(query);
        }

        match body {
            RequestBody::Empty => request,
            RequestBody::Json(value) => request.json(value),
            RequestBody::File { file, data } => request.multipart(multipart_form(file, data)),
        }
    }

    fn surface(&self, err: ApiError) -> ApiError {
        error!(
            method = %err.method,
            endpoint = %err.endpoint,
            kind = %err.kind,
            detail = %err.detail,
            "request failed"
        );
        err
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Rebuilt per attempt; `Form` is consumed by the request.
fn multipart_form(file: &UploadFile, data: &Value) -> Form {
    let part = Part::bytes(file.bytes.clone()).file_name(file.file_name.clone());
    let part = match part.mime_str(file.mime) {
        Ok(part) => part,
        Err(_) => Part::bytes(file.bytes.clone()).file_name(file.file_name.clone()),
    };
    Form::new().part("file", part).text("data", data.to_string())
}

fn send_error(method: &Method, endpoint: &str, err: &reqwest::Error) -> ApiError {
    let kind = if err.is_timeout() {
        ApiErrorKind::Timeout
    } else {
        ApiErrorKind::Network
    };
    ApiError::new(kind, method.as_str(), endpoint, err.to_string())
}

async fn read_success(
    method: &Method,
    endpoint: &str,
    response: reqwest::Response,
) -> ApiResult<Value> {
    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|e| send_error(method, endpoint, &e))?;

    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }

    serde_json::from_slice(&bytes).map_err(|e| {
        ApiError::new(
            ApiErrorKind::Unclassified {
                status: Some(status.as_u16()),
            },
            method.as_str(),
            endpoint,
            format!("invalid JSON in response body: {e}"),
        )
    })
}

/// Human-readable failure detail from an error response body.
///
/// JSON `message`, else `error`, else the whole JSON; otherwise the raw
/// text; otherwise `HTTP <status>`.
pub fn extract_detail(status: StatusCode, body: &str) -> String {
    let body = body.trim();
    if let Ok(json) = serde_json::from_str::<Value>(body) {
        let field = json
            .get("message")
            .filter(|v| !v.is_null())
            .or_else(|| json.get("error").filter(|v| !v.is_null()));
        return match field {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => json.to_string(),
        };
    }
    if !body.is_empty() {
        return body.to_string();
    }
    format!("HTTP {}", status.as_u16())
}

/// Whole-second view of a delay, rounded up.
fn as_secs_ceil(delay: Duration) -> u64 {
    delay.as_secs() + u64::from(delay.subsec_nanos() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, header_regex, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            max_backoff: Duration::from_millis(20),
            default_retry_after: Duration::from_millis(1),
            backoff_unit: Duration::from_millis(1),
        }
    }

    fn transport(base_url: &str, max_retries: u32) -> Transport {
        let config = TransportConfig {
            base_url: base_url.to_string(),
            timeout: Duration::from_secs(5),
            max_retries,
            max_backoff: Duration::from_secs(30),
            default_retry_after: Duration::from_secs(60),
        };
        Transport::new(&config, "test-key")
            .expect("build transport")
            .with_policy(fast_policy(max_retries))
    }

    #[test]
    fn url_join_uses_one_slash() {
        let t = transport("http://kb.local/", 0);
        assert_eq!(t.url_for("/v1/datasets"), "http://kb.local/v1/datasets");
        assert_eq!(t.url_for("v1/datasets"), "http://kb.local/v1/datasets");
    }

    #[test]
    fn detail_extraction_order() {
        let s = StatusCode::BAD_REQUEST;
        assert_eq!(extract_detail(s, r#"{"message":"bad name","error":"x"}"#), "bad name");
        assert_eq!(extract_detail(s, r#"{"error":"invalid_param"}"#), "invalid_param");
        assert_eq!(extract_detail(s, r#"{"code":7}"#), r#"{"code":7}"#);
        assert_eq!(extract_detail(s, "gateway exploded"), "gateway exploded");
        assert_eq!(extract_detail(s, ""), "HTTP 400");
    }

    #[test]
    fn secs_ceil() {
        assert_eq!(as_secs_ceil(Duration::from_millis(1500)), 2);
        assert_eq!(as_secs_ceil(Duration::from_secs(3)), 3);
    }

    #[tokio::test]
    async fn get_sends_bearer_and_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/datasets"))
            .and(header("authorization", "Bearer test-key"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": [], "has_more": false})))
            .expect(1)
            .mount(&server)
            .await;

        let t = transport(&server.uri(), 3);
        let body = t
            .get("/v1/datasets", &[("page", "2".to_string())])
            .await
            .expect("success");
        assert_eq!(body["has_more"], false);
    }

    #[tokio::test]
    async fn empty_success_body_is_null() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1/datasets/ds-1"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let t = transport(&server.uri(), 3);
        assert_eq!(t.delete("/v1/datasets/ds-1").await.expect("ok"), Value::Null);
    }

    #[tokio::test]
    async fn non_json_success_is_unclassified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
            .mount(&server)
            .await;

        let err = transport(&server.uri(), 3).get("/v1/x", &[]).await.unwrap_err();
        assert_eq!(err.kind, ApiErrorKind::Unclassified { status: Some(200) });
        assert!(err.detail.contains("invalid JSON"));
    }

    #[tokio::test]
    async fn rate_limited_then_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/datasets"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/datasets"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "ds-1"})))
            .expect(1)
            .mount(&server)
            .await;

        let t = transport(&server.uri(), 3);
        let body = t
            .post_json("/v1/datasets", &json!({"name": "reports"}))
            .await
            .expect("eventually succeeds");
        assert_eq!(body["id"], "ds-1");
    }

    #[tokio::test]
    async fn rate_limit_budget_exhausted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("Retry-After", "0")
                    .set_body_json(json!({"message": "too many requests"})),
            )
            .expect(3)
            .mount(&server)
            .await;

        let err = transport(&server.uri(), 2).get("/v1/datasets", &[]).await.unwrap_err();
        assert_eq!(err.kind, ApiErrorKind::RateLimited { retry_after_secs: 0 });
        assert_eq!(err.detail, "too many requests");
        assert_eq!(err.method, "GET");
        assert_eq!(err.endpoint, "/v1/datasets");
    }

    #[tokio::test]
    async fn server_errors_retry_then_surface() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .expect(4)
            .mount(&server)
            .await;

        let err = transport(&server.uri(), 3)
            .post_json("/v1/datasets", &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ApiErrorKind::ServerError { status: 503 });
        assert_eq!(err.detail, "maintenance");
    }

    #[tokio::test]
    async fn server_error_then_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let body = transport(&server.uri(), 3).get("/v1/x", &[]).await.expect("ok");
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn authentication_is_never_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({"message": "invalid api key"})))
            .expect(1)
            .mount(&server)
            .await;

        let err = transport(&server.uri(), 3).get("/v1/datasets", &[]).await.unwrap_err();
        assert_eq!(err.kind, ApiErrorKind::Authentication);
        assert_eq!(err.detail, "invalid api key");
    }

    #[tokio::test]
    async fn not_found_is_unclassified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "dataset_not_found"})))
            .expect(1)
            .mount(&server)
            .await;

        let err = transport(&server.uri(), 3).get("/v1/datasets/x", &[]).await.unwrap_err();
        assert_eq!(err.kind, ApiErrorKind::Unclassified { status: Some(404) });
        assert_eq!(err.detail, "dataset_not_found");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn timeout_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let config = TransportConfig {
            base_url: server.uri(),
            timeout: Duration::from_millis(50),
            max_retries: 3,
            max_backoff: Duration::from_secs(30),
            default_retry_after: Duration::from_secs(60),
        };
        let t = Transport::new(&config, "k").expect("build");
        let err = t.get("/slow", &[]).await.unwrap_err();
        assert_eq!(err.kind, ApiErrorKind::Timeout);
    }

    #[tokio::test]
    async fn connection_refused_is_network() {
        // Nothing listens on port 1.
        let err = transport("http://127.0.0.1:1", 3).get("/v1/x", &[]).await.unwrap_err();
        assert_eq!(err.kind, ApiErrorKind::Network);
    }

    #[tokio::test]
    async fn file_upload_is_multipart() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/datasets/ds-1/document/create-by-file"))
            .and(header_regex("content-type", "^multipart/form-data"))
            .and(body_string_contains("name=\"file\"; filename=\"r-1.md\""))
            .and(body_string_contains("high_quality"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"document": {"id": "doc-1"}})))
            .expect(1)
            .mount(&server)
            .await;

        let file = UploadFile::new("r-1.md", b"# Report".to_vec());
        let data = json!({"indexing_technique": "high_quality"});
        let body = transport(&server.uri(), 3)
            .post_file("/v1/datasets/ds-1/document/create-by-file", &file, &data)
            .await
            .expect("upload");
        assert_eq!(body["document"]["id"], "doc-1");
    }
}
