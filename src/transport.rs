// ===============================
// src/transport.rs
// ===============================
//
// Trader REST adapter:
// - every call carries `X-API-Key` (missing key -> warn, request still sent)
// - non-2xx -> ApiError::Status { status, body }
// - 2xx without a JSON content type -> `{}`
//
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::config::ApiSettings;
use crate::error::ApiError;
use crate::metrics::{API_LATENCY_MS, API_REQUESTS};

pub const API_KEY_HEADER: &str = "x-api-key";

/// Raw JSON access to the trader API. The engine only talks through this.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, path: &str) -> Result<Value, ApiError>;
    async fn post(&self, path: &str, body: Option<Value>) -> Result<Value, ApiError>;
}

pub struct HttpTransport {
    http: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
}

impl HttpTransport {
    pub fn new(settings: &ApiSettings) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        Ok(Self { http, base_url: settings.base_url.clone(), api_key: settings.api_key.clone() })
    }

    fn url(&self, path: &str) -> Result<Url, ApiError> {
        self.base_url
            .join(path)
            .map_err(|e| ApiError::Transport(format!("bad path {path:?}: {e}")))
    }

    fn headers(&self) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        match self.api_key.as_deref().map(HeaderValue::from_str) {
            Some(Ok(v)) => {
                h.insert(HeaderName::from_static(API_KEY_HEADER), v);
            }
            Some(Err(e)) => warn!(?e, "API key is not a valid header value, sending without it"),
            None => warn!("API key missing, sending request without {API_KEY_HEADER}"),
        }
        h
    }

    async fn send(&self, method: &'static str, req: reqwest::RequestBuilder) -> Result<Value, ApiError> {
        let t0 = std::time::Instant::now();
        let sent = req.headers(self.headers()).send().await;
        API_LATENCY_MS.observe(t0.elapsed().as_secs_f64() * 1_000.0);
        let rsp = match sent {
            Ok(r) => r,
            Err(e) => {
                API_REQUESTS.with_label_values(&[method, "transport"]).inc();
                return Err(e.into());
            }
        };

        let status = rsp.status();
        if !status.is_success() {
            let body = rsp.text().await.unwrap_or_default();
            let outcome = if status.as_u16() == 429 { "rate_limited" } else { "status" };
            API_REQUESTS.with_label_values(&[method, outcome]).inc();
            let body = if body.is_empty() { "No error details".to_string() } else { body };
            return Err(ApiError::Status { status: status.as_u16(), body });
        }
        API_REQUESTS.with_label_values(&[method, "ok"]).inc();

        let is_json = rsp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("application/json"))
            .unwrap_or(false);
        if !is_json {
            return Ok(Value::Object(Default::default()));
        }
        Ok(rsp.json::<Value>().await?)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, path: &str) -> Result<Value, ApiError> {
        let url = self.url(path)?;
        debug!(%url, "GET");
        self.send("GET", self.http.get(url)).await
    }

    async fn post(&self, path: &str, body: Option<Value>) -> Result<Value, ApiError> {
        let url = self.url(path)?;
        debug!(%url, "POST");
        let mut req = self.http.post(url);
        if let Some(b) = body {
            req = req.body(serde_json::to_vec(&b)?);
        }
        self.send("POST", req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{body_json, header, header_exists, method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn settings(uri: &str, key: Option<&str>) -> ApiSettings {
        ApiSettings {
            base_url: Url::parse(uri).unwrap(),
            api_key: key.map(str::to_string),
            request_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn get_sends_api_key_and_parses_json() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/rl/live/status"))
            .and(header("X-API-Key", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "status": "running" })))
            .expect(1)
            .mount(&server)
            .await;

        let t = HttpTransport::new(&settings(&server.uri(), Some("secret"))).unwrap();
        let v = t.get("/api/v1/rl/live/status").await.unwrap();
        assert_eq!(v["status"], "running");
    }

    #[tokio::test]
    async fn missing_key_still_sends_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let t = HttpTransport::new(&settings(&server.uri(), None)).unwrap();
        assert!(t.get("/status").await.is_ok());

        let received: Vec<Request> = server.received_requests().await.unwrap();
        assert!(received[0].headers.get("X-API-Key").is_none());
    }

    #[tokio::test]
    async fn non_success_becomes_typed_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/start"))
            .respond_with(ResponseTemplate::new(400).set_body_string("symbols required"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let t = HttpTransport::new(&settings(&server.uri(), Some("k"))).unwrap();
        let err = t.post("/start", None).await.unwrap_err();
        assert_eq!(err, ApiError::Status { status: 400, body: "symbols required".into() });

        let err = t.get("/status").await.unwrap_err();
        assert!(err.is_rate_limited());
    }

    #[tokio::test]
    async fn post_sends_json_body_and_tolerates_non_json_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/predict"))
            .and(header_exists("X-API-Key"))
            .and(body_json(serde_json::json!({ "symbol": "NVDA" })))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let t = HttpTransport::new(&settings(&server.uri(), Some("k"))).unwrap();
        let v = t.post("/predict", Some(serde_json::json!({ "symbol": "NVDA" }))).await.unwrap();
        assert_eq!(v, serde_json::json!({}));
    }

    #[tokio::test]
    async fn unreachable_host_is_transport_error() {
        // port 9 (discard) on localhost is closed in CI containers
        let t = HttpTransport::new(&settings("http://127.0.0.1:9", Some("k"))).unwrap();
        let err = t.get("/status").await.unwrap_err();
        assert!(matches!(err, ApiError::Transport(_)));
    }
}
