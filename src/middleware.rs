//! Outbound dispatch of operation plans to the automation middleware.
//!
//! Plans are POSTed as JSON to `{url}/api/v1/operations`; a connection test
//! goes to `{url}/api/v1/test`. The last test result is kept in memory.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{error, info, warn};
use utoipa::ToSchema;

use crate::planner::OperationPlan;

const OPERATIONS_PATH: &str = "/api/v1/operations";
const TEST_PATH: &str = "/api/v1/test";
const BASE_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

fn user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("rackflow/{version}")
}

/// Errors raised while talking to the middleware.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("No middleware connection is configured")]
    NotConfigured,

    #[error("Invalid middleware URL '{0}': must start with http:// or https://")]
    InvalidUrl(String),

    #[error("Middleware request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Middleware answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Could not encode operation: {0}")]
    Encode(#[from] serde_json::Error),
}

impl DispatchError {
    /// Transport failures and 5xx answers are worth another attempt.
    fn is_retryable(&self) -> bool {
        match self {
            DispatchError::Http(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            DispatchError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Connection parameters for the middleware.
#[derive(Clone, Debug)]
pub struct MiddlewareConfig {
    url: String,
    api_key: Option<String>,
    timeout: Duration,
    retry_count: u32,
}

impl MiddlewareConfig {
    pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
    pub const DEFAULT_RETRY_COUNT: u32 = 3;
    pub const MAX_RETRY_COUNT: u32 = 10;

    /// Validates the base URL; trailing slashes are dropped.
    pub fn new(url: impl Into<String>) -> Result<Self, DispatchError> {
        let url = url.into();
        let trimmed = url.trim();
        if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
            return Err(DispatchError::InvalidUrl(url));
        }
        Ok(Self {
            url: trimmed.trim_end_matches('/').to_string(),
            api_key: None,
            timeout: Duration::from_secs(Self::DEFAULT_TIMEOUT_SECS),
            retry_count: Self::DEFAULT_RETRY_COUNT,
        })
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|key| !key.trim().is_empty());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Retries after the first attempt, capped at `MAX_RETRY_COUNT`.
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count.min(Self::MAX_RETRY_COUNT);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.url, path)
    }
}

/// Middleware answer to a dispatched plan.
#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct Acknowledgement {
    pub operation_id: String,
    /// Parsed response body; `null` when empty, the raw text when not JSON
    #[schema(value_type = Object)]
    pub response: Value,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    NotTested,
    Success,
    Failed,
}

/// Result of the most recent connection test.
#[derive(Clone, Debug, Default, Serialize, ToSchema)]
pub struct ConnectionReport {
    pub url: Option<String>,
    pub status: ConnectionStatus,
    pub last_tested: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

/// Something that can carry plans to the floor automation.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Delivers a plan; an error means the plan was not accepted.
    async fn send(&self, plan: &OperationPlan) -> Result<Acknowledgement, DispatchError>;

    /// Probes the middleware and records the result.
    async fn test_connection(&self) -> ConnectionReport;

    /// Last recorded connection test.
    fn status(&self) -> ConnectionReport;
}

/// HTTP dispatcher backed by `reqwest`.
pub struct HttpDispatcher {
    config: MiddlewareConfig,
    client: reqwest::Client,
    report: Mutex<ConnectionReport>,
}

impl HttpDispatcher {
    pub fn new(config: MiddlewareConfig) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(user_agent())
            .build()?;
        let report = ConnectionReport {
            url: Some(config.url().to_string()),
            ..ConnectionReport::default()
        };
        Ok(Self {
            config,
            client,
            report: Mutex::new(report),
        })
    }

    pub fn config(&self) -> &MiddlewareConfig {
        &self.config
    }

    async fn post_once(&self, url: &str, body: &Value) -> Result<Value, DispatchError> {
        let mut request = self.client.post(url).json(body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("unreadable response"));
            return Err(DispatchError::Status {
                status: status.as_u16(),
                body,
            });
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        let text = response.text().await?;
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }

    /// POSTs `body`, retrying transport failures and 5xx answers with backoff.
    async fn post(&self, path: &str, body: &Value) -> Result<Value, DispatchError> {
        let url = self.config.endpoint(path);
        let mut attempt = 0;
        loop {
            match self.post_once(&url, body).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.config.retry_count => {
                    let wait = backoff(attempt);
                    attempt += 1;
                    warn!(
                        "Middleware call to {} failed ({}); retry {}/{} in {:?}",
                        url, err, attempt, self.config.retry_count, wait
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn record(&self, report: ConnectionReport) -> ConnectionReport {
        let mut guard = self
            .report
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = report.clone();
        report
    }
}

fn backoff(attempt: u32) -> Duration {
    BASE_BACKOFF
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(MAX_BACKOFF)
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn send(&self, plan: &OperationPlan) -> Result<Acknowledgement, DispatchError> {
        let body = match serde_json::to_value(plan) {
            Ok(body) => body,
            Err(err) => {
                error!("Could not encode operation {}: {}", plan.operation_id, err);
                return Err(err.into());
            }
        };
        match self.post(OPERATIONS_PATH, &body).await {
            Ok(response) => {
                info!("Sent operation {} to middleware", plan.operation_id);
                Ok(Acknowledgement {
                    operation_id: plan.operation_id.clone(),
                    response,
                })
            }
            Err(err) => {
                error!(
                    "Failed to send operation {} to middleware: {}",
                    plan.operation_id, err
                );
                Err(err)
            }
        }
    }

    async fn test_connection(&self) -> ConnectionReport {
        let now = Utc::now();
        let probe = json!({
            "operation_id": "TEST-CONNECTION",
            "operation_type": "test",
            "timestamp": now.to_rfc3339(),
        });
        let (status, message) = match self.post(TEST_PATH, &probe).await {
            Ok(_) => {
                info!("Middleware connection test succeeded for {}", self.config.url());
                (
                    ConnectionStatus::Success,
                    format!("Connected to middleware at {}", self.config.url()),
                )
            }
            Err(err) => {
                error!("Middleware connection test failed: {}", err);
                (
                    ConnectionStatus::Failed,
                    format!("Could not connect to middleware: {}", err),
                )
            }
        };
        self.record(ConnectionReport {
            url: Some(self.config.url().to_string()),
            status,
            last_tested: Some(now),
            message: Some(message),
        })
    }

    fn status(&self) -> ConnectionReport {
        self.report
            .lock()
            .map(|report| report.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

/// In-memory dispatcher used by handler tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    #[derive(Default)]
    pub struct RecordingDispatcher {
        pub sent: Mutex<Vec<OperationPlan>>,
        pub fail_with: Option<u16>,
    }

    impl RecordingDispatcher {
        pub fn failing(status: u16) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail_with: Some(status),
            }
        }

        pub fn sent_ids(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|plan| plan.operation_id.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Dispatcher for RecordingDispatcher {
        async fn send(&self, plan: &OperationPlan) -> Result<Acknowledgement, DispatchError> {
            if let Some(status) = self.fail_with {
                return Err(DispatchError::Status {
                    status,
                    body: "rejected".to_string(),
                });
            }
            self.sent.lock().unwrap().push(plan.clone());
            Ok(Acknowledgement {
                operation_id: plan.operation_id.clone(),
                response: json!({ "accepted": true }),
            })
        }

        async fn test_connection(&self) -> ConnectionReport {
            ConnectionReport {
                url: Some("http://recording".to_string()),
                status: ConnectionStatus::Success,
                last_tested: Some(Utc::now()),
                message: None,
            }
        }

        fn status(&self) -> ConnectionReport {
            ConnectionReport::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::Router;
    use axum::http::{HeaderMap, StatusCode as HttpStatus};
    use axum::routing::post;

    use crate::planner::{OperationKind, Priority, TargetBox};
    use crate::types::{BoxId, Coord};

    fn plan() -> OperationPlan {
        OperationPlan {
            operation_id: "PICKING-QBE1-20261019-083000-0001".to_string(),
            operation_type: OperationKind::Picking,
            timestamp: Utc::now(),
            priority: Priority::Normal,
            target_box: TargetBox {
                id: BoxId::new("QBE1"),
                current_pos: Coord::new(3, 1, 1),
                target_pos: Coord::origin(),
            },
            sequence: Vec::new(),
        }
    }

    /// Serves `router` on an ephemeral local port and returns its base URL.
    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn config_rejects_non_http_urls() {
        assert!(matches!(
            MiddlewareConfig::new("ftp://floor"),
            Err(DispatchError::InvalidUrl(_))
        ));
        let config = MiddlewareConfig::new(" https://floor.local/ ").unwrap();
        assert_eq!(config.url(), "https://floor.local");
        assert_eq!(
            config.endpoint(OPERATIONS_PATH),
            "https://floor.local/api/v1/operations"
        );
    }

    #[test]
    fn retry_count_is_capped() {
        let config = MiddlewareConfig::new("http://floor")
            .unwrap()
            .with_retry_count(99)
            .with_api_key(Some("  ".to_string()));
        assert_eq!(config.retry_count(), MiddlewareConfig::MAX_RETRY_COUNT);
        assert!(!config.has_api_key());
    }

    #[test]
    fn backoff_grows_and_is_bounded() {
        assert_eq!(backoff(0), Duration::from_millis(250));
        assert_eq!(backoff(1), Duration::from_millis(500));
        assert_eq!(backoff(10), MAX_BACKOFF);
    }

    #[test]
    fn only_server_errors_are_retried() {
        let server = DispatchError::Status {
            status: 503,
            body: String::new(),
        };
        let client = DispatchError::Status {
            status: 422,
            body: String::new(),
        };
        assert!(server.is_retryable());
        assert!(!client.is_retryable());
        assert!(!DispatchError::NotConfigured.is_retryable());
    }

    #[test]
    fn encoding_failure_is_a_dispatch_error() {
        let err: DispatchError = serde_json::from_str::<Value>("{").unwrap_err().into();
        assert!(matches!(err, DispatchError::Encode(_)));
        assert!(!err.is_retryable());
        assert!(err.to_string().starts_with("Could not encode operation"));
    }

    #[tokio::test]
    async fn sends_plan_with_bearer_token() {
        let router = Router::new().route(
            OPERATIONS_PATH,
            post(|headers: HeaderMap, axum::Json(body): axum::Json<Value>| async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                axum::Json(json!({ "auth": auth, "echo": body["operation_id"] }))
            }),
        );
        let url = serve(router).await;
        let dispatcher = HttpDispatcher::new(
            MiddlewareConfig::new(url)
                .unwrap()
                .with_api_key(Some("secret".to_string())),
        )
        .unwrap();

        let ack = dispatcher.send(&plan()).await.unwrap();
        assert_eq!(ack.operation_id, "PICKING-QBE1-20261019-083000-0001");
        assert_eq!(ack.response["auth"], "Bearer secret");
        assert_eq!(ack.response["echo"], "PICKING-QBE1-20261019-083000-0001");
    }

    #[tokio::test]
    async fn retries_server_errors_then_gives_up() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            OPERATIONS_PATH,
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    (HttpStatus::SERVICE_UNAVAILABLE, "busy")
                }
            }),
        );
        let url = serve(router).await;
        let dispatcher =
            HttpDispatcher::new(MiddlewareConfig::new(url).unwrap().with_retry_count(1)).unwrap();

        let err = dispatcher.send(&plan()).await.unwrap_err();
        assert!(matches!(err, DispatchError::Status { status: 503, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            OPERATIONS_PATH,
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    (HttpStatus::BAD_REQUEST, "bad plan")
                }
            }),
        );
        let url = serve(router).await;
        let dispatcher = HttpDispatcher::new(MiddlewareConfig::new(url).unwrap()).unwrap();

        let err = dispatcher.send(&plan()).await.unwrap_err();
        assert!(matches!(err, DispatchError::Status { status: 400, ref body } if body == "bad plan"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connection_test_records_status() {
        let router = Router::new().route(TEST_PATH, post(|| async { axum::Json(json!({})) }));
        let url = serve(router).await;
        let dispatcher = HttpDispatcher::new(MiddlewareConfig::new(url).unwrap()).unwrap();
        assert_eq!(dispatcher.status().status, ConnectionStatus::NotTested);

        let report = dispatcher.test_connection().await;
        assert_eq!(report.status, ConnectionStatus::Success);
        assert!(report.last_tested.is_some());
        assert_eq!(dispatcher.status().status, ConnectionStatus::Success);
    }

    #[tokio::test]
    async fn connection_test_failure_is_recorded() {
        let router = Router::new().route(
            TEST_PATH,
            post(|| async { (HttpStatus::UNAUTHORIZED, "no") }),
        );
        let url = serve(router).await;
        let dispatcher = HttpDispatcher::new(MiddlewareConfig::new(url).unwrap()).unwrap();

        let report = dispatcher.test_connection().await;
        assert_eq!(report.status, ConnectionStatus::Failed);
        assert!(report.message.unwrap().contains("401"));
    }
}
