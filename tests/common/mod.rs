//! Shared fixtures for the integration tests: recording endpoints built on
//! wiremock and an in-memory harness wired like the dispatcher.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use gist_webhooks::{
    DeliveryExecutor, DispatcherConfig, InMemoryDeliveryLedger, InMemorySubscriptionStore,
    RetrySweeper, SubscriptionService,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

pub const SECRET: &str = "whsec_test_secret_key_12345";
pub const HOOK_PATH: &str = "/hook";

/// One request as the endpoint saw it.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub received_at: Instant,
}

impl CapturedRequest {
    pub fn body_json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("request body is JSON")
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn header_pairs(&self) -> Vec<(&str, &str)> {
        self.headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect()
    }
}

/// Records every request. Fails the first `failures` with 500, then answers
/// `status` with an optional body and delay.
#[derive(Clone)]
pub struct RecordingResponder {
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
    attempts: Arc<AtomicU32>,
    failures: u32,
    status: u16,
    body: Option<String>,
    delay: Option<Duration>,
}

impl RecordingResponder {
    pub fn ok() -> Self {
        Self::with_status(200)
    }

    pub fn with_status(status: u16) -> Self {
        Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            attempts: Arc::new(AtomicU32::new(0)),
            failures: 0,
            status,
            body: None,
            delay: None,
        }
    }

    /// 500 for the first `n` requests, then 200.
    pub fn fail_times(n: u32) -> Self {
        Self {
            failures: n,
            ..Self::ok()
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Respond for RecordingResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(CapturedRequest {
            body: request.body.clone(),
            headers: request
                .headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                .collect(),
            received_at: Instant::now(),
        });

        let status = if attempt < self.failures { 500 } else { self.status };
        let mut response = ResponseTemplate::new(status);
        if let Some(body) = &self.body {
            response = response.set_body_string(body.clone());
        }
        if let Some(delay) = self.delay {
            response = response.set_delay(delay);
        }
        response
    }
}

/// Start a server answering POST /hook with `responder`.
pub async fn endpoint(responder: RecordingResponder) -> (MockServer, String) {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(HOOK_PATH))
        .respond_with(responder)
        .mount(&server)
        .await;
    let url = format!("{}{}", server.uri(), HOOK_PATH);
    (server, url)
}

/// Config for direct executor and sweeper tests: no workers, no sweeper.
pub fn test_config() -> DispatcherConfig {
    DispatcherConfig {
        worker_count: 0,
        sweeper_enabled: false,
        request_timeout_ms: 2_000,
        ..DispatcherConfig::default()
    }
}

/// In-memory stores plus every component on top of them, without a queue.
pub struct Harness {
    pub subscriptions: Arc<InMemorySubscriptionStore>,
    pub ledger: Arc<InMemoryDeliveryLedger>,
    pub executor: Arc<DeliveryExecutor>,
    pub service: SubscriptionService,
    pub sweeper: RetrySweeper,
}

impl Harness {
    pub fn new(config: DispatcherConfig) -> Self {
        init_tracing();
        let subscriptions = Arc::new(InMemorySubscriptionStore::new());
        let ledger = Arc::new(InMemoryDeliveryLedger::new());
        let executor = Arc::new(
            DeliveryExecutor::new(&config, subscriptions.clone(), ledger.clone())
                .expect("HTTP client builds"),
        );
        let service = SubscriptionService::new(subscriptions.clone(), ledger.clone(), executor.clone());
        let sweeper = RetrySweeper::new(executor.clone(), subscriptions.clone(), ledger.clone(), &config);

        Self {
            subscriptions,
            ledger,
            executor,
            service,
            sweeper,
        }
    }
}

/// Route crate logs to the test writer; `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub fn data(pairs: &[(&str, serde_json::Value)]) -> serde_json::Map<String, serde_json::Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}
