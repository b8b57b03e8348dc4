//! Single-attempt webhook delivery.
//!
//! The executor turns one (subscription, payload) pair into one signed
//! HTTP request, classifies what came back, and writes the result to the
//! delivery ledger and the subscription's statistics. It never returns an
//! error: every failure ends up in the ledger row it produced.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use uuid::Uuid;

use crate::delivery::{envelope, AttemptRecord, Delivery, DeliveryOutcome};
use crate::dispatcher::DispatcherConfig;
use crate::error::{DeliveryFailure, WebhookError};
use crate::retry::RetryPolicy;
use crate::signing::signature_headers;
use crate::storage::{AttemptStats, DeliveryLedger, SubscriptionStore};
use crate::telemetry::{metric_inc, metric_inc_event};
use crate::types::{ContentType, Event, Subscription};

pub const EVENT_TYPE_HEADER: &str = "X-Event-Type";
pub const DELIVERY_ID_HEADER: &str = "X-Delivery-ID";

/// Ledger row after an attempt, and what the attempt amounted to.
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub delivery: Delivery,
    pub outcome: DeliveryOutcome,
}

pub struct DeliveryExecutor {
    subscriptions: Arc<dyn SubscriptionStore>,
    ledger: Arc<dyn DeliveryLedger>,
    client: reqwest::Client,
    /// Same as `client` but accepts invalid certificates.
    insecure_client: reqwest::Client,
    policy: RetryPolicy,
    user_agent: String,
    request_timeout: Duration,
    max_response_bytes: usize,
}

impl DeliveryExecutor {
    pub fn new(
        config: &DispatcherConfig,
        subscriptions: Arc<dyn SubscriptionStore>,
        ledger: Arc<dyn DeliveryLedger>,
    ) -> Result<Self, WebhookError> {
        let client = build_client(config, false)?;
        let insecure_client = build_client(config, true)?;

        Ok(Self {
            subscriptions,
            ledger,
            client,
            insecure_client,
            policy: config.retry_policy(),
            user_agent: config.user_agent.clone(),
            request_timeout: config.request_timeout(),
            max_response_bytes: config.max_response_bytes,
        })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// First attempt of `event` to `subscription`; creates the ledger row.
    pub async fn deliver(&self, subscription: &Subscription, event: &Event) -> DeliveryResult {
        self.deliver_with_policy(subscription, event, &self.policy).await
    }

    pub(crate) async fn deliver_with_policy(
        &self,
        subscription: &Subscription,
        event: &Event,
        policy: &RetryPolicy,
    ) -> DeliveryResult {
        let now = Utc::now();
        match envelope(event) {
            Ok(payload) => {
                let delivery = Delivery::new(subscription.id, event, payload, now);
                self.run_attempt(subscription, delivery, policy, true).await
            }
            Err(err) => {
                let failure = DeliveryFailure::Serialization(err.to_string());
                let mut delivery =
                    Delivery::new(subscription.id, event, serde_json::Value::Null, now);
                delivery.abandon(failure.to_string(), now);
                tracing::error!(
                    target: "webhook_delivery",
                    delivery_id = %delivery.id,
                    subscription_id = %subscription.id,
                    event_id = %event.id,
                    error = %failure,
                    "Event could not be serialized, delivery skipped"
                );
                self.persist(subscription, &delivery, false, true).await;
                DeliveryResult {
                    delivery,
                    outcome: DeliveryOutcome::Skipped { failure },
                }
            }
        }
    }

    /// Another attempt of an existing ledger row, from its stored payload.
    pub async fn redeliver(&self, subscription: &Subscription, delivery: Delivery) -> DeliveryResult {
        self.redeliver_with_policy(subscription, delivery, &self.policy).await
    }

    pub(crate) async fn redeliver_with_policy(
        &self,
        subscription: &Subscription,
        delivery: Delivery,
        policy: &RetryPolicy,
    ) -> DeliveryResult {
        self.run_attempt(subscription, delivery, policy, false).await
    }

    async fn run_attempt(
        &self,
        subscription: &Subscription,
        mut delivery: Delivery,
        policy: &RetryPolicy,
        is_new: bool,
    ) -> DeliveryResult {
        delivery.begin_attempt(Utc::now());
        let (record, result) = self.attempt(subscription, &delivery).await;
        let outcome = delivery.complete_attempt(record, result, policy, Utc::now());

        log_outcome(subscription, &delivery, &outcome);
        self.persist(subscription, &delivery, outcome.is_delivered(), is_new)
            .await;

        DeliveryResult { delivery, outcome }
    }

    /// Perform the HTTP call. Never touches the stores.
    async fn attempt(
        &self,
        subscription: &Subscription,
        delivery: &Delivery,
    ) -> (AttemptRecord, Result<u16, DeliveryFailure>) {
        let mut record = AttemptRecord::default();

        let body = match encode_body(subscription.content_type, &delivery.payload) {
            Ok(body) => body,
            Err(failure) => return (record, Err(failure)),
        };

        let mut headers: Vec<(&'static str, String)> = vec![
            ("Content-Type", subscription.content_type.mime().to_string()),
            ("User-Agent", self.user_agent.clone()),
            (EVENT_TYPE_HEADER, delivery.event_type.to_string()),
            (DELIVERY_ID_HEADER, Uuid::new_v4().to_string()),
        ];
        headers.extend(signature_headers(subscription.secret.expose(), &body));
        record.request_headers = headers
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();

        let client = if subscription.insecure_tls {
            &self.insecure_client
        } else {
            &self.client
        };
        let mut request = client
            .post(&subscription.url)
            .timeout(self.request_timeout)
            .body(body);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let started = Instant::now();
        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                record.duration = started.elapsed();
                return (record, Err(classify(&err)));
            }
        };

        let status = response.status().as_u16();
        record.response_status = Some(status);
        record.response_headers = headers_to_map(response.headers());

        match read_capped(response, self.max_response_bytes).await {
            Ok(body) => record.response_body = Some(body),
            Err(err) => {
                tracing::debug!(
                    target: "webhook_delivery",
                    delivery_id = %delivery.id,
                    error = %err,
                    "Failed to read response body"
                );
            }
        }
        record.duration = started.elapsed();

        if (200..300).contains(&status) {
            (record, Ok(status))
        } else {
            (record, Err(DeliveryFailure::Http(status)))
        }
    }

    /// Write the ledger row and bump subscription statistics.
    ///
    /// Store failures are logged and swallowed so the caller keeps running.
    async fn persist(&self, subscription: &Subscription, delivery: &Delivery, success: bool, is_new: bool) {
        let written = if is_new {
            self.ledger.create(delivery).await.map(|_| true)
        } else {
            self.ledger.update(delivery).await
        };
        match written {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(
                    target: "webhook_delivery",
                    delivery_id = %delivery.id,
                    "Delivery row disappeared before it could be updated"
                );
            }
            Err(e) => {
                tracing::error!(
                    target: "webhook_delivery",
                    delivery_id = %delivery.id,
                    subscription_id = %subscription.id,
                    error = %e,
                    "Failed to write delivery record"
                );
            }
        }

        let stats = AttemptStats {
            at: delivery.updated_at,
            success,
            status: delivery.response_status,
            error: delivery.last_error.clone(),
        };
        if let Err(e) = self.subscriptions.record_attempt(subscription.id, &stats).await {
            tracing::error!(
                target: "webhook_delivery",
                subscription_id = %subscription.id,
                error = %e,
                "Failed to update subscription delivery statistics"
            );
        }
    }
}

fn build_client(config: &DispatcherConfig, insecure: bool) -> Result<reqwest::Client, WebhookError> {
    reqwest::Client::builder()
        .timeout(config.request_timeout())
        .user_agent(config.user_agent.clone())
        .redirect(reqwest::redirect::Policy::none())
        .danger_accept_invalid_certs(insecure)
        .build()
        .map_err(|e| WebhookError::HttpClient(e.to_string()))
}

/// Request body for the subscription's content type.
fn encode_body(content_type: ContentType, payload: &serde_json::Value) -> Result<Vec<u8>, DeliveryFailure> {
    let json = serde_json::to_vec(payload).map_err(|e| DeliveryFailure::Serialization(e.to_string()))?;
    match content_type {
        ContentType::Json => Ok(json),
        ContentType::Form => {
            let json = String::from_utf8(json).map_err(|e| DeliveryFailure::Serialization(e.to_string()))?;
            Ok(url::form_urlencoded::Serializer::new(String::new())
                .append_pair("payload", &json)
                .finish()
                .into_bytes())
        }
    }
}

fn classify(err: &reqwest::Error) -> DeliveryFailure {
    if err.is_timeout() {
        DeliveryFailure::Timeout
    } else if err.is_builder() {
        DeliveryFailure::Serialization(format!("invalid request: {err}"))
    } else {
        DeliveryFailure::Transport(err.to_string())
    }
}

/// Read at most `cap` bytes of the body, chunk by chunk.
///
/// Stops pulling from the connection once the cap is reached.
async fn read_capped(mut response: reqwest::Response, cap: usize) -> Result<String, reqwest::Error> {
    let mut buf: Vec<u8> = Vec::with_capacity(cap.min(8 * 1024));
    while buf.len() < cap {
        let Some(chunk) = response.chunk().await? else {
            break;
        };
        let take = chunk.len().min(cap - buf.len());
        buf.extend_from_slice(&chunk[..take]);
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn headers_to_map(headers: &reqwest::header::HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.to_string(), v.to_string()))
        })
        .collect()
}

fn log_outcome(subscription: &Subscription, delivery: &Delivery, outcome: &DeliveryOutcome) {
    match outcome {
        DeliveryOutcome::Delivered { status } => {
            metric_inc("webhook.delivery.success");
            metric_inc_event("webhook.delivery.success.event", &delivery.event_type);
            tracing::info!(
                target: "webhook_delivery",
                delivery_id = %delivery.id,
                subscription_id = %subscription.id,
                event_id = %delivery.event_id,
                event_type = %delivery.event_type,
                attempt = delivery.attempt_count,
                status,
                duration_ms = delivery.duration_ms,
                "Webhook delivered"
            );
        }
        DeliveryOutcome::RetryScheduled { failure, at } => {
            metric_inc("webhook.delivery.failure");
            metric_inc("webhook.delivery.retry_scheduled");
            tracing::warn!(
                target: "webhook_delivery",
                delivery_id = %delivery.id,
                subscription_id = %subscription.id,
                event_id = %delivery.event_id,
                event_type = %delivery.event_type,
                attempt = delivery.attempt_count,
                error = %failure,
                next_retry_at = %at,
                "Webhook delivery failed, retry scheduled"
            );
        }
        DeliveryOutcome::Exhausted { failure } => {
            metric_inc("webhook.delivery.failure");
            metric_inc("webhook.delivery.exhausted");
            tracing::warn!(
                target: "webhook_delivery",
                delivery_id = %delivery.id,
                subscription_id = %subscription.id,
                event_id = %delivery.event_id,
                event_type = %delivery.event_type,
                attempt = delivery.attempt_count,
                error = %failure,
                "Webhook delivery failed, retry budget exhausted"
            );
        }
        DeliveryOutcome::Skipped { failure } => {
            metric_inc("webhook.delivery.failure");
            tracing::error!(
                target: "webhook_delivery",
                delivery_id = %delivery.id,
                subscription_id = %subscription.id,
                event_id = %delivery.event_id,
                error = %failure,
                "Webhook delivery skipped, not retryable"
            );
        }
    }
}
