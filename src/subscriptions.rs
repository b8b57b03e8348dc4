//! Owner-facing management of webhook subscriptions.
//!
//! Validates configuration before it reaches the store, redacts secrets on
//! the way out (see [`Secret`]), and exposes test deliveries, delivery
//! history and operator replay.

use std::sync::Arc;

use chrono::Utc;

use crate::delivery::{Delivery, DeliveryId};
use crate::error::{WebhookError, WebhookResult};
use crate::executor::{DeliveryExecutor, DeliveryResult};
use crate::retry::RetryPolicy;
use crate::storage::{DeliveryLedger, SubscriptionStore};
use crate::types::{
    Actor, Event, EventFilter, EventType, NewSubscription, Owner, Secret, Subscription,
    SubscriptionId, SubscriptionPatch, MIN_SECRET_LEN,
};

/// Hard cap on one page of delivery history.
pub const MAX_HISTORY_PAGE: usize = 100;

#[derive(Clone)]
pub struct SubscriptionService {
    subscriptions: Arc<dyn SubscriptionStore>,
    ledger: Arc<dyn DeliveryLedger>,
    executor: Arc<DeliveryExecutor>,
}

impl SubscriptionService {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        ledger: Arc<dyn DeliveryLedger>,
        executor: Arc<DeliveryExecutor>,
    ) -> Self {
        Self {
            subscriptions,
            ledger,
            executor,
        }
    }

    pub async fn create(&self, request: NewSubscription) -> WebhookResult<Subscription> {
        validate_url(&request.url)?;
        validate_secret(&request.secret)?;
        let events = request.events.canonical();
        validate_events(&events)?;

        let now = Utc::now();
        let subscription = Subscription {
            id: SubscriptionId::generate(),
            owner: request.owner,
            url: request.url,
            secret: request.secret,
            events,
            active: request.active,
            content_type: request.content_type,
            insecure_tls: request.insecure_tls,
            last_delivered_at: None,
            last_status: None,
            last_error: None,
            delivery_count: 0,
            failure_count: 0,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        self.subscriptions.insert(&subscription).await?;

        tracing::info!(
            target: "webhook_delivery",
            subscription_id = %subscription.id,
            owner = ?subscription.owner,
            url = %subscription.url,
            signed = subscription.has_secret(),
            "Webhook subscription created"
        );
        Ok(subscription)
    }

    /// Fetch a subscription that has not been deleted.
    pub async fn get(&self, id: SubscriptionId) -> WebhookResult<Subscription> {
        match self.subscriptions.get(id).await? {
            Some(sub) if sub.deleted_at.is_none() => Ok(sub),
            _ => Err(WebhookError::SubscriptionNotFound),
        }
    }

    pub async fn list_for_owner(&self, owner: Owner) -> WebhookResult<Vec<Subscription>> {
        Ok(self.subscriptions.list_by_owner(owner).await?)
    }

    pub async fn update(&self, id: SubscriptionId, patch: SubscriptionPatch) -> WebhookResult<Subscription> {
        let mut subscription = self.get(id).await?;

        if let Some(url) = patch.url {
            validate_url(&url)?;
            subscription.url = url;
        }
        if let Some(secret) = patch.secret {
            validate_secret(&secret)?;
            // Unsigned mode is chosen at creation; a signed hook stays signed.
            if secret.is_empty() && subscription.has_secret() {
                return Err(WebhookError::Validation(
                    "the secret of a signed subscription cannot be removed".to_string(),
                ));
            }
            subscription.secret = secret;
        }
        if let Some(events) = patch.events {
            let events = events.canonical();
            validate_events(&events)?;
            subscription.events = events;
        }
        if let Some(active) = patch.active {
            subscription.active = active;
        }
        if let Some(content_type) = patch.content_type {
            subscription.content_type = content_type;
        }
        if let Some(insecure_tls) = patch.insecure_tls {
            subscription.insecure_tls = insecure_tls;
        }
        subscription.updated_at = Utc::now();

        if !self.subscriptions.update(&subscription).await? {
            return Err(WebhookError::SubscriptionNotFound);
        }
        tracing::info!(
            target: "webhook_delivery",
            subscription_id = %subscription.id,
            active = subscription.active,
            "Webhook subscription updated"
        );
        Ok(subscription)
    }

    /// Soft delete. Pending retries are abandoned by the sweeper.
    pub async fn delete(&self, id: SubscriptionId) -> WebhookResult<()> {
        let mut subscription = self.get(id).await?;
        let now = Utc::now();
        subscription.active = false;
        subscription.deleted_at = Some(now);
        subscription.updated_at = now;

        if !self.subscriptions.update(&subscription).await? {
            return Err(WebhookError::SubscriptionNotFound);
        }
        tracing::info!(
            target: "webhook_delivery",
            subscription_id = %id,
            "Webhook subscription deleted"
        );
        Ok(())
    }

    /// Deliver a synthetic `test` event right now, ignoring the filter and
    /// the active flag. Recorded in the ledger but never retried.
    pub async fn test_delivery(&self, id: SubscriptionId) -> WebhookResult<Delivery> {
        let subscription = self.get(id).await?;

        let mut data = serde_json::Map::new();
        data.insert(
            "message".to_string(),
            serde_json::Value::String("This is a test webhook delivery".to_string()),
        );
        data.insert(
            "subscription_id".to_string(),
            serde_json::Value::String(id.to_string()),
        );
        let event = Event::new(EventType::Test, Actor::system(), data);

        let result = self
            .executor
            .deliver_with_policy(&subscription, &event, &RetryPolicy::no_retries())
            .await;
        outcome_to_result(result)
    }

    /// Delivery history of one subscription, newest first.
    pub async fn list_deliveries(&self, id: SubscriptionId, limit: usize) -> WebhookResult<Vec<Delivery>> {
        self.get(id).await?;
        let limit = limit.clamp(1, MAX_HISTORY_PAGE);
        Ok(self.ledger.list_for_subscription(id, limit).await?)
    }

    pub async fn get_delivery(&self, id: DeliveryId) -> WebhookResult<Delivery> {
        self.ledger
            .get(id)
            .await?
            .ok_or(WebhookError::DeliveryNotFound)
    }

    /// Operator replay of a ledger row from its stored payload.
    ///
    /// Works on exhausted rows too. The attempt counts against the row's
    /// budget like any other, so a failing replay of an exhausted row stays
    /// exhausted.
    pub async fn redeliver(&self, delivery_id: DeliveryId) -> WebhookResult<DeliveryResult> {
        let delivery = self.get_delivery(delivery_id).await?;
        let subscription = self.get(delivery.subscription_id).await?;

        let policy = if delivery.event_type == EventType::Test {
            RetryPolicy::no_retries()
        } else {
            *self.executor.policy()
        };

        tracing::info!(
            target: "webhook_delivery",
            delivery_id = %delivery.id,
            subscription_id = %subscription.id,
            attempt = delivery.attempt_count + 1,
            "Manual redelivery requested"
        );
        Ok(self
            .executor
            .redeliver_with_policy(&subscription, delivery, &policy)
            .await)
    }
}

fn outcome_to_result(result: DeliveryResult) -> WebhookResult<Delivery> {
    use crate::delivery::DeliveryOutcome;

    match result.outcome {
        DeliveryOutcome::Delivered { .. } => Ok(result.delivery),
        DeliveryOutcome::RetryScheduled { failure, .. }
        | DeliveryOutcome::Exhausted { failure }
        | DeliveryOutcome::Skipped { failure } => Err(WebhookError::TestDeliveryFailed(failure)),
    }
}

/// Endpoint URL must be absolute `http(s)` with a host.
pub fn validate_url(raw: &str) -> WebhookResult<()> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| WebhookError::InvalidUrl(format!("invalid URL format: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(WebhookError::InvalidUrl(format!(
                "unsupported URL scheme: {scheme}"
            )))
        }
    }

    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(WebhookError::InvalidUrl("URL must have a host".to_string()));
    }
    Ok(())
}

fn validate_secret(secret: &Secret) -> WebhookResult<()> {
    if secret.is_valid() {
        Ok(())
    } else {
        Err(WebhookError::InvalidSecret { min: MIN_SECRET_LEN })
    }
}

fn validate_events(events: &EventFilter) -> WebhookResult<()> {
    match events {
        EventFilter::All => Ok(()),
        EventFilter::Only(types) if types.is_empty() => Err(WebhookError::Validation(
            "at least one event type is required".to_string(),
        )),
        EventFilter::Only(types) if types.contains(&EventType::Test) => Err(
            WebhookError::Validation("the test event type cannot be subscribed to".to_string()),
        ),
        EventFilter::Only(_) => Ok(()),
    }
}
