use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::delivery::{Delivery, DeliveryId};
use crate::error::StoreError;
use crate::types::{EventType, Owner, Subscription, SubscriptionId};

/// Per-subscription statistics update applied after every attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptStats {
    pub at: DateTime<Utc>,
    pub success: bool,
    pub status: Option<u16>,
    pub error: Option<String>,
}

/// Persisted registry of webhook endpoints.
///
/// Implementations must make each method atomic for the row it touches;
/// nothing here needs multi-row transactions.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn insert(&self, subscription: &Subscription) -> Result<(), StoreError>;

    /// Fetch by id, soft-deleted rows included.
    async fn get(&self, id: SubscriptionId) -> Result<Option<Subscription>, StoreError>;

    /// Replace the configuration of an existing row. Returns `false` if absent.
    async fn update(&self, subscription: &Subscription) -> Result<bool, StoreError>;

    /// Active, not deleted, and with a filter matching `event_type`.
    async fn find_matching(&self, event_type: &EventType) -> Result<Vec<Subscription>, StoreError>;

    /// Non-deleted subscriptions of one owner.
    async fn list_by_owner(&self, owner: Owner) -> Result<Vec<Subscription>, StoreError>;

    /// Bump counters and last-status fields. Returns `false` if absent.
    async fn record_attempt(&self, id: SubscriptionId, stats: &AttemptStats) -> Result<bool, StoreError>;
}

/// Persisted log of delivery attempts.
#[async_trait]
pub trait DeliveryLedger: Send + Sync {
    async fn create(&self, delivery: &Delivery) -> Result<(), StoreError>;

    /// Overwrite an existing row. Returns `false` if absent.
    async fn update(&self, delivery: &Delivery) -> Result<bool, StoreError>;

    async fn get(&self, id: DeliveryId) -> Result<Option<Delivery>, StoreError>;

    /// Newest first.
    async fn list_for_subscription(
        &self,
        subscription_id: SubscriptionId,
        limit: usize,
    ) -> Result<Vec<Delivery>, StoreError>;

    /// Rows with `success = false AND attempt_count < max_attempts AND
    /// next_retry_at <= now`, oldest due first.
    async fn due_retries(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<Delivery>, StoreError>;
}

/// In-memory subscription registry for embedded deployments and tests.
#[derive(Default)]
pub struct InMemorySubscriptionStore {
    rows: Mutex<HashMap<SubscriptionId, Subscription>>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn insert(&self, subscription: &Subscription) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().await;
        if rows.contains_key(&subscription.id) {
            return Err(StoreError::Conflict(subscription.id.to_string()));
        }
        rows.insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn get(&self, id: SubscriptionId) -> Result<Option<Subscription>, StoreError> {
        Ok(self.rows.lock().await.get(&id).cloned())
    }

    async fn update(&self, subscription: &Subscription) -> Result<bool, StoreError> {
        let mut rows = self.rows.lock().await;
        let Some(row) = rows.get_mut(&subscription.id) else {
            return Ok(false);
        };
        // Statistics are owned by `record_attempt`.
        let mut updated = subscription.clone();
        updated.last_delivered_at = row.last_delivered_at;
        updated.last_status = row.last_status;
        updated.last_error = row.last_error.clone();
        updated.delivery_count = row.delivery_count;
        updated.failure_count = row.failure_count;
        *row = updated;
        Ok(true)
    }

    async fn find_matching(&self, event_type: &EventType) -> Result<Vec<Subscription>, StoreError> {
        let rows = self.rows.lock().await;
        let mut matching: Vec<Subscription> = rows
            .values()
            .filter(|sub| sub.accepts(event_type))
            .cloned()
            .collect();
        matching.sort_by_key(|sub| sub.created_at);
        Ok(matching)
    }

    async fn list_by_owner(&self, owner: Owner) -> Result<Vec<Subscription>, StoreError> {
        let rows = self.rows.lock().await;
        let mut owned: Vec<Subscription> = rows
            .values()
            .filter(|sub| sub.owner == owner && sub.deleted_at.is_none())
            .cloned()
            .collect();
        owned.sort_by_key(|sub| sub.created_at);
        Ok(owned)
    }

    async fn record_attempt(&self, id: SubscriptionId, stats: &AttemptStats) -> Result<bool, StoreError> {
        let mut rows = self.rows.lock().await;
        let Some(row) = rows.get_mut(&id) else {
            return Ok(false);
        };
        row.delivery_count += 1;
        if !stats.success {
            row.failure_count += 1;
        }
        row.last_delivered_at = Some(stats.at);
        row.last_status = stats.status;
        row.last_error = stats.error.clone();
        Ok(true)
    }
}

/// In-memory delivery ledger for embedded deployments and tests.
#[derive(Default)]
pub struct InMemoryDeliveryLedger {
    rows: Mutex<HashMap<DeliveryId, Delivery>>,
}

impl InMemoryDeliveryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every row, oldest first.
    pub async fn snapshot(&self) -> Vec<Delivery> {
        let rows = self.rows.lock().await;
        let mut all: Vec<Delivery> = rows.values().cloned().collect();
        all.sort_by_key(|d| d.created_at);
        all
    }
}

#[async_trait]
impl DeliveryLedger for InMemoryDeliveryLedger {
    async fn create(&self, delivery: &Delivery) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().await;
        if rows.contains_key(&delivery.id) {
            return Err(StoreError::Conflict(delivery.id.to_string()));
        }
        rows.insert(delivery.id, delivery.clone());
        Ok(())
    }

    async fn update(&self, delivery: &Delivery) -> Result<bool, StoreError> {
        let mut rows = self.rows.lock().await;
        match rows.get_mut(&delivery.id) {
            Some(row) => {
                *row = delivery.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get(&self, id: DeliveryId) -> Result<Option<Delivery>, StoreError> {
        Ok(self.rows.lock().await.get(&id).cloned())
    }

    async fn list_for_subscription(
        &self,
        subscription_id: SubscriptionId,
        limit: usize,
    ) -> Result<Vec<Delivery>, StoreError> {
        let rows = self.rows.lock().await;
        let mut history: Vec<Delivery> = rows
            .values()
            .filter(|d| d.subscription_id == subscription_id)
            .cloned()
            .collect();
        history.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        history.truncate(limit);
        Ok(history)
    }

    async fn due_retries(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<Delivery>, StoreError> {
        let rows = self.rows.lock().await;
        let mut due: Vec<Delivery> = rows
            .values()
            .filter(|d| {
                !d.success
                    && d.attempt_count < max_attempts
                    && d.next_retry_at.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect();
        due.sort_by_key(|d| d.next_retry_at);
        due.truncate(limit);
        Ok(due)
    }
}
