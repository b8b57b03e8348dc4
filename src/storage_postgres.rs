use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::{Client, Row};

use crate::delivery::{Delivery, DeliveryId};
use crate::error::StoreError;
use crate::storage::{AttemptStats, DeliveryLedger, SubscriptionStore};
use crate::types::{EventType, Owner, Secret, Subscription, SubscriptionId};

/// Postgres-backed subscription registry and delivery ledger.
///
/// Rows are stored as JSONB next to the columns the queries filter on.
/// Subscription statistics live in their own columns so `record_attempt`
/// is a single atomic `UPDATE`, and the secret has its own column because
/// it never serializes.
pub struct PostgresStore {
    client: Client,
}

const SUBSCRIPTION_COLUMNS: &str = "payload, secret, delivery_count, failure_count, \
     last_delivered_at, last_status, last_error";

impl PostgresStore {
    /// Wrap a connected client, creating the tables if needed.
    pub async fn new(client: Client) -> Result<Self, StoreError> {
        client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS webhook_subscriptions (
                    id TEXT PRIMARY KEY,
                    owner TEXT NOT NULL,
                    secret TEXT NOT NULL DEFAULT '',
                    active BOOLEAN NOT NULL,
                    deleted_at TIMESTAMPTZ,
                    created_at TIMESTAMPTZ NOT NULL,
                    delivery_count BIGINT NOT NULL DEFAULT 0,
                    failure_count BIGINT NOT NULL DEFAULT 0,
                    last_delivered_at TIMESTAMPTZ,
                    last_status INTEGER,
                    last_error TEXT,
                    payload JSONB NOT NULL
                );
                CREATE INDEX IF NOT EXISTS webhook_subscriptions_owner
                    ON webhook_subscriptions (owner);
                CREATE TABLE IF NOT EXISTS webhook_deliveries (
                    id TEXT PRIMARY KEY,
                    subscription_id TEXT NOT NULL,
                    success BOOLEAN NOT NULL,
                    attempt_count INTEGER NOT NULL,
                    next_retry_at TIMESTAMPTZ,
                    created_at TIMESTAMPTZ NOT NULL,
                    payload JSONB NOT NULL
                );
                CREATE INDEX IF NOT EXISTS webhook_deliveries_due
                    ON webhook_deliveries (next_retry_at)
                    WHERE success = FALSE AND next_retry_at IS NOT NULL;
                CREATE INDEX IF NOT EXISTS webhook_deliveries_subscription
                    ON webhook_deliveries (subscription_id, created_at DESC);",
            )
            .await?;

        Ok(Self { client })
    }

    fn owner_key(owner: Owner) -> String {
        match owner {
            Owner::User(id) => format!("user:{id}"),
            Owner::Organization(id) => format!("organization:{id}"),
        }
    }

    fn subscription_from_row(row: &Row) -> Result<Subscription, StoreError> {
        let payload: serde_json::Value = row.try_get("payload")?;
        let mut subscription: Subscription = serde_json::from_value(payload)?;

        let secret: String = row.try_get("secret")?;
        let delivery_count: i64 = row.try_get("delivery_count")?;
        let failure_count: i64 = row.try_get("failure_count")?;
        let last_status: Option<i32> = row.try_get("last_status")?;

        subscription.secret = Secret::new(secret);
        subscription.delivery_count = u64::try_from(delivery_count).unwrap_or_default();
        subscription.failure_count = u64::try_from(failure_count).unwrap_or_default();
        subscription.last_delivered_at = row.try_get("last_delivered_at")?;
        subscription.last_status = last_status.and_then(|s| u16::try_from(s).ok());
        subscription.last_error = row.try_get("last_error")?;
        Ok(subscription)
    }

    fn delivery_from_row(row: &Row) -> Result<Delivery, StoreError> {
        let payload: serde_json::Value = row.try_get("payload")?;
        Ok(serde_json::from_value(payload)?)
    }
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl SubscriptionStore for PostgresStore {
    async fn insert(&self, subscription: &Subscription) -> Result<(), StoreError> {
        let payload = serde_json::to_value(subscription)?;
        let inserted = self
            .client
            .execute(
                "INSERT INTO webhook_subscriptions
                    (id, owner, secret, active, deleted_at, created_at, payload)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (id) DO NOTHING",
                &[
                    &subscription.id.to_string(),
                    &Self::owner_key(subscription.owner),
                    &subscription.secret.expose(),
                    &subscription.active,
                    &subscription.deleted_at,
                    &subscription.created_at,
                    &payload,
                ],
            )
            .await?;

        if inserted == 0 {
            return Err(StoreError::Conflict(subscription.id.to_string()));
        }
        Ok(())
    }

    async fn get(&self, id: SubscriptionId) -> Result<Option<Subscription>, StoreError> {
        let row = self
            .client
            .query_opt(
                &format!("SELECT {SUBSCRIPTION_COLUMNS} FROM webhook_subscriptions WHERE id = $1"),
                &[&id.to_string()],
            )
            .await?;

        row.as_ref().map(Self::subscription_from_row).transpose()
    }

    async fn update(&self, subscription: &Subscription) -> Result<bool, StoreError> {
        let payload = serde_json::to_value(subscription)?;
        let updated = self
            .client
            .execute(
                "UPDATE webhook_subscriptions
                 SET owner = $2, secret = $3, active = $4, deleted_at = $5, payload = $6
                 WHERE id = $1",
                &[
                    &subscription.id.to_string(),
                    &Self::owner_key(subscription.owner),
                    &subscription.secret.expose(),
                    &subscription.active,
                    &subscription.deleted_at,
                    &payload,
                ],
            )
            .await?;
        Ok(updated > 0)
    }

    async fn find_matching(&self, event_type: &EventType) -> Result<Vec<Subscription>, StoreError> {
        let rows = self
            .client
            .query(
                &format!(
                    "SELECT {SUBSCRIPTION_COLUMNS} FROM webhook_subscriptions
                     WHERE active AND deleted_at IS NULL
                     ORDER BY created_at"
                ),
                &[],
            )
            .await?;

        let mut matching = Vec::new();
        for row in &rows {
            let subscription = Self::subscription_from_row(row)?;
            if subscription.accepts(event_type) {
                matching.push(subscription);
            }
        }
        Ok(matching)
    }

    async fn list_by_owner(&self, owner: Owner) -> Result<Vec<Subscription>, StoreError> {
        let rows = self
            .client
            .query(
                &format!(
                    "SELECT {SUBSCRIPTION_COLUMNS} FROM webhook_subscriptions
                     WHERE owner = $1 AND deleted_at IS NULL
                     ORDER BY created_at"
                ),
                &[&Self::owner_key(owner)],
            )
            .await?;

        rows.iter().map(Self::subscription_from_row).collect()
    }

    async fn record_attempt(&self, id: SubscriptionId, stats: &AttemptStats) -> Result<bool, StoreError> {
        let status = stats.status.map(i32::from);
        let updated = self
            .client
            .execute(
                "UPDATE webhook_subscriptions
                 SET delivery_count = delivery_count + 1,
                     failure_count = failure_count + CASE WHEN $2 THEN 0 ELSE 1 END,
                     last_delivered_at = $3,
                     last_status = $4,
                     last_error = $5
                 WHERE id = $1",
                &[&id.to_string(), &stats.success, &stats.at, &status, &stats.error],
            )
            .await?;
        Ok(updated > 0)
    }
}

#[async_trait]
impl DeliveryLedger for PostgresStore {
    async fn create(&self, delivery: &Delivery) -> Result<(), StoreError> {
        let payload = serde_json::to_value(delivery)?;
        let inserted = self
            .client
            .execute(
                "INSERT INTO webhook_deliveries
                    (id, subscription_id, success, attempt_count, next_retry_at, created_at, payload)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (id) DO NOTHING",
                &[
                    &delivery.id.to_string(),
                    &delivery.subscription_id.to_string(),
                    &delivery.success,
                    &to_i32(delivery.attempt_count),
                    &delivery.next_retry_at,
                    &delivery.created_at,
                    &payload,
                ],
            )
            .await?;

        if inserted == 0 {
            return Err(StoreError::Conflict(delivery.id.to_string()));
        }
        Ok(())
    }

    async fn update(&self, delivery: &Delivery) -> Result<bool, StoreError> {
        let payload = serde_json::to_value(delivery)?;
        let updated = self
            .client
            .execute(
                "UPDATE webhook_deliveries
                 SET success = $2, attempt_count = $3, next_retry_at = $4, payload = $5
                 WHERE id = $1",
                &[
                    &delivery.id.to_string(),
                    &delivery.success,
                    &to_i32(delivery.attempt_count),
                    &delivery.next_retry_at,
                    &payload,
                ],
            )
            .await?;
        Ok(updated > 0)
    }

    async fn get(&self, id: DeliveryId) -> Result<Option<Delivery>, StoreError> {
        let row = self
            .client
            .query_opt(
                "SELECT payload FROM webhook_deliveries WHERE id = $1",
                &[&id.to_string()],
            )
            .await?;

        row.as_ref().map(Self::delivery_from_row).transpose()
    }

    async fn list_for_subscription(
        &self,
        subscription_id: SubscriptionId,
        limit: usize,
    ) -> Result<Vec<Delivery>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT payload FROM webhook_deliveries
                 WHERE subscription_id = $1
                 ORDER BY created_at DESC
                 LIMIT $2",
                &[&subscription_id.to_string(), &to_i64(limit)],
            )
            .await?;

        rows.iter().map(Self::delivery_from_row).collect()
    }

    async fn due_retries(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<Delivery>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT payload FROM webhook_deliveries
                 WHERE success = FALSE
                   AND attempt_count < $2
                   AND next_retry_at IS NOT NULL
                   AND next_retry_at <= $1
                 ORDER BY next_retry_at
                 LIMIT $3",
                &[&now, &to_i32(max_attempts), &to_i64(limit)],
            )
            .await?;

        rows.iter().map(Self::delivery_from_row).collect()
    }
}
