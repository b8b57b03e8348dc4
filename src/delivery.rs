use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DeliveryFailure;
use crate::retry::RetryPolicy;
use crate::types::{Event, EventId, EventType, SubscriptionId};

/// Unique identifier for a delivery ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryId(pub Uuid);

impl DeliveryId {
    pub fn generate() -> Self {
        DeliveryId(Uuid::new_v4())
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Wire envelope: `{"event": {...}}`.
#[derive(Serialize)]
struct Envelope<'a> {
    event: &'a Event,
}

/// Serialize an event into the payload stored on, and posted for, a delivery.
pub fn envelope(event: &Event) -> Result<serde_json::Value, serde_json::Error> {
    serde_json::to_value(Envelope { event })
}

/// Lifecycle of a delivery row.
///
/// ```text
/// Pending ──► Succeeded
///    │   ├──► RetryScheduled ──(sweeper)──► Pending
///    │   ├──► Exhausted
///    └───┴──► Abandoned
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeliveryState {
    /// Attempt in progress, or created and not yet attempted.
    Pending,
    Succeeded,
    RetryScheduled { at: DateTime<Utc> },
    /// Retry budget spent. Only an operator replay touches it again.
    Exhausted,
    /// Not retried: the subscription went away or the payload was unusable.
    Abandoned,
}

/// Final outcome of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { status: u16 },
    RetryScheduled { failure: DeliveryFailure, at: DateTime<Utc> },
    Exhausted { failure: DeliveryFailure },
    Skipped { failure: DeliveryFailure },
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }
}

/// What a single HTTP attempt produced.
#[derive(Debug, Clone, Default)]
pub struct AttemptRecord {
    pub request_headers: BTreeMap<String, String>,
    pub response_status: Option<u16>,
    pub response_headers: BTreeMap<String, String>,
    pub response_body: Option<String>,
    pub duration: Duration,
}

/// Ledger row: one event delivered (or not) to one subscription.
///
/// Created on the first attempt and updated in place on each retry.
/// `success` and `next_retry_at` mirror `state` so stores can index them;
/// they are only ever changed through the transition methods below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub id: DeliveryId,
    pub subscription_id: SubscriptionId,
    pub event_id: EventId,
    pub event_type: EventType,

    /// Serialized envelope, enough to replay without the original event.
    pub payload: serde_json::Value,

    pub request_headers: BTreeMap<String, String>,
    pub response_status: Option<u16>,
    pub response_headers: BTreeMap<String, String>,
    pub response_body: Option<String>,
    pub duration_ms: u64,

    pub success: bool,
    pub attempt_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub state: DeliveryState,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Delivery {
    pub fn new(
        subscription_id: SubscriptionId,
        event: &Event,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DeliveryId::generate(),
            subscription_id,
            event_id: event.id.clone(),
            event_type: event.event_type.clone(),
            payload,
            request_headers: BTreeMap::new(),
            response_status: None,
            response_headers: BTreeMap::new(),
            response_body: None,
            duration_ms: 0,
            success: false,
            attempt_count: 0,
            next_retry_at: None,
            last_error: None,
            state: DeliveryState::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    /// Due for an automatic retry at `now`.
    pub fn is_due(&self, now: DateTime<Utc>, max_attempts: u32) -> bool {
        match self.state {
            DeliveryState::RetryScheduled { at } => at <= now && self.attempt_count < max_attempts,
            _ => false,
        }
    }

    /// Move into `Pending` for a new attempt and count it.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.set_state(DeliveryState::Pending, now);
    }

    /// Record the result of the attempt started by `begin_attempt`.
    pub fn complete_attempt(
        &mut self,
        record: AttemptRecord,
        result: Result<u16, DeliveryFailure>,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> DeliveryOutcome {
        self.request_headers = record.request_headers;
        self.response_status = record.response_status;
        self.response_headers = record.response_headers;
        self.response_body = record.response_body;
        self.duration_ms = u64::try_from(record.duration.as_millis()).unwrap_or(u64::MAX);

        let failure = match result {
            Ok(status) => {
                self.last_error = None;
                self.set_state(DeliveryState::Succeeded, now);
                return DeliveryOutcome::Delivered { status };
            }
            Err(failure) => failure,
        };

        if !failure.is_retryable() {
            self.last_error = Some(failure.to_string());
            self.set_state(DeliveryState::Abandoned, now);
            return DeliveryOutcome::Skipped { failure };
        }

        match policy.next_retry_at(self.attempt_count, now) {
            Some(at) => {
                self.last_error = Some(failure.to_string());
                self.set_state(DeliveryState::RetryScheduled { at }, now);
                DeliveryOutcome::RetryScheduled { failure, at }
            }
            None => {
                let exhausted = DeliveryFailure::RetryBudgetExhausted {
                    attempts: self.attempt_count,
                };
                self.last_error = Some(format!("{failure}; {exhausted}"));
                self.set_state(DeliveryState::Exhausted, now);
                DeliveryOutcome::Exhausted { failure }
            }
        }
    }

    /// Stop retrying without another attempt.
    pub fn abandon(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.last_error = Some(reason.into());
        self.set_state(DeliveryState::Abandoned, now);
    }

    fn set_state(&mut self, state: DeliveryState, now: DateTime<Utc>) {
        self.success = matches!(state, DeliveryState::Succeeded);
        self.next_retry_at = match state {
            DeliveryState::RetryScheduled { at } => Some(at),
            _ => None,
        };
        self.state = state;
        self.updated_at = now;
    }
}
