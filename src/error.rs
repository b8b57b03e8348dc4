use thiserror::Error;

/// Errors returned when handing an event to the dispatcher.
///
/// These are the only webhook errors a triggering caller ever sees;
/// delivery failures stay inside the subsystem and end up in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// Event queue is full.
    /// The event was not enqueued; retrying is up to the caller.
    #[error("webhook event queue is saturated")]
    QueueSaturated,

    /// Dispatcher has been shut down.
    #[error("webhook dispatcher is shut down")]
    Shutdown,

    /// Event type was empty, the wildcard, or otherwise not emittable.
    #[error("invalid event type: {0:?}")]
    InvalidEventType(String),
}

/// Why a single delivery attempt did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryFailure {
    /// DNS, connect, TLS or body read failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Request exceeded the configured timeout.
    #[error("request timed out")]
    Timeout,

    /// Endpoint answered with a non-2xx status.
    #[error("endpoint returned HTTP {0}")]
    Http(u16),

    /// Payload or request could not be built. Never retried.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The attempt failed and no retry budget is left.
    #[error("retry budget exhausted after {attempts} attempts")]
    RetryBudgetExhausted { attempts: u32 },
}

impl DeliveryFailure {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeliveryFailure::Transport(_) | DeliveryFailure::Timeout | DeliveryFailure::Http(_)
        )
    }
}

/// Errors surfaced by subscription and ledger stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("stored record could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("record already exists: {0}")]
    Conflict(String),
}

#[cfg(feature = "postgres")]
impl From<tokio_postgres::Error> for StoreError {
    fn from(err: tokio_postgres::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Errors returned by the subscription management surface.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("webhook secret must be empty or at least {min} bytes")]
    InvalidSecret { min: usize },

    #[error("subscription not found")]
    SubscriptionNotFound,

    #[error("delivery not found")]
    DeliveryNotFound,

    #[error("test delivery failed: {0}")]
    TestDeliveryFailed(DeliveryFailure),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("HTTP client could not be built: {0}")]
    HttpClient(String),
}

pub type WebhookResult<T> = Result<T, WebhookError>;
