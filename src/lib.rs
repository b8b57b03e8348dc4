//! Outbound webhook delivery for a gist-hosting service.
//!
//! Collaborators raise domain events through [`Dispatcher::notify`]. Every
//! active subscription whose filter matches receives a signed HTTP POST.
//! Each attempt is recorded in a delivery ledger and failures are retried
//! by a background sweeper on a quadratic backoff.
//!
//! ## Guarantees
//! - `notify` never blocks: a full queue rejects the event
//! - Bounded number of deliveries in flight
//! - One slow endpoint never delays delivery to another
//! - At-least-once delivery within the retry budget
//! - Every attempt is recorded, successful or not
//!
//! ## Non-Guarantees
//! - Exactly-once delivery
//! - Ordering between events
//! - Delivery of events still queued at shutdown
//! - More than one sweeper per delivery ledger
//!
//! Persistence is pluggable: the in-memory stores suit tests and embedded
//! use, the `postgres` feature adds a durable backend.

mod delivery;
mod dispatcher;
mod error;
mod executor;
mod retry;
mod signing;
mod storage;
mod subscriptions;
mod sweeper;
mod telemetry;
mod types;
mod worker;

#[cfg(feature = "postgres")]
mod storage_postgres;

pub use delivery::{envelope, AttemptRecord, Delivery, DeliveryId, DeliveryOutcome, DeliveryState};
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error::{DeliveryFailure, DispatchError, StoreError, WebhookError, WebhookResult};
pub use executor::{DeliveryExecutor, DeliveryResult, DELIVERY_ID_HEADER, EVENT_TYPE_HEADER};
pub use retry::RetryPolicy;
pub use signing::{
    sign,
    signature_headers,
    verify,
    verify_webhook_request,
    VerificationError,
    SIGNATURE_256_HEADER,
    SIGNATURE_HEADER,
    SIGNATURE_PREFIX,
};
pub use storage::{
    AttemptStats,
    DeliveryLedger,
    InMemoryDeliveryLedger,
    InMemorySubscriptionStore,
    SubscriptionStore,
};
pub use subscriptions::{validate_url, SubscriptionService, MAX_HISTORY_PAGE};
pub use sweeper::{RetrySweeper, SweepReport};
pub use types::{
    Actor,
    ActorKind,
    ContentType,
    Event,
    EventFilter,
    EventId,
    EventType,
    NewSubscription,
    Owner,
    Secret,
    Subscription,
    SubscriptionId,
    SubscriptionPatch,
    MIN_SECRET_LEN,
    WILDCARD,
};

#[cfg(feature = "postgres")]
pub use storage_postgres::PostgresStore;
