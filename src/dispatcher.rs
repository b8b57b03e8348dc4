use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{DispatchError, WebhookError};
use crate::executor::DeliveryExecutor;
use crate::retry::RetryPolicy;
use crate::storage::{
    DeliveryLedger, InMemoryDeliveryLedger, InMemorySubscriptionStore, SubscriptionStore,
};
use crate::subscriptions::SubscriptionService;
use crate::sweeper::RetrySweeper;
use crate::telemetry::{metric_inc, metric_inc_event};
use crate::types::{Actor, Event, EventId, EventType};
use crate::worker::{worker_loop, WorkerContext};

/// Tunables for the whole delivery subsystem.
///
/// Deserializable so hosts can embed it in their own configuration file;
/// missing keys fall back to the defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Bounded event queue size. `notify` fails fast beyond it.
    pub queue_capacity: usize,
    pub worker_count: usize,
    /// Upper bound on concurrent HTTP deliveries across workers and sweeper.
    pub max_in_flight: usize,
    pub request_timeout_ms: u64,
    /// Response bytes kept per attempt; the rest is never read.
    pub max_response_bytes: usize,
    pub retry_base_delay_secs: u64,
    /// Total attempts per delivery, the first one included.
    pub max_attempts: u32,
    pub sweep_interval_secs: u64,
    pub sweep_batch_size: usize,
    /// Run the retry sweeper inside the dispatcher.
    pub sweeper_enabled: bool,
    pub user_agent: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1_000,
            worker_count: 5,
            max_in_flight: 64,
            request_timeout_ms: 30_000,
            max_response_bytes: 10 * 1024,
            retry_base_delay_secs: 5 * 60,
            max_attempts: 4,
            sweep_interval_secs: 60,
            sweep_batch_size: 100,
            sweeper_enabled: true,
            user_agent: concat!("gist-webhooks/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl DispatcherConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(self.retry_base_delay_secs), self.max_attempts)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Entry point of the webhook subsystem.
///
/// Owns the bounded event queue, the worker pool and the retry sweeper.
/// Collaborators raise events with [`Dispatcher::notify`]; everything after
/// the enqueue is fire-and-forget from their point of view.
pub struct Dispatcher {
    queue_tx: mpsc::Sender<Event>,
    /// Held so the queue stays open even with zero workers.
    queue_rx: Option<Arc<Mutex<mpsc::Receiver<Event>>>>,
    shutdown: CancellationToken,
    worker_handles: Vec<JoinHandle<()>>,
    sweeper_handle: Option<JoinHandle<()>>,
    in_flight: Arc<Semaphore>,
    executor: Arc<DeliveryExecutor>,
    subscriptions: Arc<dyn SubscriptionStore>,
    ledger: Arc<dyn DeliveryLedger>,
    config: DispatcherConfig,
}

impl Dispatcher {
    /// Dispatcher backed by in-memory stores.
    pub fn new(config: DispatcherConfig) -> Result<Self, WebhookError> {
        Self::new_with_stores(
            config,
            Arc::new(InMemorySubscriptionStore::new()),
            Arc::new(InMemoryDeliveryLedger::new()),
        )
    }

    /// Must be called from within a tokio runtime: workers start immediately.
    pub fn new_with_stores(
        config: DispatcherConfig,
        subscriptions: Arc<dyn SubscriptionStore>,
        ledger: Arc<dyn DeliveryLedger>,
    ) -> Result<Self, WebhookError> {
        let executor = Arc::new(DeliveryExecutor::new(
            &config,
            subscriptions.clone(),
            ledger.clone(),
        )?);

        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        let shutdown = CancellationToken::new();
        let in_flight = Arc::new(Semaphore::new(config.max_in_flight.max(1)));

        let ctx = Arc::new(WorkerContext {
            subscriptions: subscriptions.clone(),
            executor: executor.clone(),
            in_flight: in_flight.clone(),
        });

        let worker_handles = (0..config.worker_count)
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    queue_rx.clone(),
                    ctx.clone(),
                    shutdown.clone(),
                ))
            })
            .collect();

        let sweeper_handle = config.sweeper_enabled.then(|| {
            RetrySweeper::new(executor.clone(), subscriptions.clone(), ledger.clone(), &config)
                .with_in_flight(in_flight.clone())
                .spawn(shutdown.clone())
        });

        tracing::info!(
            target: "webhook_delivery",
            workers = config.worker_count,
            queue_capacity = config.queue_capacity,
            max_in_flight = config.max_in_flight,
            sweeper = config.sweeper_enabled,
            "Webhook dispatcher started"
        );

        Ok(Self {
            queue_tx,
            queue_rx: Some(queue_rx),
            shutdown,
            worker_handles,
            sweeper_handle,
            in_flight,
            executor,
            subscriptions,
            ledger,
            config,
        })
    }

    /// Raise a domain event.
    ///
    /// Never blocks: when the queue is full the event is dropped and
    /// `QueueSaturated` is returned. A `None` actor means the system.
    pub fn notify(
        &self,
        event_type: EventType,
        actor: Option<Actor>,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> Result<EventId, DispatchError> {
        let event_type = event_type.canonical();
        if !event_type.is_emittable() {
            return Err(DispatchError::InvalidEventType(event_type.to_string()));
        }
        if self.shutdown.is_cancelled() {
            return Err(DispatchError::Shutdown);
        }

        let event = Event::new(event_type, actor.unwrap_or_else(Actor::system), data);
        let event_id = event.id.clone();

        match self.queue_tx.try_send(event) {
            Ok(()) => {
                metric_inc("webhook.notify.enqueued");
                Ok(event_id)
            }
            Err(mpsc::error::TrySendError::Full(event)) => {
                metric_inc("webhook.notify.saturated");
                metric_inc_event("webhook.notify.saturated.event", &event.event_type);
                tracing::warn!(
                    target: "webhook_delivery",
                    event_id = %event.id,
                    event_type = %event.event_type,
                    capacity = self.config.queue_capacity,
                    "Webhook queue saturated, event dropped"
                );
                Err(DispatchError::QueueSaturated)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DispatchError::Shutdown),
        }
    }

    /// `notify` for callers holding the type as a string.
    pub fn notify_named(
        &self,
        event_type: &str,
        actor: Option<Actor>,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> Result<EventId, DispatchError> {
        self.notify(event_type.parse()?, actor, data)
    }

    /// Management surface sharing this dispatcher's stores and executor.
    pub fn subscriptions(&self) -> SubscriptionService {
        SubscriptionService::new(
            self.subscriptions.clone(),
            self.ledger.clone(),
            self.executor.clone(),
        )
    }

    pub fn executor(&self) -> Arc<DeliveryExecutor> {
        self.executor.clone()
    }

    pub fn ledger(&self) -> Arc<dyn DeliveryLedger> {
        self.ledger.clone()
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Events waiting in the queue.
    pub fn queued(&self) -> usize {
        self.queue_tx.max_capacity() - self.queue_tx.capacity()
    }

    /// Stop dequeuing, stop the sweeper, then wait for in-flight deliveries
    /// to finish on their own (each is bounded by the request timeout).
    ///
    /// Events still queued are dropped.
    pub async fn shutdown(&mut self) {
        self.shutdown.cancel();

        for handle in self.worker_handles.drain(..) {
            let _ = handle.await;
        }
        if let Some(handle) = self.sweeper_handle.take() {
            let _ = handle.await;
        }
        self.queue_rx.take();

        let permits = u32::try_from(self.config.max_in_flight.max(1)).unwrap_or(u32::MAX);
        if let Ok(all) = self.in_flight.acquire_many(permits).await {
            drop(all);
        }

        tracing::info!(
            target: "webhook_delivery",
            dropped = self.queued(),
            "Webhook dispatcher stopped"
        );
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
