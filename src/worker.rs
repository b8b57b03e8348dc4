use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::executor::DeliveryExecutor;
use crate::storage::SubscriptionStore;
use crate::types::Event;

/// Shared, read-only context for all workers.
pub(crate) struct WorkerContext {
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub executor: Arc<DeliveryExecutor>,

    /// Bounds deliveries running at once, across all events.
    pub in_flight: Arc<Semaphore>,
}

/// Main worker loop.
///
/// Each worker:
/// - Waits for the next event, or for shutdown
/// - Resolves matching subscriptions once, at dequeue time
/// - Starts one delivery per subscription without waiting for it
///
/// Shutdown stops dequeuing; deliveries already started keep running.
pub(crate) async fn worker_loop(
    worker_id: usize,
    queue: Arc<Mutex<mpsc::Receiver<Event>>>,
    ctx: Arc<WorkerContext>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = next_event(&queue) => event,
        };

        let Some(event) = event else { break };

        fan_out(event, &ctx).await;
    }

    tracing::debug!(target: "webhook_delivery", worker_id, "Webhook worker stopped");
}

async fn next_event(queue: &Mutex<mpsc::Receiver<Event>>) -> Option<Event> {
    let mut guard = queue.lock().await;
    guard.recv().await
}

/// Start a delivery for every subscription matching `event`.
///
/// Waits only for an in-flight permit, so a slow endpoint delays nobody
/// until the global bound is reached.
async fn fan_out(event: Event, ctx: &WorkerContext) {
    let subscriptions = match ctx.subscriptions.find_matching(&event.event_type).await {
        Ok(subscriptions) => subscriptions,
        Err(e) => {
            tracing::error!(
                target: "webhook_delivery",
                event_id = %event.id,
                event_type = %event.event_type,
                error = %e,
                "Failed to query matching subscriptions"
            );
            return;
        }
    };

    // Stores may filter loosely; membership is decided here, once.
    let subscriptions: Vec<_> = subscriptions
        .into_iter()
        .filter(|sub| sub.accepts(&event.event_type))
        .collect();

    if subscriptions.is_empty() {
        tracing::debug!(
            target: "webhook_delivery",
            event_id = %event.id,
            event_type = %event.event_type,
            "No active subscriptions match event type"
        );
        return;
    }

    tracing::info!(
        target: "webhook_delivery",
        event_id = %event.id,
        event_type = %event.event_type,
        subscription_count = subscriptions.len(),
        "Delivering event to matching subscriptions"
    );

    let event = Arc::new(event);
    for subscription in subscriptions {
        let Ok(permit) = ctx.in_flight.clone().acquire_owned().await else {
            return;
        };
        let executor = ctx.executor.clone();
        let event = event.clone();
        tokio::spawn(async move {
            let _permit = permit;
            executor.deliver(&subscription, &event).await;
        });
    }
}
