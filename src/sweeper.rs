use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::DispatcherConfig;
use crate::error::StoreError;
use crate::executor::DeliveryExecutor;
use crate::storage::{DeliveryLedger, SubscriptionStore};
use crate::telemetry::metric_inc;

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Rows found due.
    pub due: usize,
    /// Rows re-driven through the executor.
    pub attempted: usize,
    pub delivered: usize,
    /// Rows dropped because their subscription is gone or inactive.
    pub abandoned: usize,
}

/// Periodic re-driver of failed deliveries.
///
/// Assumes it is the only sweeper running against the ledger; two
/// sweepers could pick up the same due row.
pub struct RetrySweeper {
    executor: Arc<DeliveryExecutor>,
    subscriptions: Arc<dyn SubscriptionStore>,
    ledger: Arc<dyn DeliveryLedger>,
    in_flight: Arc<Semaphore>,
    interval: Duration,
    batch_size: usize,
}

impl RetrySweeper {
    pub fn new(
        executor: Arc<DeliveryExecutor>,
        subscriptions: Arc<dyn SubscriptionStore>,
        ledger: Arc<dyn DeliveryLedger>,
        config: &DispatcherConfig,
    ) -> Self {
        Self {
            executor,
            subscriptions,
            ledger,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            interval: config.sweep_interval(),
            batch_size: config.sweep_batch_size.max(1),
        }
    }

    /// Share the worker pool's in-flight bound.
    pub(crate) fn with_in_flight(mut self, in_flight: Arc<Semaphore>) -> Self {
        self.in_flight = in_flight;
        self
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Sweep every interval until `shutdown` fires.
    ///
    /// A sweep always finishes its batch before the next tick, so a row is
    /// never re-driven while its previous attempt is still running.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.sweep_once(Utc::now()).await {
                Ok(report) if report.due > 0 => {
                    tracing::info!(
                        target: "webhook_delivery",
                        due = report.due,
                        attempted = report.attempted,
                        delivered = report.delivered,
                        abandoned = report.abandoned,
                        "Retry sweep finished"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(
                        target: "webhook_delivery",
                        error = %e,
                        "Retry sweep failed to query the delivery ledger"
                    );
                }
            }
        }

        tracing::debug!(target: "webhook_delivery", "Retry sweeper stopped");
    }

    /// Re-drive every delivery due at `now`, waiting for all of them.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        metric_inc("webhook.sweep.runs");

        let max_attempts = self.executor.policy().max_attempts;
        let due = self
            .ledger
            .due_retries(now, max_attempts, self.batch_size)
            .await?;

        let mut report = SweepReport {
            due: due.len(),
            ..SweepReport::default()
        };
        let mut attempts = JoinSet::new();

        for mut delivery in due {
            let subscription = match self.subscriptions.get(delivery.subscription_id).await {
                Ok(subscription) => subscription,
                Err(e) => {
                    tracing::error!(
                        target: "webhook_delivery",
                        delivery_id = %delivery.id,
                        subscription_id = %delivery.subscription_id,
                        error = %e,
                        "Failed to load subscription for retry"
                    );
                    continue;
                }
            };

            let subscription = match subscription {
                Some(sub) if sub.is_deliverable() => sub,
                other => {
                    let reason = if other.is_some() {
                        "subscription inactive or deleted"
                    } else {
                        "subscription not found"
                    };
                    tracing::info!(
                        target: "webhook_delivery",
                        delivery_id = %delivery.id,
                        subscription_id = %delivery.subscription_id,
                        reason,
                        "Abandoning retry"
                    );
                    delivery.abandon(reason, now);
                    if let Err(e) = self.ledger.update(&delivery).await {
                        tracing::error!(
                            target: "webhook_delivery",
                            delivery_id = %delivery.id,
                            error = %e,
                            "Failed to mark delivery abandoned"
                        );
                    }
                    metric_inc("webhook.sweep.abandoned");
                    report.abandoned += 1;
                    continue;
                }
            };

            let Ok(permit) = self.in_flight.clone().acquire_owned().await else {
                break;
            };
            let executor = self.executor.clone();
            report.attempted += 1;
            attempts.spawn(async move {
                let _permit = permit;
                executor.redeliver(&subscription, delivery).await
            });
        }

        while let Some(joined) = attempts.join_next().await {
            match joined {
                Ok(result) if result.outcome.is_delivered() => report.delivered += 1,
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(
                        target: "webhook_delivery",
                        error = %e,
                        "Retry attempt task failed"
                    );
                }
            }
        }

        Ok(report)
    }
}
