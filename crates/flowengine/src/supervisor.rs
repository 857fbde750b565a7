//! Stuck execution reaper

use crate::config::SupervisorConfig;
use crate::store::ExecutionStore;
use chrono::Utc;
use flowcore::{
    CancelReason, EventBus, ExecutionEvent, ExecutionStatus, FlowError, StatusGuard, Transition,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Cancels executions that stayed `pending` or `running` for too long
pub struct Supervisor {
    store: Arc<dyn ExecutionStore>,
    event_bus: Arc<EventBus>,
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        event_bus: Arc<EventBus>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            store,
            event_bus,
            config,
        }
    }

    /// Cancel every active execution at least `threshold` old
    ///
    /// Running executions are aged from `started_at`, pending ones from
    /// `created_at`. Executions that change state between the scan and
    /// the cancel are skipped. Returns how many were cancelled.
    pub async fn sweep(&self, threshold: Duration) -> Result<usize, FlowError> {
        let threshold = chrono::Duration::from_std(threshold)
            .map_err(|e| FlowError::Config(format!("invalid stuck threshold: {}", e)))?;
        let now = Utc::now();
        let mut killed = 0;

        for execution in self.store.list_by_status(&ExecutionStatus::ACTIVE).await? {
            if execution.age(now) < threshold {
                continue;
            }

            let guard = StatusGuard::any_of(&[execution.status])
                .with_started_at(execution.started_at);
            match self
                .store
                .compare_and_set(execution.id, &guard, Transition::Cancel { at: now })
                .await
            {
                Ok(_) => {
                    tracing::warn!(
                        "Cancelled stuck execution {} ({} for {}s)",
                        execution.id,
                        execution.status,
                        execution.age(now).num_seconds()
                    );
                    self.event_bus.emit(ExecutionEvent::ExecutionCancelled {
                        execution_id: execution.id,
                        reason: CancelReason::Timeout,
                        timestamp: now,
                    });
                    killed += 1;
                }
                Err(FlowError::ConcurrencyConflict { actual, .. }) => {
                    tracing::debug!(
                        "Execution {} moved to {} during sweep, skipping",
                        execution.id,
                        actual
                    );
                }
                Err(FlowError::ExecutionNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(killed)
    }

    /// Sweep on the configured interval until `shutdown` fires
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let interval = self.config.interval();
            let threshold = self.config.stuck_threshold();
            tracing::info!(
                "Supervisor started (interval {}s, threshold {}s)",
                interval.as_secs(),
                threshold.as_secs()
            );

            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.cancelled() => {
                        tracing::info!("Supervisor stopped");
                        return;
                    }
                }

                match self.sweep(threshold).await {
                    Ok(0) => {}
                    Ok(killed) => tracing::info!("Supervisor cancelled {} stuck executions", killed),
                    Err(e) => tracing::error!("Supervisor sweep failed: {}", e),
                }
            }
        })
    }
}
