//! Bounded pool of running sagas.

use std::collections::HashMap;
use std::sync::Arc;

use common::SagaId;
use domain::OrderRequest;
use event_store::EventStore;
use tokio::sync::{Mutex, Semaphore, watch};

use crate::coordinator::{CancelSignal, SagaCoordinator};
use crate::error::{Result, SagaError};
use crate::gateway::{FundsService, MatchingService};

/// Runs sagas in the background, at most `max_concurrent` at a time.
///
/// Sagas share nothing but the coordinator; each one runs its steps in
/// sequence on its own task. Submitted sagas wait for a permit in
/// `Pending`.
pub struct SagaRunner<S, F, M> {
    coordinator: Arc<SagaCoordinator<S, F, M>>,
    permits: Arc<Semaphore>,
    max_concurrent: u32,
    shutdown: watch::Sender<bool>,
    cancels: Arc<Mutex<HashMap<SagaId, watch::Sender<bool>>>>,
}

impl<S, F, M> SagaRunner<S, F, M>
where
    S: EventStore + 'static,
    F: FundsService + 'static,
    M: MatchingService + 'static,
{
    pub fn new(coordinator: Arc<SagaCoordinator<S, F, M>>, max_concurrent: usize) -> Self {
        let max_concurrent = u32::try_from(max_concurrent.max(1)).unwrap_or(u32::MAX >> 3);
        let (shutdown, _) = watch::channel(false);
        Self {
            coordinator,
            permits: Arc::new(Semaphore::new(max_concurrent as usize)),
            max_concurrent,
            shutdown,
            cancels: Arc::default(),
        }
    }

    pub fn coordinator(&self) -> &Arc<SagaCoordinator<S, F, M>> {
        &self.coordinator
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sagas currently holding a permit.
    pub fn in_flight(&self) -> usize {
        (self.max_concurrent as usize).saturating_sub(self.permits.available_permits())
    }

    /// Records the saga as `Pending` and queues it for execution.
    ///
    /// Returns once the saga is in the log, before any step runs.
    pub async fn submit(&self, request: OrderRequest, saga_id: Option<SagaId>) -> Result<SagaId> {
        if self.is_shutting_down() {
            return Err(SagaError::ShuttingDown);
        }
        let saga_id = saga_id.unwrap_or_default();
        self.coordinator.start(saga_id, request).await?;
        self.spawn(saga_id).await;
        Ok(saga_id)
    }

    /// Asks a queued or running saga to stop at its next step boundary.
    ///
    /// Returns false when the saga is not running in this process.
    pub async fn cancel(&self, saga_id: SagaId) -> bool {
        match self.cancels.lock().await.get(&saga_id) {
            Some(sender) => {
                sender.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Queues every saga the log shows as unfinished. Returns how many.
    pub async fn recover(&self) -> Result<usize> {
        let incomplete = self.coordinator.incomplete_sagas().await?;
        let mut queued = 0;
        for saga_id in incomplete {
            if self.cancels.lock().await.contains_key(&saga_id) {
                continue;
            }
            self.spawn(saga_id).await;
            queued += 1;
        }
        if queued > 0 {
            tracing::info!(queued, "resuming incomplete sagas");
        }
        Ok(queued)
    }

    /// Stops taking sagas and waits for running ones to finish, including
    /// any compensation in progress. Queued sagas stay `Pending` for the
    /// next recovery.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        tracing::info!(in_flight = self.in_flight(), "waiting for running sagas");
        if let Ok(permits) = self.permits.acquire_many(self.max_concurrent).await {
            permits.forget();
        }
        self.permits.close();
        tracing::info!("saga runner stopped");
    }

    async fn spawn(&self, saga_id: SagaId) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.cancels.lock().await.insert(saga_id, cancel_tx);

        let coordinator = Arc::clone(&self.coordinator);
        let permits = Arc::clone(&self.permits);
        let cancels = Arc::clone(&self.cancels);
        let shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = wait_for_shutdown(shutdown.clone()) => None,
                permit = permits.acquire_owned() => permit.ok(),
            };

            let stopping = *shutdown.borrow();
            match permit {
                Some(_permit) if !stopping => {
                    match coordinator.resume(saga_id, CancelSignal::new(cancel_rx)).await {
                        Ok(outcome) if outcome.requires_attention() => {
                            tracing::error!(
                                %saga_id,
                                failures = outcome.compensation_failures.len(),
                                alert = true,
                                "saga finished with unresolved compensation"
                            );
                        }
                        Ok(outcome) => {
                            tracing::debug!(%saga_id, state = %outcome.state, "saga finished");
                        }
                        Err(e) => {
                            tracing::error!(%saga_id, error = %e, "saga stopped on error");
                        }
                    }
                }
                _ => {
                    tracing::info!(%saga_id, "shutting down; saga left for recovery");
                }
            }

            cancels.lock().await.remove(&saga_id);
        });
    }
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopping| *stopping).await;
}
