//! Live view of running batches, derived from bus events.
//!
//! State is ephemeral: it is rebuilt from events and never persisted. The
//! tracker assumes events of one batch arrive in publish order.

use crate::events::{DomainEvent, EventBus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Finished batches are dropped from the map, so only live states exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Running,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchState {
    pub batch_id: String,
    pub status: BatchStatus,
    pub total_units: usize,
    pub completed_units: usize,
    pub failed_units: usize,
    pub progress_percent: f64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Apply one event to the state map
pub fn reduce(states: &mut HashMap<String, BatchState>, event: &DomainEvent) {
    match event {
        DomainEvent::BatchStarted(e) => {
            states.insert(
                e.batch_id.clone(),
                BatchState {
                    batch_id: e.batch_id.clone(),
                    status: BatchStatus::Running,
                    total_units: e.total_units,
                    completed_units: 0,
                    failed_units: 0,
                    progress_percent: 0.0,
                    started_at: e.at,
                    updated_at: e.at,
                },
            );
        }
        DomainEvent::BatchProgressed(e) => {
            if let Some(state) = states.get_mut(&e.batch_id) {
                state.total_units = e.total_units;
                state.completed_units = e.completed_units;
                state.failed_units = e.failed_units;
                state.progress_percent = e.progress_percent;
                state.updated_at = e.at;
            }
        }
        DomainEvent::BatchPaused(e) => {
            if let Some(state) = states.get_mut(&e.batch_id) {
                state.status = BatchStatus::Paused;
                state.updated_at = e.at;
            }
        }
        DomainEvent::BatchResumed(e) => {
            if let Some(state) = states.get_mut(&e.batch_id) {
                state.status = BatchStatus::Running;
                state.updated_at = e.at;
            }
        }
        DomainEvent::BatchCompleted(_) | DomainEvent::BatchFailed(_) | DomainEvent::BatchCancelled(_) => {
            if let Some(batch_id) = event.batch_id() {
                states.remove(batch_id);
            }
        }
        DomainEvent::TranslationsSaved(_)
        | DomainEvent::TranslationsImported(_)
        | DomainEvent::ProjectProgressChanged(_) => {}
    }
}

/// Actor that folds bus events into a shared state map.
#[derive(Debug)]
pub struct BatchStateTracker {
    states: Arc<RwLock<HashMap<String, BatchState>>>,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl BatchStateTracker {
    /// Subscribe to `bus` and start tracking. Must be called inside a tokio runtime.
    pub fn spawn(bus: &EventBus) -> Self {
        let states: Arc<RwLock<HashMap<String, BatchState>>> = Arc::new(RwLock::new(HashMap::new()));
        let shutdown = CancellationToken::new();
        let mut receiver = bus.receiver();

        let task_states = states.clone();
        let task_shutdown = shutdown.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_shutdown.cancelled() => break,
                    received = receiver.recv() => match received {
                        Ok(event) => {
                            let mut states = task_states.write().await;
                            reduce(&mut states, &event);
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("Batch state tracker lagged, skipped {} events", skipped);
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!("Batch state tracker stopped");
        });

        info!("Batch state tracker started");
        Self {
            states,
            shutdown,
            handle,
        }
    }

    pub async fn get(&self, batch_id: &str) -> Option<BatchState> {
        self.states.read().await.get(batch_id).cloned()
    }

    /// States of every batch that has started and not yet finished
    pub async fn active(&self) -> Vec<BatchState> {
        let mut active: Vec<BatchState> = self.states.read().await.values().cloned().collect();
        active.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        active
    }

    /// Stop consuming events and wait for the actor to exit
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.handle.await {
            warn!("Batch state tracker task failed: {}", e);
        }
    }
}
