//! Pause, stop and cancel signals for a running batch.
//!
//! The orchestrator keeps a `BatchControl` per running batch; the batch task
//! holds the matching `ControlHandle` and checks it at chunk boundaries.

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub(crate) struct BatchControl {
    paused: watch::Sender<bool>,
    stop: CancellationToken,
    cancel: CancellationToken,
}

impl BatchControl {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            paused,
            stop: CancellationToken::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn handle(&self) -> ControlHandle {
        ControlHandle {
            paused: self.paused.subscribe(),
            stop: self.stop.clone(),
            cancel: self.cancel.clone(),
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.is_cancelled() || self.cancel.is_cancelled()
    }

    /// Returns false when already paused
    pub fn pause(&self) -> bool {
        self.paused.send_if_modified(|paused| {
            if *paused {
                false
            } else {
                *paused = true;
                true
            }
        })
    }

    /// Returns false when not paused
    pub fn resume(&self) -> bool {
        self.paused.send_if_modified(|paused| {
            if *paused {
                *paused = false;
                true
            } else {
                false
            }
        })
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ControlHandle {
    paused: watch::Receiver<bool>,
    stop: CancellationToken,
    cancel: CancellationToken,
}

impl ControlHandle {
    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Stop or cancel was requested
    pub fn should_stop(&self) -> bool {
        self.stop.is_cancelled() || self.cancel.is_cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the in-flight work must be abandoned
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Wait until resumed, stopped or cancelled
    pub async fn wait_while_paused(&mut self) {
        loop {
            if !*self.paused.borrow_and_update() || self.should_stop() {
                return;
            }
            tokio::select! {
                changed = self.paused.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = self.stop.cancelled() => return,
                _ = self.cancel.cancelled() => return,
            }
        }
    }
}
