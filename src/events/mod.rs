//! In-process event bus.
//!
//! A cloneable handle over a `tokio::sync::broadcast` channel. Events are not
//! persisted: a subscriber only sees events published after it subscribed. A
//! subscriber that falls more than `capacity` events behind skips the dropped
//! events and keeps going.

mod types;

pub use types::{
    BatchCancelled, BatchCompleted, BatchFailed, BatchPaused, BatchProgressed, BatchResumed,
    BatchScoped, BatchStarted, BusEvent, DomainEvent, ProjectProgressChanged,
    TranslationsImported, TranslationsSaved,
};

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DomainEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event, returning how many subscribers will receive it
    pub fn publish(&self, event: impl Into<DomainEvent>) -> usize {
        let event = event.into();
        let event_type = event.event_type();
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!("No subscribers for {}", event_type);
                0
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Raw receiver, for consumers that drive their own loop
    pub fn receiver(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }

    /// Stream of every event of type `T` (use `DomainEvent` for all events).
    ///
    /// The subscription starts when this is called, not when the stream is
    /// first polled.
    pub fn subscribe<T: BusEvent>(&self) -> BoxStream<'static, T> {
        filtered(self.sender.subscribe(), T::from_domain)
    }

    /// Every event tagged with `batch_id`
    pub fn batch_events(&self, batch_id: &str) -> BoxStream<'static, DomainEvent> {
        let batch_id = batch_id.to_string();
        filtered(self.sender.subscribe(), move |event| {
            (event.batch_id() == Some(batch_id.as_str())).then_some(event)
        })
    }

    /// Every event tagged with `project_id`
    pub fn project_events(&self, project_id: &str) -> BoxStream<'static, DomainEvent> {
        let project_id = project_id.to_string();
        filtered(self.sender.subscribe(), move |event| {
            (event.project_id() == Some(project_id.as_str())).then_some(event)
        })
    }

    /// Events of type `T` for one batch
    pub fn subscribe_batch<T: BatchScoped>(&self, batch_id: &str) -> BoxStream<'static, T> {
        let batch_id = batch_id.to_string();
        filtered(self.sender.subscribe(), move |event| {
            T::from_domain(event).filter(|typed| typed.batch_id() == batch_id)
        })
    }
}

fn filtered<T, F>(receiver: broadcast::Receiver<DomainEvent>, select: F) -> BoxStream<'static, T>
where
    T: Send + 'static,
    F: Fn(DomainEvent) -> Option<T> + Send + 'static,
{
    stream::unfold((receiver, select), |(mut receiver, select)| async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    if let Some(item) = select(event) {
                        return Some((item, (receiver, select)));
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Event subscriber lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}
