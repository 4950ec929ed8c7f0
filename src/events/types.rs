use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchStarted {
    pub batch_id: String,
    pub project_id: String,
    pub project_language_id: String,
    pub total_units: usize,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchProgressed {
    pub batch_id: String,
    pub project_id: String,
    pub total_units: usize,
    pub completed_units: usize,
    pub failed_units: usize,
    pub progress_percent: f64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPaused {
    pub batch_id: String,
    pub project_id: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResumed {
    pub batch_id: String,
    pub project_id: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchCompleted {
    pub batch_id: String,
    pub project_id: String,
    pub successful_units: usize,
    pub failed_units: usize,
    pub skipped_units: usize,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchFailed {
    pub batch_id: String,
    pub project_id: String,
    pub error: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchCancelled {
    pub batch_id: String,
    pub project_id: String,
    pub processed_units: usize,
    pub at: DateTime<Utc>,
}

/// A chunk of translations persisted by the batch pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationsSaved {
    pub batch_id: String,
    pub project_id: String,
    pub project_language_id: String,
    pub unit_ids: Vec<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationsImported {
    pub project_language_ids: Vec<String>,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectProgressChanged {
    pub project_id: String,
    pub project_language_id: String,
    pub progress_percent: f64,
    pub at: DateTime<Utc>,
}

/// Every event carried by the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    BatchStarted(BatchStarted),
    BatchProgressed(BatchProgressed),
    BatchPaused(BatchPaused),
    BatchResumed(BatchResumed),
    BatchCompleted(BatchCompleted),
    BatchFailed(BatchFailed),
    BatchCancelled(BatchCancelled),
    TranslationsSaved(TranslationsSaved),
    TranslationsImported(TranslationsImported),
    ProjectProgressChanged(ProjectProgressChanged),
}

impl DomainEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::BatchStarted(_) => "batch_started",
            Self::BatchProgressed(_) => "batch_progressed",
            Self::BatchPaused(_) => "batch_paused",
            Self::BatchResumed(_) => "batch_resumed",
            Self::BatchCompleted(_) => "batch_completed",
            Self::BatchFailed(_) => "batch_failed",
            Self::BatchCancelled(_) => "batch_cancelled",
            Self::TranslationsSaved(_) => "translations_saved",
            Self::TranslationsImported(_) => "translations_imported",
            Self::ProjectProgressChanged(_) => "project_progress_changed",
        }
    }

    pub fn batch_id(&self) -> Option<&str> {
        match self {
            Self::BatchStarted(e) => Some(&e.batch_id),
            Self::BatchProgressed(e) => Some(&e.batch_id),
            Self::BatchPaused(e) => Some(&e.batch_id),
            Self::BatchResumed(e) => Some(&e.batch_id),
            Self::BatchCompleted(e) => Some(&e.batch_id),
            Self::BatchFailed(e) => Some(&e.batch_id),
            Self::BatchCancelled(e) => Some(&e.batch_id),
            Self::TranslationsSaved(e) => Some(&e.batch_id),
            Self::TranslationsImported(_) | Self::ProjectProgressChanged(_) => None,
        }
    }

    /// Imports can span projects, so they carry no single project id
    pub fn project_id(&self) -> Option<&str> {
        match self {
            Self::BatchStarted(e) => Some(&e.project_id),
            Self::BatchProgressed(e) => Some(&e.project_id),
            Self::BatchPaused(e) => Some(&e.project_id),
            Self::BatchResumed(e) => Some(&e.project_id),
            Self::BatchCompleted(e) => Some(&e.project_id),
            Self::BatchFailed(e) => Some(&e.project_id),
            Self::BatchCancelled(e) => Some(&e.project_id),
            Self::TranslationsSaved(e) => Some(&e.project_id),
            Self::ProjectProgressChanged(e) => Some(&e.project_id),
            Self::TranslationsImported(_) => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::BatchCompleted(_) | Self::BatchFailed(_) | Self::BatchCancelled(_)
        )
    }
}

/// Types that can be received from the bus with `EventBus::subscribe`.
pub trait BusEvent: Clone + Send + Sync + 'static {
    fn from_domain(event: DomainEvent) -> Option<Self>;
}

impl BusEvent for DomainEvent {
    fn from_domain(event: DomainEvent) -> Option<Self> {
        Some(event)
    }
}

macro_rules! bus_event {
    ($($name:ident),+ $(,)?) => {
        $(
            impl From<$name> for DomainEvent {
                fn from(event: $name) -> Self {
                    DomainEvent::$name(event)
                }
            }

            impl BusEvent for $name {
                fn from_domain(event: DomainEvent) -> Option<Self> {
                    match event {
                        DomainEvent::$name(inner) => Some(inner),
                        _ => None,
                    }
                }
            }
        )+
    };
}

bus_event!(
    BatchStarted,
    BatchProgressed,
    BatchPaused,
    BatchResumed,
    BatchCompleted,
    BatchFailed,
    BatchCancelled,
    TranslationsSaved,
    TranslationsImported,
    ProjectProgressChanged,
);

/// Typed events that belong to a single batch
pub trait BatchScoped: BusEvent {
    fn batch_id(&self) -> &str;
}

macro_rules! batch_scoped {
    ($($name:ident),+ $(,)?) => {
        $(
            impl BatchScoped for $name {
                fn batch_id(&self) -> &str {
                    &self.batch_id
                }
            }
        )+
    };
}

batch_scoped!(
    BatchStarted,
    BatchProgressed,
    BatchPaused,
    BatchResumed,
    BatchCompleted,
    BatchFailed,
    BatchCancelled,
    TranslationsSaved,
);

#[cfg(test)]
mod tests {
    use super::*;

    fn paused(batch_id: &str) -> BatchPaused {
        BatchPaused {
            batch_id: batch_id.to_string(),
            project_id: "proj".to_string(),
            at: Utc::now(),
        }
    }

    #[test]
    fn test_typed_conversion_round_trip() {
        let event: DomainEvent = paused("b1").into();
        assert_eq!(event.event_type(), "batch_paused");
        assert_eq!(event.batch_id(), Some("b1"));

        assert!(BatchPaused::from_domain(event.clone()).is_some());
        assert!(BatchResumed::from_domain(event).is_none());
    }

    #[test]
    fn test_import_event_has_no_scope() {
        let event = DomainEvent::from(TranslationsImported {
            project_language_ids: vec!["pl".to_string()],
            inserted: 1,
            updated: 0,
            skipped: 0,
            at: Utc::now(),
        });
        assert!(event.batch_id().is_none());
        assert!(event.project_id().is_none());
        assert!(!event.is_terminal());
    }

    #[test]
    fn test_serialized_with_type_tag() {
        let event = DomainEvent::from(paused("b1"));
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "batch_paused");
        assert_eq!(json["batch_id"], "b1");
    }
}
