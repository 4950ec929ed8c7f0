//! Error types shared by every component of the pipeline.

use crate::validation::{Severity, ValidationIssue};
use thiserror::Error;

/// Maximum number of failed unit ids spelled out in a partial failure message.
const MAX_LISTED_FAILURES: usize = 5;

pub type Result<T, E = TranslationError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum TranslationError {
    /// Query or transaction failure in the persistence layer
    #[error("database error: {context}: {source}")]
    Database {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    /// Batch-level failure, optionally tagged with the batch it belongs to
    #[error("{}", format_orchestration(.message, .batch_id.as_deref()))]
    Orchestration {
        message: String,
        batch_id: Option<String>,
    },

    #[error("failed to build prompt: {0}")]
    PromptBuild(String),

    #[error("{}", format_validation(.0))]
    Validation(Vec<ValidationIssue>),

    #[error("batch size exceeded: requested {requested}, maximum is {max}")]
    BatchSizeExceeded { requested: usize, max: usize },

    #[error("{}", format_partial(*.successful, *.failed, .failed_unit_ids))]
    PartialTranslation {
        successful: usize,
        failed: usize,
        failed_unit_ids: Vec<String>,
    },

    /// Operation not legal in the batch's current state (e.g. resume while running)
    #[error("batch {batch_id}: {message}")]
    InvalidState { batch_id: String, message: String },

    #[error("not found: {0}")]
    NotFound(String),
}

impl TranslationError {
    pub fn database(context: impl Into<String>, source: rusqlite::Error) -> Self {
        Self::Database {
            context: context.into(),
            source,
        }
    }

    pub fn orchestration(message: impl Into<String>, batch_id: Option<&str>) -> Self {
        Self::Orchestration {
            message: message.into(),
            batch_id: batch_id.map(str::to_string),
        }
    }

    pub fn invalid_state(batch_id: &str, message: impl Into<String>) -> Self {
        Self::InvalidState {
            batch_id: batch_id.to_string(),
            message: message.into(),
        }
    }

    /// Whether the error describes a broken invariant rather than a recoverable condition.
    pub fn is_critical(&self) -> bool {
        match self {
            Self::Validation(issues) => issues.iter().any(|i| i.severity == Severity::Critical),
            Self::Database { .. } => true,
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for TranslationError {
    fn from(source: rusqlite::Error) -> Self {
        Self::database("query failed", source)
    }
}

fn format_orchestration(message: &str, batch_id: Option<&str>) -> String {
    match batch_id {
        Some(id) => format!("orchestration error (batch {}): {}", id, message),
        None => format!("orchestration error: {}", message),
    }
}

fn format_validation(issues: &[ValidationIssue]) -> String {
    let details: Vec<String> = issues
        .iter()
        .map(|i| format!("[{}] {}: {}", i.severity, i.field, i.message))
        .collect();
    format!("validation failed: {}", details.join("; "))
}

fn format_partial(successful: usize, failed: usize, failed_unit_ids: &[String]) -> String {
    let listed: Vec<&str> = failed_unit_ids
        .iter()
        .take(MAX_LISTED_FAILURES)
        .map(String::as_str)
        .collect();
    let mut message = format!(
        "partial translation: {} succeeded, {} failed ({}",
        successful,
        failed,
        listed.join(", ")
    );
    if failed > listed.len() {
        message.push_str(&format!(" and {} more", failed - listed.len()));
    }
    message.push(')');
    message
}
