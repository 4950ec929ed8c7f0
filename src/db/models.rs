//! Row types shared by the persistence, orchestration and batch layers.

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle of a translation version, in workflow order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranslationStatus {
    Pending,
    Translating,
    Translated,
    NeedsReview,
    Reviewed,
    Approved,
    Error,
}

impl TranslationStatus {
    pub const ALL: [Self; 7] = [
        Self::Pending,
        Self::Translating,
        Self::Translated,
        Self::NeedsReview,
        Self::Reviewed,
        Self::Approved,
        Self::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Translating => "translating",
            Self::Translated => "translated",
            Self::NeedsReview => "needs_review",
            Self::Reviewed => "reviewed",
            Self::Approved => "approved",
            Self::Error => "error",
        }
    }

    /// Statuses that count towards a project language's progress
    pub fn counts_as_done(self) -> bool {
        matches!(self, Self::Translated | Self::Reviewed | Self::Approved)
    }
}

/// Where a translation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranslationSource {
    Manual,
    TmExact,
    TmFuzzy,
    Llm,
}

impl TranslationSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::TmExact => "tm_exact",
            Self::TmFuzzy => "tm_fuzzy",
            Self::Llm => "llm",
        }
    }

    pub fn is_translation_memory(self) -> bool {
        matches!(self, Self::TmExact | Self::TmFuzzy)
    }
}

macro_rules! sql_text_enum {
    ($ty:ty, [$($variant:expr),+ $(,)?]) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                [$($variant),+]
                    .into_iter()
                    .find(|v| v.as_str() == s)
                    .ok_or_else(|| format!("unknown {} value: {}", stringify!($ty), s))
            }
        }

        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let text = value.as_str()?;
                text.parse()
                    .map_err(|e: String| FromSqlError::Other(e.into()))
            }
        }
    };
}

sql_text_enum!(
    TranslationStatus,
    [
        TranslationStatus::Pending,
        TranslationStatus::Translating,
        TranslationStatus::Translated,
        TranslationStatus::NeedsReview,
        TranslationStatus::Reviewed,
        TranslationStatus::Approved,
        TranslationStatus::Error,
    ]
);

sql_text_enum!(
    TranslationSource,
    [
        TranslationSource::Manual,
        TranslationSource::TmExact,
        TranslationSource::TmFuzzy,
        TranslationSource::Llm,
    ]
);

/// Immutable source string of a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationUnit {
    pub id: String,
    pub project_id: String,
    pub key: String,
    pub source_text: String,
    pub context: Option<String>,
    pub is_obsolete: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Current translation of one unit into one project language.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationVersion {
    pub id: String,
    pub unit_id: String,
    pub project_language_id: String,
    pub translated_text: Option<String>,
    pub status: TranslationStatus,
    pub translation_source: TranslationSource,
    /// JSON-encoded validation issues, if any
    pub validation_issues: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TranslationVersion {
    /// New version with a fresh id and both timestamps set to now.
    pub fn new(
        unit_id: impl Into<String>,
        project_language_id: impl Into<String>,
        translated_text: Option<String>,
        status: TranslationStatus,
        translation_source: TranslationSource,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ulid::Ulid::new().to_string(),
            unit_id: unit_id.into(),
            project_language_id: project_language_id.into(),
            translated_text,
            status,
            translation_source,
            validation_issues: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A project targeted at one language.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectLanguage {
    pub id: String,
    pub project_id: String,
    pub language_id: String,
    pub progress_percent: f64,
}

/// One row of the denormalized read cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedTranslationRow {
    pub version_id: String,
    pub unit_id: String,
    pub project_language_id: String,
    pub project_id: String,
    pub unit_key: String,
    pub source_text: String,
    pub translated_text: Option<String>,
    pub status: TranslationStatus,
    pub translation_source: TranslationSource,
}
