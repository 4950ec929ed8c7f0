//! Translation quality validation.
//!
//! Checks that a translated game string still carries the elements the game
//! engine relies on: format placeholders, markup tags and escaped line breaks.
//! Issues are graded so the orchestrator can decide between failing a unit and
//! flagging it for review.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

/// Severity of a validation issue, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        };
        f.write_str(label)
    }
}

/// A single field-level problem found in a translation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
    pub severity: Severity,
}

impl ValidationIssue {
    pub fn new(field: impl Into<String>, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            severity,
        }
    }

    pub fn warning(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(field, message, Severity::Warning)
    }

    pub fn error(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(field, message, Severity::Error)
    }

    pub fn critical(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(field, message, Severity::Critical)
    }
}

/// Validation report containing every issue found in one translation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when at least one issue is an error or critical
    pub fn has_errors(&self) -> bool {
        self.issues.iter().any(|i| i.severity >= Severity::Error)
    }

    pub fn has_warnings(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Warning)
    }

    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn max_severity(&self) -> Option<Severity> {
        self.issues.iter().map(|i| i.severity).max()
    }

    fn push(&mut self, issue: ValidationIssue) {
        self.issues.push(issue);
    }
}

/// Validator for translated game text.
pub struct TranslationValidator;

static PLACEHOLDER_REGEX: OnceLock<Regex> = OnceLock::new();
static MARKUP_TAG_REGEX: OnceLock<Regex> = OnceLock::new();

/// Below this source length the length-ratio check is too noisy to be useful
const MIN_LENGTH_FOR_RATIO: usize = 10;
const MAX_LENGTH_RATIO: f64 = 4.0;

const FIELD: &str = "translated_text";

impl TranslationValidator {
    /// Validate a translation against its source string.
    ///
    /// - empty translation of a non-empty source is critical
    /// - missing or extra format placeholders (`{0}`, `%s`, `%1$d`) are errors
    /// - markup tag (`[[col:red]]`) and `\n` count mismatches are warnings
    /// - an untranslated copy of the source and extreme length ratios are warnings
    pub fn validate(original: &str, translated: &str) -> ValidationReport {
        let mut report = ValidationReport::new();

        if translated.trim().is_empty() {
            if !original.trim().is_empty() {
                report.push(ValidationIssue::critical(FIELD, "translation is empty"));
            }
            return report;
        }

        let orig_placeholders = Self::placeholder_counts(original);
        let trans_placeholders = Self::placeholder_counts(translated);
        if orig_placeholders != trans_placeholders {
            report.push(ValidationIssue::error(
                FIELD,
                format!(
                    "placeholder mismatch: original has {:?}, translation has {:?}",
                    orig_placeholders, trans_placeholders
                ),
            ));
        }

        let orig_tags = Self::extract_markup_tags(original);
        let trans_tags = Self::extract_markup_tags(translated);
        if orig_tags.len() != trans_tags.len() {
            report.push(ValidationIssue::warning(
                FIELD,
                format!(
                    "markup tag count mismatch: original has {}, translation has {}",
                    orig_tags.len(),
                    trans_tags.len()
                ),
            ));
        }

        let orig_breaks = original.matches("\\n").count();
        let trans_breaks = translated.matches("\\n").count();
        if orig_breaks != trans_breaks {
            report.push(ValidationIssue::warning(
                FIELD,
                format!(
                    "line break count mismatch: original has {}, translation has {}",
                    orig_breaks, trans_breaks
                ),
            ));
        }

        if translated == original && original.split_whitespace().count() > 1 {
            report.push(ValidationIssue::warning(
                FIELD,
                "translation is identical to the source text",
            ));
        }

        let orig_len = original.chars().count();
        let trans_len = translated.chars().count();
        if orig_len >= MIN_LENGTH_FOR_RATIO {
            let ratio = trans_len as f64 / orig_len as f64;
            if !(1.0 / MAX_LENGTH_RATIO..=MAX_LENGTH_RATIO).contains(&ratio) {
                report.push(ValidationIssue::warning(
                    FIELD,
                    format!(
                        "suspicious length: translation is {:.1}x the source length",
                        ratio
                    ),
                ));
            }
        }

        report
    }

    /// Count each distinct placeholder, so reordering is allowed but loss is not
    fn placeholder_counts(text: &str) -> BTreeMap<String, usize> {
        let regex = PLACEHOLDER_REGEX.get_or_init(|| {
            Regex::new(r"\{[0-9A-Za-z_]*\}|%(?:[0-9]+\$)?[sdif]").expect("valid placeholder regex")
        });

        let mut counts = BTreeMap::new();
        for m in regex.find_iter(text) {
            *counts.entry(m.as_str().to_string()).or_insert(0) += 1;
        }
        counts
    }

    fn extract_markup_tags(text: &str) -> Vec<String> {
        let regex = MARKUP_TAG_REGEX
            .get_or_init(|| Regex::new(r"\[\[/?[a-z_]+(?::[^\]]*)?\]\]").expect("valid tag regex"));

        regex
            .find_iter(text)
            .map(|m| m.as_str().to_string())
            .collect()
    }
}
