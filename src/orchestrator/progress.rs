//! Progress snapshots streamed while a batch runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// Failed unit ids carried in a snapshot
pub const MAX_REPORTED_FAILURES: usize = 10;
/// LLM exchanges carried in a snapshot, newest last
pub const MAX_LLM_LOGS: usize = 20;
/// Chunk samples used for the remaining-time estimate
const ETA_WINDOW: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranslationPhase {
    Initializing,
    TmExactLookup,
    TmFuzzyLookup,
    BuildingPrompt,
    LlmTranslation,
    Validating,
    Saving,
    UpdatingTm,
    Finalizing,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranslationProgressStatus {
    Queued,
    InProgress,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TranslationProgressStatus {
    /// Value stored in `translation_batches.status`
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// One request/response round trip with the LLM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmExchangeLog {
    pub chunk: usize,
    pub unit_count: usize,
    pub prompt_chars: usize,
    pub tokens_used: u64,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationProgress {
    pub batch_id: String,
    pub status: TranslationProgressStatus,
    pub phase: TranslationPhase,
    pub total_units: usize,
    pub processed_units: usize,
    pub successful_units: usize,
    pub failed_units: usize,
    pub skipped_units: usize,
    /// 1-based chunk being processed, 0 before the first chunk
    pub current_chunk: usize,
    pub total_chunks: usize,
    pub tokens_used: u64,
    /// Fraction (0-1) of the units processed by this run that came from
    /// translation memory
    pub tm_reuse_rate: f64,
    pub estimated_seconds_remaining: Option<f64>,
    pub failed_unit_ids: Vec<String>,
    pub llm_logs: Vec<LlmExchangeLog>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TranslationProgress {
    pub fn new(batch_id: impl Into<String>, total_units: usize, total_chunks: usize) -> Self {
        let now = Utc::now();
        Self {
            batch_id: batch_id.into(),
            status: TranslationProgressStatus::Queued,
            phase: TranslationPhase::Initializing,
            total_units,
            processed_units: 0,
            successful_units: 0,
            failed_units: 0,
            skipped_units: 0,
            current_chunk: 0,
            total_chunks,
            tokens_used: 0,
            tm_reuse_rate: 0.0,
            estimated_seconds_remaining: None,
            failed_unit_ids: Vec::new(),
            llm_logs: Vec::new(),
            started_at: now,
            updated_at: now,
        }
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total_units == 0 {
            return 100.0;
        }
        (self.processed_units as f64 / self.total_units as f64) * 100.0
    }

    pub fn remaining_units(&self) -> usize {
        self.total_units.saturating_sub(self.processed_units)
    }

    pub(crate) fn record_success(&mut self) {
        self.successful_units += 1;
        self.processed_units += 1;
    }

    pub(crate) fn record_failure(&mut self, unit_id: String) {
        self.failed_units += 1;
        self.processed_units += 1;
        if self.failed_unit_ids.len() < MAX_REPORTED_FAILURES {
            self.failed_unit_ids.push(unit_id);
        }
    }

    pub(crate) fn checkpoint(&self) -> UnitCounts {
        UnitCounts {
            processed: self.processed_units,
            successful: self.successful_units,
            failed: self.failed_units,
            reported_failures: self.failed_unit_ids.len(),
        }
    }

    /// Roll the unit counters back to `counts`
    pub(crate) fn restore(&mut self, counts: UnitCounts) {
        self.processed_units = counts.processed;
        self.successful_units = counts.successful;
        self.failed_units = counts.failed;
        self.failed_unit_ids.truncate(counts.reported_failures);
    }

    pub(crate) fn push_llm_log(&mut self, log: LlmExchangeLog) {
        self.tokens_used += log.tokens_used;
        self.llm_logs.push(log);
        if self.llm_logs.len() > MAX_LLM_LOGS {
            self.llm_logs.remove(0);
        }
    }
}

/// Unit counters at a chunk boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct UnitCounts {
    processed: usize,
    successful: usize,
    failed: usize,
    reported_failures: usize,
}

/// Remaining-time estimate from the throughput of the most recent chunks.
#[derive(Debug, Default)]
pub struct EtaEstimator {
    samples: VecDeque<(usize, Duration)>,
}

impl EtaEstimator {
    pub fn record(&mut self, units: usize, elapsed: Duration) {
        if units == 0 {
            return;
        }
        self.samples.push_back((units, elapsed));
        if self.samples.len() > ETA_WINDOW {
            self.samples.pop_front();
        }
    }

    pub fn estimate(&self, remaining_units: usize) -> Option<f64> {
        let (units, elapsed) = self
            .samples
            .iter()
            .fold((0usize, Duration::ZERO), |(u, d), (units, elapsed)| (u + units, d + *elapsed));
        if units == 0 {
            return None;
        }
        Some(elapsed.as_secs_f64() / units as f64 * remaining_units as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_percent() {
        let mut progress = TranslationProgress::new("b1", 4, 2);
        assert_eq!(progress.progress_percent(), 0.0);
        progress.processed_units = 3;
        assert_eq!(progress.progress_percent(), 75.0);
        assert_eq!(progress.remaining_units(), 1);

        assert_eq!(TranslationProgress::new("empty", 0, 0).progress_percent(), 100.0);
    }

    #[test]
    fn test_failed_unit_ids_are_capped() {
        let mut progress = TranslationProgress::new("b1", 20, 1);
        for i in 0..15 {
            progress.record_failure(format!("u{}", i));
        }
        assert_eq!(progress.failed_units, 15);
        assert_eq!(progress.processed_units, 15);
        assert_eq!(progress.failed_unit_ids.len(), MAX_REPORTED_FAILURES);
        assert_eq!(progress.failed_unit_ids[0], "u0");
    }

    #[test]
    fn test_restore_rolls_back_an_abandoned_chunk() {
        let mut progress = TranslationProgress::new("b1", 20, 2);
        progress.record_success();
        progress.record_failure("u1".to_string());
        let checkpoint = progress.checkpoint();

        progress.record_success();
        progress.record_failure("u3".to_string());
        assert_eq!(progress.processed_units, 4);

        progress.restore(checkpoint);
        assert_eq!(progress.processed_units, 2);
        assert_eq!(progress.successful_units, 1);
        assert_eq!(progress.failed_units, 1);
        assert_eq!(progress.failed_unit_ids, vec!["u1".to_string()]);
    }

    #[test]
    fn test_llm_logs_keep_newest() {
        let mut progress = TranslationProgress::new("b1", 1, 1);
        for chunk in 0..(MAX_LLM_LOGS + 3) {
            progress.push_llm_log(LlmExchangeLog {
                chunk,
                unit_count: 1,
                prompt_chars: 10,
                tokens_used: 2,
                duration_ms: 5,
                error: None,
                at: Utc::now(),
            });
        }
        assert_eq!(progress.llm_logs.len(), MAX_LLM_LOGS);
        assert_eq!(progress.llm_logs[0].chunk, 3);
        assert_eq!(progress.tokens_used, 2 * (MAX_LLM_LOGS as u64 + 3));
    }

    #[test]
    fn test_eta_uses_recent_window() {
        let mut eta = EtaEstimator::default();
        assert!(eta.estimate(10).is_none());

        // an early slow chunk falls out of the window
        eta.record(10, Duration::from_secs(100));
        for _ in 0..ETA_WINDOW {
            eta.record(10, Duration::from_secs(1));
        }
        let estimate = eta.estimate(20).expect("estimate");
        assert!((estimate - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(TranslationProgressStatus::InProgress.as_str(), "in_progress");
        assert!(TranslationProgressStatus::Cancelled.is_terminal());
        assert!(!TranslationProgressStatus::Paused.is_terminal());
    }
}
