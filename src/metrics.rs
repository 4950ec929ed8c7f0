//! Translation pipeline metrics.
//!
//! Counts translation memory reuse and LLM traffic for one orchestrator. Each
//! orchestrator owns its own counters so concurrent pipelines (and tests) do not
//! share state.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct TranslationMetrics {
    /// Units served by an exact translation memory match
    tm_exact_hits: AtomicUsize,

    /// Units served by a fuzzy match above the accept threshold
    tm_fuzzy_hits: AtomicUsize,

    /// Units that had to go to the LLM
    tm_misses: AtomicUsize,

    llm_calls: AtomicUsize,
    llm_failures: AtomicUsize,
    tokens_used: AtomicU64,
}

impl TranslationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tm_exact_hit(&self) {
        self.tm_exact_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tm_fuzzy_hit(&self) {
        self.tm_fuzzy_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tm_miss(&self) {
        self.tm_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one LLM request and the tokens it consumed
    pub fn record_llm_call(&self, tokens_used: u64) {
        self.llm_calls.fetch_add(1, Ordering::Relaxed);
        self.tokens_used.fetch_add(tokens_used, Ordering::Relaxed);
    }

    pub fn record_llm_failure(&self) {
        self.llm_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tm_exact_hits(&self) -> usize {
        self.tm_exact_hits.load(Ordering::Relaxed)
    }

    pub fn tm_fuzzy_hits(&self) -> usize {
        self.tm_fuzzy_hits.load(Ordering::Relaxed)
    }

    pub fn tm_misses(&self) -> usize {
        self.tm_misses.load(Ordering::Relaxed)
    }

    pub fn llm_calls(&self) -> usize {
        self.llm_calls.load(Ordering::Relaxed)
    }

    pub fn llm_failures(&self) -> usize {
        self.llm_failures.load(Ordering::Relaxed)
    }

    pub fn tokens_used(&self) -> u64 {
        self.tokens_used.load(Ordering::Relaxed)
    }

    /// Generate a metrics report.
    pub fn report(&self) -> MetricsReport {
        let exact = self.tm_exact_hits();
        let fuzzy = self.tm_fuzzy_hits();
        let misses = self.tm_misses();
        let lookups = exact + fuzzy + misses;
        let tm_reuse_rate = if lookups > 0 {
            ((exact + fuzzy) as f64 / lookups as f64) * 100.0
        } else {
            0.0
        };

        let calls = self.llm_calls();
        let failures = self.llm_failures();
        let llm_success_rate = if calls > 0 {
            (calls.saturating_sub(failures) as f64 / calls as f64) * 100.0
        } else {
            0.0
        };

        MetricsReport {
            tm_exact_hits: exact,
            tm_fuzzy_hits: fuzzy,
            tm_misses: misses,
            tm_reuse_rate,
            llm_calls: calls,
            llm_failures: failures,
            llm_success_rate,
            tokens_used: self.tokens_used(),
        }
    }

    pub fn reset(&self) {
        self.tm_exact_hits.store(0, Ordering::Relaxed);
        self.tm_fuzzy_hits.store(0, Ordering::Relaxed);
        self.tm_misses.store(0, Ordering::Relaxed);
        self.llm_calls.store(0, Ordering::Relaxed);
        self.llm_failures.store(0, Ordering::Relaxed);
        self.tokens_used.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of the counters, logged as JSON at the end of each batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsReport {
    pub tm_exact_hits: usize,
    pub tm_fuzzy_hits: usize,
    pub tm_misses: usize,

    /// Share of looked-up units served from translation memory (0-100)
    pub tm_reuse_rate: f64,

    pub llm_calls: usize,
    pub llm_failures: usize,

    /// LLM success rate as a percentage (0-100)
    pub llm_success_rate: f64,

    pub tokens_used: u64,
}
