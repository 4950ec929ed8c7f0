use crate::db::Database;
use crate::events::EventBus;
use crate::orchestrator::TranslationContext;
use crate::persistence::{BulkPersistenceEngine, DEFAULT_BULK_THRESHOLD, DEFAULT_CHUNK_SIZE};
use crate::retry::RetryConfig;
use crate::tm::MatchOptions;
use anyhow::{bail, Result};
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    // Storage
    pub database_path: String,

    // Translation memory
    pub tm_min_confidence: f64,
    pub tm_max_candidates: usize,
    pub tm_fuzzy_accept: f64,

    // Batches
    pub units_per_batch: usize,
    pub llm_max_attempts: u32,

    // Imports
    pub bulk_import_threshold: usize,
    pub import_chunk_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "twmt.db".to_string(),
            tm_min_confidence: 0.7,
            tm_max_candidates: 50,
            tm_fuzzy_accept: 0.95,
            units_per_batch: 25,
            llm_max_attempts: 3,
            bulk_import_threshold: DEFAULT_BULK_THRESHOLD,
            import_chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any key lookup; unparsable values fall back
    /// to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            database_path: lookup("DATABASE_PATH").unwrap_or(defaults.database_path),

            tm_min_confidence: parse_or(&lookup, "TM_MIN_CONFIDENCE", defaults.tm_min_confidence),
            tm_max_candidates: parse_or(&lookup, "TM_MAX_CANDIDATES", defaults.tm_max_candidates),
            tm_fuzzy_accept: parse_or(&lookup, "TM_FUZZY_ACCEPT", defaults.tm_fuzzy_accept),

            units_per_batch: parse_or(&lookup, "UNITS_PER_BATCH", defaults.units_per_batch),
            llm_max_attempts: parse_or(&lookup, "LLM_MAX_ATTEMPTS", defaults.llm_max_attempts),

            bulk_import_threshold: parse_or(
                &lookup,
                "BULK_IMPORT_THRESHOLD",
                defaults.bulk_import_threshold,
            ),
            import_chunk_size: parse_or(&lookup, "IMPORT_CHUNK_SIZE", defaults.import_chunk_size),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("TM_MIN_CONFIDENCE", self.tm_min_confidence),
            ("TM_FUZZY_ACCEPT", self.tm_fuzzy_accept),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("{} must be between 0 and 1, got {}", name, value);
            }
        }
        if self.tm_max_candidates == 0 {
            bail!("TM_MAX_CANDIDATES must be at least 1");
        }
        if self.import_chunk_size == 0 {
            bail!("IMPORT_CHUNK_SIZE must be at least 1");
        }
        Ok(())
    }

    pub fn match_options(&self) -> MatchOptions {
        MatchOptions {
            min_confidence: self.tm_min_confidence,
            max_candidates: self.tm_max_candidates,
        }
    }

    /// Batch settings for `provider_id` with the configured chunk size and threshold
    pub fn translation_context(&self, provider_id: &str) -> TranslationContext {
        let mut context =
            TranslationContext::new(provider_id).with_units_per_batch(self.units_per_batch);
        context.fuzzy_accept_threshold = self.tm_fuzzy_accept;
        context
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::llm_call_with_attempts(self.llm_max_attempts)
    }

    pub fn persistence_engine(&self, db: Database, bus: EventBus) -> BulkPersistenceEngine {
        BulkPersistenceEngine::new(db)
            .with_bus(bus)
            .with_bulk_threshold(self.bulk_import_threshold)
            .with_chunk_size(self.import_chunk_size)
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            warn!("Ignoring unparsable {}={:?}, using the default", key, raw);
            default
        }
    }
}
