use crate::error::{Result, TranslationError};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Upper bound on units sent to the LLM in one request
pub const MAX_UNITS_PER_BATCH: usize = 100;

pub const DEFAULT_UNITS_PER_BATCH: usize = 25;
pub const DEFAULT_FUZZY_ACCEPT_THRESHOLD: f64 = 0.95;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlossaryTerm {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub case_sensitive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FewShotExample {
    pub source: String,
    pub target: String,
}

/// Settings for one batch run. Handed unchanged to the prompt builder and the
/// LLM client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationContext {
    pub provider_id: String,
    pub model_id: Option<String>,
    #[serde(default)]
    pub glossary: Vec<GlossaryTerm>,
    #[serde(default)]
    pub few_shot_examples: Vec<FewShotExample>,
    pub custom_instructions: Option<String>,
    pub units_per_batch: usize,
    /// Accepted for compatibility; chunks always run one at a time
    pub parallel_batches: usize,
    #[serde(default)]
    pub skip_translation_memory: bool,
    pub fuzzy_accept_threshold: f64,
}

impl TranslationContext {
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            model_id: None,
            glossary: Vec::new(),
            few_shot_examples: Vec::new(),
            custom_instructions: None,
            units_per_batch: DEFAULT_UNITS_PER_BATCH,
            parallel_batches: 1,
            skip_translation_memory: false,
            fuzzy_accept_threshold: DEFAULT_FUZZY_ACCEPT_THRESHOLD,
        }
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    pub fn with_units_per_batch(mut self, units_per_batch: usize) -> Self {
        self.units_per_batch = units_per_batch;
        self
    }

    pub fn with_glossary(mut self, glossary: Vec<GlossaryTerm>) -> Self {
        self.glossary = glossary;
        self
    }

    pub fn skipping_translation_memory(mut self) -> Self {
        self.skip_translation_memory = true;
        self
    }

    /// Check the settings before a run starts
    pub fn validate(&self) -> Result<()> {
        if self.units_per_batch == 0 || self.units_per_batch > MAX_UNITS_PER_BATCH {
            return Err(TranslationError::BatchSizeExceeded {
                requested: self.units_per_batch,
                max: MAX_UNITS_PER_BATCH,
            });
        }
        if !(0.0..=1.0).contains(&self.fuzzy_accept_threshold) {
            return Err(TranslationError::orchestration(
                format!(
                    "fuzzy accept threshold must be within [0, 1], got {}",
                    self.fuzzy_accept_threshold
                ),
                None,
            ));
        }
        if self.parallel_batches > 1 {
            warn!(
                "parallel_batches = {} requested; chunks are processed sequentially",
                self.parallel_batches
            );
        }
        Ok(())
    }
}
