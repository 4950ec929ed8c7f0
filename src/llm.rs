//! Seams to the LLM provider and the prompt builder.
//!
//! Both are supplied by the application; the pipeline only depends on these
//! traits.

use crate::error::Result;
use crate::orchestrator::TranslationContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Unit sent to the model, keyed by unit id in the response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmUnit {
    pub unit_id: String,
    pub key: String,
    pub source_text: String,
    pub context: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslationPrompt {
    pub system: String,
    pub user: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmResponse {
    /// Translated text per unit id. Units missing from the map failed.
    pub translations: HashMap<String, String>,
    pub tokens_used: u64,
}

#[derive(Debug, Error)]
pub enum LlmError {
    /// Non-success HTTP status from the provider
    #[error("LLM provider error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("content rejected by provider: {0}")]
    ContentFiltered(String),
}

impl LlmError {
    /// Rate limits, 5xx responses and transport failures are worth retrying;
    /// other 4xx responses and bad payloads are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            Self::Network(_) | Self::Timeout => true,
            Self::InvalidResponse(_) | Self::ContentFiltered(_) => false,
        }
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn translate(
        &self,
        prompt: &TranslationPrompt,
        units: &[LlmUnit],
        context: &TranslationContext,
    ) -> std::result::Result<LlmResponse, LlmError>;
}

#[async_trait]
pub trait PromptBuilder: Send + Sync {
    /// Fails with `TranslationError::PromptBuild` when no prompt can be made
    async fn build(&self, units: &[LlmUnit], context: &TranslationContext)
        -> Result<TranslationPrompt>;
}
