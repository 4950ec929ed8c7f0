//! Translation memory and LLM batch pipeline for mass-translating game text.
//!
//! The crate is the engine behind a desktop translation tool. Screens, pack-file
//! extraction and the LLM HTTP client live elsewhere and talk to this crate
//! through the types re-exported here.
//!
//! # Architecture
//!
//! - `similarity`: normalized edit-distance scoring
//! - `tm`: translation memory cache with exact and fuzzy retrieval
//! - `events`: typed publish/subscribe bus for lifecycle events
//! - `batch_state`: folds batch events into live per-batch state
//! - `persistence`: transactional (bulk) writes of translation versions
//! - `orchestrator`: drives a batch through its phases and streams progress
//! - `maintenance`: startup repairs and migrations

pub mod batch_state;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod hashing;
pub mod llm;
pub mod maintenance;
pub mod metrics;
pub mod orchestrator;
pub mod persistence;
pub mod retry;
pub mod similarity;
pub mod tm;
pub mod validation;

pub use error::{Result, TranslationError};
