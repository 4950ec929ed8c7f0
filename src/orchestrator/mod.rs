//! Batch orchestration.
//!
//! A batch is processed in chunks of `units_per_batch`. Each chunk goes through
//! translation memory (exact, then fuzzy), the prompt builder and the LLM for
//! whatever is left, validation, a transactional save and a translation memory
//! update. Progress snapshots are streamed to the caller and lifecycle events
//! are published on the bus.
//!
//! Pause, stop and cancel are cooperative: they take effect at chunk
//! boundaries, except cancel, which also abandons an in-flight LLM call.

mod context;
mod control;
mod progress;

pub use context::{
    FewShotExample, GlossaryTerm, TranslationContext, DEFAULT_FUZZY_ACCEPT_THRESHOLD,
    DEFAULT_UNITS_PER_BATCH, MAX_UNITS_PER_BATCH,
};
pub use progress::{
    EtaEstimator, LlmExchangeLog, TranslationPhase, TranslationProgress,
    TranslationProgressStatus, MAX_LLM_LOGS, MAX_REPORTED_FAILURES,
};

use crate::db::{
    BatchUnit, BatchUnitStatus, BatchUnitUpdate, Database, TranslationSource, TranslationStatus,
    TranslationVersion,
};
use crate::error::{Result, TranslationError};
use crate::events::{
    BatchCancelled, BatchCompleted, BatchFailed, BatchPaused, BatchProgressed, BatchResumed,
    BatchStarted, EventBus, TranslationsSaved,
};
use crate::llm::{LlmClient, LlmError, LlmResponse, LlmUnit, PromptBuilder, TranslationPrompt};
use crate::metrics::TranslationMetrics;
use crate::persistence::BulkPersistenceEngine;
use crate::retry::{with_retry_if, RetryConfig};
use crate::tm::{MatchOptions, TmUpsert, TranslationMemoryIndex};
use crate::validation::{TranslationValidator, ValidationIssue};
use chrono::Utc;
use control::{BatchControl, ControlHandle};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Snapshots buffered before the batch task waits for the consumer
const PROGRESS_CHANNEL_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct BatchOrchestrator {
    db: Database,
    tm: TranslationMemoryIndex,
    persistence: BulkPersistenceEngine,
    bus: EventBus,
    llm: Arc<dyn LlmClient>,
    prompts: Arc<dyn PromptBuilder>,
    retry: RetryConfig,
    match_options: MatchOptions,
    metrics: Arc<TranslationMetrics>,
    controls: Arc<Mutex<HashMap<String, BatchControl>>>,
}

impl BatchOrchestrator {
    pub fn new(
        db: Database,
        bus: EventBus,
        llm: Arc<dyn LlmClient>,
        prompts: Arc<dyn PromptBuilder>,
    ) -> Self {
        Self {
            tm: TranslationMemoryIndex::new(db.clone()),
            persistence: BulkPersistenceEngine::new(db.clone()).with_bus(bus.clone()),
            db,
            bus,
            llm,
            prompts,
            retry: RetryConfig::default(),
            match_options: MatchOptions::default(),
            metrics: Arc::new(TranslationMetrics::new()),
            controls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_match_options(mut self, match_options: MatchOptions) -> Self {
        self.match_options = match_options;
        self
    }

    pub fn with_persistence(mut self, persistence: BulkPersistenceEngine) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn metrics(&self) -> &TranslationMetrics {
        &self.metrics
    }

    /// Translate the pending units of `batch_id`, streaming progress.
    ///
    /// The batch runs on a spawned task, so this must be called from within a
    /// tokio runtime. A fatal error is yielded as the last item of the stream.
    /// Units already completed or failed in an earlier run are not retranslated.
    ///
    /// Snapshots go through a bounded buffer of 64. A caller that holds the
    /// stream without reading it stalls the batch once the buffer is full;
    /// dropping the stream lets the batch run to the end unobserved.
    pub fn translate_batch(
        &self,
        batch_id: &str,
        context: TranslationContext,
    ) -> BoxStream<'static, Result<TranslationProgress>> {
        if let Err(e) = context.validate() {
            return stream::once(async move { Err(e) }).boxed();
        }
        let control = match self.register(batch_id) {
            Ok(control) => control,
            Err(e) => return stream::once(async move { Err(e) }).boxed(),
        };

        let (tx, rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
        let run = BatchRun {
            orchestrator: self.clone(),
            batch_id: batch_id.to_string(),
            context,
            control,
            tx,
            progress: TranslationProgress::new(batch_id, 0, 0),
            eta: EtaEstimator::default(),
            scope: None,
            processed_at_start: 0,
            tm_sourced: 0,
        };
        tokio::spawn(run.execute());

        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
    }

    /// Pause before the next chunk
    pub fn pause_translation(&self, batch_id: &str) -> Result<()> {
        let controls = self.lock_controls();
        let control = running_control(&controls, batch_id)?;
        if control.is_stopping() {
            return Err(TranslationError::invalid_state(batch_id, "batch is stopping"));
        }
        if !control.pause() {
            return Err(TranslationError::invalid_state(batch_id, "batch is already paused"));
        }
        info!("Pause requested for batch {}", batch_id);
        Ok(())
    }

    pub fn resume_translation(&self, batch_id: &str) -> Result<()> {
        let controls = self.lock_controls();
        let control = running_control(&controls, batch_id)?;
        if !control.resume() {
            return Err(TranslationError::invalid_state(batch_id, "batch is not paused"));
        }
        info!("Resume requested for batch {}", batch_id);
        Ok(())
    }

    /// Finish and save the chunk in flight, then end the batch as cancelled
    pub fn stop_translation(&self, batch_id: &str) -> Result<()> {
        let controls = self.lock_controls();
        let control = running_control(&controls, batch_id)?;
        if control.is_stopping() {
            return Err(TranslationError::invalid_state(batch_id, "batch is already stopping"));
        }
        control.stop();
        info!("Stop requested for batch {}", batch_id);
        Ok(())
    }

    /// Abandon the chunk in flight and end the batch as cancelled.
    ///
    /// Chunks saved before the cancellation are kept; the abandoned units stay
    /// pending and are picked up if the batch is run again.
    pub fn cancel_translation(&self, batch_id: &str) -> Result<()> {
        let controls = self.lock_controls();
        let control = running_control(&controls, batch_id)?;
        if control.is_cancelled() {
            return Err(TranslationError::invalid_state(batch_id, "batch is already cancelled"));
        }
        control.cancel();
        info!("Cancel requested for batch {}", batch_id);
        Ok(())
    }

    /// Ids of the batches currently running or paused
    pub fn active_batches(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock_controls().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn register(&self, batch_id: &str) -> Result<ControlHandle> {
        let mut controls = self.lock_controls();
        if controls.contains_key(batch_id) {
            return Err(TranslationError::invalid_state(batch_id, "batch is already running"));
        }
        let control = BatchControl::new();
        let handle = control.handle();
        controls.insert(batch_id.to_string(), control);
        Ok(handle)
    }

    fn unregister(&self, batch_id: &str) {
        self.lock_controls().remove(batch_id);
    }

    fn lock_controls(&self) -> MutexGuard<'_, HashMap<String, BatchControl>> {
        self.controls.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn running_control<'a>(
    controls: &'a HashMap<String, BatchControl>,
    batch_id: &str,
) -> Result<&'a BatchControl> {
    controls
        .get(batch_id)
        .ok_or_else(|| TranslationError::invalid_state(batch_id, "batch is not running"))
}

#[derive(Debug, Clone)]
struct BatchScope {
    project_id: String,
    project_language_id: String,
    language_id: String,
}

/// Outcome of one chunk, written in one go at the end of the chunk
#[derive(Debug, Default)]
struct ChunkResults {
    versions: Vec<TranslationVersion>,
    updates: Vec<BatchUnitUpdate>,
    reused_tm_ids: Vec<String>,
    tm_updates: Vec<TmUpsert>,
}

impl ChunkResults {
    fn succeed(&mut self, unit: &BatchUnit, version: TranslationVersion) {
        self.updates.push(BatchUnitUpdate {
            unit_id: unit.unit_id.clone(),
            status: BatchUnitStatus::Completed,
            error_message: None,
        });
        self.versions.push(version);
    }

    /// `version` is the unit's version marked as `error`
    fn fail(&mut self, unit: &BatchUnit, message: impl Into<String>, version: TranslationVersion) {
        self.updates.push(BatchUnitUpdate {
            unit_id: unit.unit_id.clone(),
            status: BatchUnitStatus::Failed,
            error_message: Some(message.into()),
        });
        self.versions.push(version);
    }
}

/// State of one `translate_batch` call, owned by its task
struct BatchRun {
    orchestrator: BatchOrchestrator,
    batch_id: String,
    context: TranslationContext,
    control: ControlHandle,
    tx: mpsc::Sender<Result<TranslationProgress>>,
    progress: TranslationProgress,
    eta: EtaEstimator,
    scope: Option<BatchScope>,
    /// Units credited from earlier runs
    processed_at_start: usize,
    /// Units served from translation memory in this run
    tm_sourced: usize,
}

impl BatchRun {
    async fn execute(mut self) {
        if let Err(e) = self.run().await {
            self.fail(e).await;
        }
        self.orchestrator.unregister(&self.batch_id);
    }

    async fn run(&mut self) -> Result<()> {
        let db = self.orchestrator.db.clone();
        let batch = db
            .get_batch(&self.batch_id)?
            .ok_or_else(|| TranslationError::NotFound(format!("batch {}", self.batch_id)))?;
        let project_language = db
            .get_project_language(&batch.project_language_id)?
            .ok_or_else(|| {
                TranslationError::NotFound(format!(
                    "project language {}",
                    batch.project_language_id
                ))
            })?;
        let scope = BatchScope {
            project_id: project_language.project_id,
            project_language_id: project_language.id,
            language_id: project_language.language_id,
        };
        self.scope = Some(scope.clone());

        let pending = db.load_pending_batch_units(&self.batch_id)?;
        let (completed, failed) = db.batch_unit_counts(&self.batch_id)?;
        // rows neither pending nor recorded belong to obsolete units
        let skipped = batch
            .units_count
            .saturating_sub(pending.len() + completed + failed);
        let total_chunks = pending.len().div_ceil(self.context.units_per_batch);

        self.progress = TranslationProgress::new(&self.batch_id, batch.units_count, total_chunks);
        self.progress.successful_units = completed;
        self.progress.failed_units = failed;
        self.progress.skipped_units = skipped;
        self.progress.processed_units = completed + failed + skipped;
        self.progress.status = TranslationProgressStatus::InProgress;
        self.processed_at_start = self.progress.processed_units;

        db.mark_batch_started(&self.batch_id)?;
        info!(
            "Starting batch {}: {} pending units in {} chunks ({} already processed)",
            self.batch_id,
            pending.len(),
            total_chunks,
            self.progress.processed_units
        );
        self.orchestrator.bus.publish(BatchStarted {
            batch_id: self.batch_id.clone(),
            project_id: scope.project_id.clone(),
            project_language_id: scope.project_language_id.clone(),
            total_units: batch.units_count,
            at: Utc::now(),
        });
        self.emit().await;

        for (index, chunk) in pending.chunks(self.context.units_per_batch).enumerate() {
            if self.control.is_paused() && !self.control.should_stop() {
                self.pause_point(&scope).await?;
            }
            if self.control.should_stop() {
                return self.finish_cancelled(&scope).await;
            }

            self.progress.current_chunk = index + 1;
            let started = Instant::now();
            if !self.process_chunk(&scope, chunk).await? {
                return self.finish_cancelled(&scope).await;
            }

            self.eta.record(chunk.len(), started.elapsed());
            self.progress.estimated_seconds_remaining =
                self.eta.estimate(self.progress.remaining_units());
            self.orchestrator.bus.publish(BatchProgressed {
                batch_id: self.batch_id.clone(),
                project_id: scope.project_id.clone(),
                total_units: self.progress.total_units,
                completed_units: self.progress.successful_units,
                failed_units: self.progress.failed_units,
                progress_percent: self.progress.progress_percent(),
                at: Utc::now(),
            });
            self.emit().await;
        }

        self.finish_completed(&scope).await
    }

    /// Process one chunk; returns false when cancelled mid-chunk
    async fn process_chunk(&mut self, scope: &BatchScope, chunk: &[BatchUnit]) -> Result<bool> {
        debug!(
            "Batch {}: chunk {}/{} with {} units",
            self.batch_id,
            self.progress.current_chunk,
            self.progress.total_chunks,
            chunk.len()
        );
        let checkpoint = (self.progress.checkpoint(), self.tm_sourced);
        let mut results = ChunkResults::default();
        let mut remaining: Vec<&BatchUnit> = chunk.iter().collect();

        if !self.context.skip_translation_memory {
            self.set_phase(TranslationPhase::TmExactLookup).await;
            remaining = self.exact_lookup(scope, remaining, &mut results).await;
            if !remaining.is_empty() {
                self.set_phase(TranslationPhase::TmFuzzyLookup).await;
                remaining = self.fuzzy_lookup(scope, remaining, &mut results).await;
            }
        }

        if !remaining.is_empty() {
            let llm_units: Vec<LlmUnit> = remaining
                .iter()
                .map(|unit| LlmUnit {
                    unit_id: unit.unit_id.clone(),
                    key: unit.key.clone(),
                    source_text: unit.source_text.clone(),
                    context: unit.context.clone(),
                })
                .collect();

            self.set_phase(TranslationPhase::BuildingPrompt).await;
            let prompts = self.orchestrator.prompts.clone();
            let prompt = prompts.build(&llm_units, &self.context).await;
            match prompt {
                Ok(prompt) => {
                    self.set_phase(TranslationPhase::LlmTranslation).await;
                    let Some(response) = self.call_llm(&prompt, &llm_units).await else {
                        info!(
                            "Batch {}: abandoned chunk {} after cancellation",
                            self.batch_id, self.progress.current_chunk
                        );
                        let (counts, tm_sourced) = checkpoint;
                        self.progress.restore(counts);
                        self.tm_sourced = tm_sourced;
                        self.refresh_reuse_rate();
                        return Ok(false);
                    };
                    match response {
                        Ok(response) => {
                            self.set_phase(TranslationPhase::Validating).await;
                            for unit in &remaining {
                                let Some(text) = response.translations.get(&unit.unit_id) else {
                                    let message = "missing from LLM response";
                                    self.fail_unit(scope, unit, message, None, &mut results).await;
                                    continue;
                                };
                                match accept_llm_translation(scope, unit, text, &mut results) {
                                    Ok(()) => self.unit_succeeded(TranslationSource::Llm).await,
                                    Err(issues) => {
                                        let issues_json = serde_json::to_string(&issues).ok();
                                        let error = TranslationError::Validation(issues);
                                        let message = error.to_string();
                                        if error.is_critical() {
                                            warn!("Unit {} rejected: {}", unit.unit_id, message);
                                        } else {
                                            debug!("Unit {} rejected: {}", unit.unit_id, message);
                                        }
                                        self.fail_unit(scope, unit, message, issues_json, &mut results)
                                            .await;
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            warn!(
                                "Batch {}: LLM call for chunk {} failed: {}",
                                self.batch_id, self.progress.current_chunk, e
                            );
                            let message = e.to_string();
                            for unit in &remaining {
                                self.fail_unit(scope, unit, message.as_str(), None, &mut results)
                                    .await;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        "Batch {}: could not build prompt for chunk {}: {}",
                        self.batch_id, self.progress.current_chunk, e
                    );
                    let message = e.to_string();
                    for unit in &remaining {
                        self.fail_unit(scope, unit, message.as_str(), None, &mut results)
                            .await;
                    }
                }
            }
        }

        if !results.versions.is_empty() {
            self.set_phase(TranslationPhase::Saving).await;
            self.orchestrator.persistence.upsert_batch(&results.versions)?;
            self.orchestrator.bus.publish(TranslationsSaved {
                batch_id: self.batch_id.clone(),
                project_id: scope.project_id.clone(),
                project_language_id: scope.project_language_id.clone(),
                unit_ids: results.versions.iter().map(|v| v.unit_id.clone()).collect(),
                at: Utc::now(),
            });
        }

        if !results.tm_updates.is_empty() || !results.reused_tm_ids.is_empty() {
            self.set_phase(TranslationPhase::UpdatingTm).await;
            self.update_translation_memory(&results);
        }

        self.orchestrator
            .db
            .record_batch_units(&self.batch_id, &results.updates)?;
        Ok(true)
    }

    /// Count a finished unit and emit a snapshot
    async fn unit_succeeded(&mut self, source: TranslationSource) {
        self.progress.record_success();
        if source.is_translation_memory() {
            self.tm_sourced += 1;
        }
        self.refresh_reuse_rate();
        self.emit().await;
    }

    /// Fail `unit`, keeping any text its version already had, and emit a snapshot
    async fn fail_unit(
        &mut self,
        scope: &BatchScope,
        unit: &BatchUnit,
        message: impl Into<String>,
        validation_issues: Option<String>,
        results: &mut ChunkResults,
    ) {
        let existing = self
            .orchestrator
            .db
            .get_version(&unit.unit_id, &scope.project_language_id)
            .unwrap_or_else(|e| {
                warn!("Could not load version of unit {}: {}", unit.unit_id, e);
                None
            });
        let mut version = existing.unwrap_or_else(|| {
            TranslationVersion::new(
                &unit.unit_id,
                &scope.project_language_id,
                None,
                TranslationStatus::Error,
                TranslationSource::Llm,
            )
        });
        version.status = TranslationStatus::Error;
        version.validation_issues = validation_issues;
        version.updated_at = Utc::now();

        results.fail(unit, message, version);
        self.progress.record_failure(unit.unit_id.clone());
        self.refresh_reuse_rate();
        self.emit().await;
    }

    fn refresh_reuse_rate(&mut self) {
        let processed = self
            .progress
            .processed_units
            .saturating_sub(self.processed_at_start);
        self.progress.tm_reuse_rate = if processed == 0 {
            0.0
        } else {
            self.tm_sourced as f64 / processed as f64
        };
    }

    async fn exact_lookup<'a>(
        &mut self,
        scope: &BatchScope,
        units: Vec<&'a BatchUnit>,
        results: &mut ChunkResults,
    ) -> Vec<&'a BatchUnit> {
        let mut misses = Vec::with_capacity(units.len());
        for unit in units {
            match self
                .orchestrator
                .tm
                .find_exact(&unit.source_text, &scope.language_id)
            {
                Ok(Some(entry)) => {
                    self.orchestrator.metrics.record_tm_exact_hit();
                    results.reused_tm_ids.push(entry.id);
                    results.succeed(
                        unit,
                        TranslationVersion::new(
                            &unit.unit_id,
                            &scope.project_language_id,
                            Some(entry.translated_text),
                            TranslationStatus::Translated,
                            TranslationSource::TmExact,
                        ),
                    );
                    self.unit_succeeded(TranslationSource::TmExact).await;
                }
                Ok(None) => misses.push(unit),
                Err(e) => {
                    warn!("Exact TM lookup failed for unit {}: {}", unit.unit_id, e);
                    misses.push(unit);
                }
            }
        }
        misses
    }

    async fn fuzzy_lookup<'a>(
        &mut self,
        scope: &BatchScope,
        units: Vec<&'a BatchUnit>,
        results: &mut ChunkResults,
    ) -> Vec<&'a BatchUnit> {
        let threshold = self.context.fuzzy_accept_threshold;
        let mut misses = Vec::with_capacity(units.len());
        for unit in units {
            let best = match self.orchestrator.tm.find_matches(
                &unit.source_text,
                &scope.language_id,
                self.orchestrator.match_options,
            ) {
                Ok(matches) => matches.into_iter().next().filter(|m| m.similarity >= threshold),
                Err(e) => {
                    warn!("Fuzzy TM lookup failed for unit {}: {}", unit.unit_id, e);
                    None
                }
            };

            match best {
                Some(tm_match) => {
                    debug!(
                        "Unit {} reuses TM entry {} at {:.3}",
                        unit.unit_id, tm_match.entry.id, tm_match.similarity
                    );
                    self.orchestrator.metrics.record_tm_fuzzy_hit();
                    results.reused_tm_ids.push(tm_match.entry.id);
                    results.succeed(
                        unit,
                        TranslationVersion::new(
                            &unit.unit_id,
                            &scope.project_language_id,
                            Some(tm_match.entry.translated_text),
                            TranslationStatus::NeedsReview,
                            TranslationSource::TmFuzzy,
                        ),
                    );
                    self.unit_succeeded(TranslationSource::TmFuzzy).await;
                }
                None => {
                    self.orchestrator.metrics.record_tm_miss();
                    misses.push(unit);
                }
            }
        }
        misses
    }

    /// `None` when the batch was cancelled before the call returned
    async fn call_llm(
        &mut self,
        prompt: &TranslationPrompt,
        units: &[LlmUnit],
    ) -> Option<std::result::Result<LlmResponse, LlmError>> {
        let started = Instant::now();
        let orchestrator = &self.orchestrator;
        let context = &self.context;
        let call = with_retry_if(
            &orchestrator.retry,
            "llm_translate",
            || orchestrator.llm.translate(prompt, units, context),
            LlmError::is_retryable,
        );

        let outcome = tokio::select! {
            biased;
            _ = self.control.cancelled() => None,
            result = call => Some(result),
        };
        let result = outcome?;

        let (tokens_used, error) = match &result {
            Ok(response) => (response.tokens_used, None),
            Err(e) => (0, Some(e.to_string())),
        };
        self.orchestrator.metrics.record_llm_call(tokens_used);
        if error.is_some() {
            self.orchestrator.metrics.record_llm_failure();
        }
        self.progress.push_llm_log(LlmExchangeLog {
            chunk: self.progress.current_chunk,
            unit_count: units.len(),
            prompt_chars: prompt.system.chars().count() + prompt.user.chars().count(),
            tokens_used,
            duration_ms: started.elapsed().as_millis() as u64,
            error,
            at: Utc::now(),
        });
        Some(result)
    }

    fn update_translation_memory(&self, results: &ChunkResults) {
        let tm = &self.orchestrator.tm;
        if !results.tm_updates.is_empty() {
            if let Err(e) = tm.upsert_batch(&results.tm_updates) {
                warn!("Batch {}: failed to update translation memory: {}", self.batch_id, e);
            }
        }
        if !results.reused_tm_ids.is_empty() {
            if let Err(e) = tm.increment_usage(&results.reused_tm_ids) {
                warn!("Batch {}: failed to record TM usage: {}", self.batch_id, e);
            }
        }
    }

    async fn pause_point(&mut self, scope: &BatchScope) -> Result<()> {
        let db = self.orchestrator.db.clone();
        db.set_batch_status(
            &self.batch_id,
            TranslationProgressStatus::Paused.as_str(),
            None,
            false,
        )?;
        self.progress.status = TranslationProgressStatus::Paused;
        self.progress.estimated_seconds_remaining = None;
        self.orchestrator.bus.publish(BatchPaused {
            batch_id: self.batch_id.clone(),
            project_id: scope.project_id.clone(),
            at: Utc::now(),
        });
        info!(
            "Batch {} paused after {}/{} units",
            self.batch_id, self.progress.processed_units, self.progress.total_units
        );
        self.emit().await;

        self.control.wait_while_paused().await;
        if self.control.should_stop() {
            return Ok(());
        }

        db.set_batch_status(
            &self.batch_id,
            TranslationProgressStatus::InProgress.as_str(),
            None,
            false,
        )?;
        self.progress.status = TranslationProgressStatus::InProgress;
        self.orchestrator.bus.publish(BatchResumed {
            batch_id: self.batch_id.clone(),
            project_id: scope.project_id.clone(),
            at: Utc::now(),
        });
        info!("Batch {} resumed", self.batch_id);
        self.emit().await;
        Ok(())
    }

    async fn finish_completed(&mut self, scope: &BatchScope) -> Result<()> {
        self.set_phase(TranslationPhase::Finalizing).await;
        self.orchestrator.db.set_batch_status(
            &self.batch_id,
            TranslationProgressStatus::Completed.as_str(),
            None,
            true,
        )?;
        self.orchestrator.bus.publish(BatchCompleted {
            batch_id: self.batch_id.clone(),
            project_id: scope.project_id.clone(),
            successful_units: self.progress.successful_units,
            failed_units: self.progress.failed_units,
            skipped_units: self.progress.skipped_units,
            at: Utc::now(),
        });

        if self.progress.failed_units > 0 {
            let partial = TranslationError::PartialTranslation {
                successful: self.progress.successful_units,
                failed: self.progress.failed_units,
                failed_unit_ids: self.progress.failed_unit_ids.clone(),
            };
            warn!("Batch {}: {}", self.batch_id, partial);
        }
        info!(
            "✓ Batch {} completed: {} translated, {} failed, {} skipped",
            self.batch_id,
            self.progress.successful_units,
            self.progress.failed_units,
            self.progress.skipped_units
        );
        self.log_metrics();

        self.progress.status = TranslationProgressStatus::Completed;
        self.progress.phase = TranslationPhase::Completed;
        self.progress.estimated_seconds_remaining = Some(0.0);
        self.emit().await;
        Ok(())
    }

    async fn finish_cancelled(&mut self, scope: &BatchScope) -> Result<()> {
        self.orchestrator.db.set_batch_status(
            &self.batch_id,
            TranslationProgressStatus::Cancelled.as_str(),
            None,
            true,
        )?;
        self.orchestrator.bus.publish(BatchCancelled {
            batch_id: self.batch_id.clone(),
            project_id: scope.project_id.clone(),
            processed_units: self.progress.processed_units,
            at: Utc::now(),
        });
        info!(
            "Batch {} {} after {}/{} units",
            self.batch_id,
            if self.control.is_cancelled() { "cancelled" } else { "stopped" },
            self.progress.processed_units,
            self.progress.total_units
        );
        self.log_metrics();

        self.progress.status = TranslationProgressStatus::Cancelled;
        self.progress.estimated_seconds_remaining = None;
        self.emit().await;
        Ok(())
    }

    async fn fail(&mut self, err: TranslationError) {
        error!("Batch {} failed: {}", self.batch_id, err);
        let message = err.to_string();
        if let Err(e) = self.orchestrator.db.set_batch_status(
            &self.batch_id,
            TranslationProgressStatus::Failed.as_str(),
            Some(&message),
            true,
        ) {
            warn!("Could not mark batch {} as failed: {}", self.batch_id, e);
        }
        if let Some(scope) = &self.scope {
            self.orchestrator.bus.publish(BatchFailed {
                batch_id: self.batch_id.clone(),
                project_id: scope.project_id.clone(),
                error: message,
                at: Utc::now(),
            });
        }
        self.progress.status = TranslationProgressStatus::Failed;
        if self.tx.send(Err(err)).await.is_err() {
            debug!("Progress receiver for batch {} is gone", self.batch_id);
        }
    }

    async fn set_phase(&mut self, phase: TranslationPhase) {
        self.progress.phase = phase;
        self.emit().await;
    }

    async fn emit(&mut self) {
        self.progress.updated_at = Utc::now();
        if self.tx.send(Ok(self.progress.clone())).await.is_err() {
            debug!("Progress receiver for batch {} is gone", self.batch_id);
        }
    }

    fn log_metrics(&self) {
        match serde_json::to_string(&self.orchestrator.metrics.report()) {
            Ok(json) => info!("Translation metrics after batch {}: {}", self.batch_id, json),
            Err(e) => warn!("Failed to serialize translation metrics: {}", e),
        }
    }
}

/// Validate an LLM translation: warnings need review, errors are returned
fn accept_llm_translation(
    scope: &BatchScope,
    unit: &BatchUnit,
    text: &str,
    results: &mut ChunkResults,
) -> std::result::Result<(), Vec<ValidationIssue>> {
    let report = TranslationValidator::validate(&unit.source_text, text);
    if report.has_errors() {
        return Err(report.issues);
    }

    let status = if report.has_warnings() {
        TranslationStatus::NeedsReview
    } else {
        TranslationStatus::Translated
    };
    let mut version = TranslationVersion::new(
        &unit.unit_id,
        &scope.project_language_id,
        Some(text.to_string()),
        status,
        TranslationSource::Llm,
    );
    if !report.is_clean() {
        version.validation_issues = serde_json::to_string(&report.issues).ok();
    }
    if status == TranslationStatus::Translated {
        results.tm_updates.push(TmUpsert::new(
            unit.source_text.as_str(),
            text,
            scope.language_id.as_str(),
        ));
    }
    results.succeed(unit, version);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{create_test_db, seed_project};
    use crate::db::{NewUnit, ProjectLanguage, TranslationUnit};
    use crate::events::DomainEvent;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::Semaphore;
    use tokio::time::timeout;

    type ProgressStream = BoxStream<'static, Result<TranslationProgress>>;

    struct MockLlm {
        translate: Box<dyn Fn(&str) -> String + Send + Sync>,
        omit_unit_ids: HashSet<String>,
        error_status: Option<u16>,
        gate: Option<Arc<Semaphore>>,
        units_per_call: Mutex<Vec<usize>>,
    }

    impl MockLlm {
        fn new() -> Self {
            Self {
                translate: Box::new(|source| format!("fr: {}", source)),
                omit_unit_ids: HashSet::new(),
                error_status: None,
                gate: None,
                units_per_call: Mutex::new(Vec::new()),
            }
        }

        fn gated(gate: Arc<Semaphore>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::new()
            }
        }

        fn calls(&self) -> Vec<usize> {
            self.units_per_call.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LlmClient for MockLlm {
        async fn translate(
            &self,
            _prompt: &TranslationPrompt,
            units: &[LlmUnit],
            _context: &TranslationContext,
        ) -> std::result::Result<LlmResponse, LlmError> {
            self.units_per_call.lock().unwrap().push(units.len());
            if let Some(gate) = &self.gate {
                gate.acquire()
                    .await
                    .map_err(|_| LlmError::Network("gate closed".to_string()))?
                    .forget();
            }
            if let Some(status) = self.error_status {
                return Err(LlmError::Api {
                    status,
                    message: "rejected".to_string(),
                });
            }
            let translations = units
                .iter()
                .filter(|u| !self.omit_unit_ids.contains(&u.unit_id))
                .map(|u| (u.unit_id.clone(), (self.translate)(u.source_text.as_str())))
                .collect();
            Ok(LlmResponse {
                translations,
                tokens_used: 10 * units.len() as u64,
            })
        }
    }

    struct MockPrompts;

    #[async_trait]
    impl PromptBuilder for MockPrompts {
        async fn build(
            &self,
            units: &[LlmUnit],
            _context: &TranslationContext,
        ) -> Result<TranslationPrompt> {
            Ok(TranslationPrompt {
                system: "Translate into French".to_string(),
                user: units
                    .iter()
                    .map(|u| u.source_text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n"),
            })
        }
    }

    fn orchestrator(db: &Database, bus: &EventBus, llm: Arc<MockLlm>) -> BatchOrchestrator {
        BatchOrchestrator::new(db.clone(), bus.clone(), llm, Arc::new(MockPrompts))
            .with_retry(RetryConfig::new(2, Duration::from_millis(1)))
    }

    fn create_batch(db: &Database, pl: &ProjectLanguage, units: &[TranslationUnit]) -> String {
        let ids: Vec<String> = units.iter().map(|u| u.id.clone()).collect();
        db.create_batch(&pl.id, "mock", &ids).expect("create batch")
    }

    fn seed_units(db: &Database, sources: &[&str]) -> (ProjectLanguage, Vec<TranslationUnit>) {
        let pl = db.create_project_language("proj", "fr").expect("project language");
        let units: Vec<NewUnit> = sources
            .iter()
            .enumerate()
            .map(|(i, source)| NewUnit {
                key: format!("key_{}", i),
                source_text: source.to_string(),
                context: None,
            })
            .collect();
        let units = db.insert_units("proj", &units).expect("insert units");
        (pl, units)
    }

    async fn drain(stream: ProgressStream) -> Vec<Result<TranslationProgress>> {
        timeout(Duration::from_secs(10), stream.collect::<Vec<_>>())
            .await
            .expect("batch should finish")
    }

    fn last_progress(items: &[Result<TranslationProgress>]) -> &TranslationProgress {
        match items.last() {
            Some(Ok(progress)) => progress,
            Some(Err(e)) => panic!("batch ended with error: {}", e),
            None => panic!("no progress emitted"),
        }
    }

    async fn wait_for(
        stream: &mut ProgressStream,
        predicate: impl Fn(&TranslationProgress) -> bool,
    ) -> TranslationProgress {
        loop {
            let item = timeout(Duration::from_secs(10), stream.next())
                .await
                .expect("progress in time")
                .expect("stream still open")
                .expect("progress, not an error");
            if predicate(&item) {
                return item;
            }
        }
    }

    fn in_llm_phase(progress: &TranslationProgress) -> bool {
        progress.phase == TranslationPhase::LlmTranslation
    }

    struct Fixture {
        db: Database,
        bus: EventBus,
        pl: ProjectLanguage,
        units: Vec<TranslationUnit>,
        batch_id: String,
        _temp_dir: TempDir,
    }

    fn fixture(count: usize) -> Fixture {
        let (db, temp_dir) = create_test_db();
        let (pl, units) = seed_project(&db, count);
        let batch_id = create_batch(&db, &pl, &units);
        Fixture {
            db,
            bus: EventBus::default(),
            pl,
            units,
            batch_id,
            _temp_dir: temp_dir,
        }
    }

    // ==================== Happy Path Tests ====================

    #[tokio::test]
    async fn test_failed_unit_is_counted_and_batch_completes() {
        let f = fixture(3);
        let mut llm = MockLlm::new();
        llm.omit_unit_ids.insert(f.units[1].id.clone());
        let llm = Arc::new(llm);
        let orchestrator = orchestrator(&f.db, &f.bus, llm.clone());

        let items = drain(orchestrator.translate_batch(&f.batch_id, TranslationContext::new("mock"))).await;
        let progress = last_progress(&items);

        assert_eq!(progress.status, TranslationProgressStatus::Completed);
        assert_eq!(progress.phase, TranslationPhase::Completed);
        assert_eq!(progress.successful_units, 2);
        assert_eq!(progress.failed_units, 1);
        assert_eq!(progress.processed_units, 3);
        assert_eq!(progress.failed_unit_ids, vec![f.units[1].id.clone()]);
        assert_eq!(progress.tokens_used, 30);
        assert_eq!(progress.llm_logs.len(), 1);
        assert_eq!(llm.calls(), vec![3]);

        let batch = f.db.get_batch(&f.batch_id).unwrap().unwrap();
        assert_eq!(batch.status, "completed");
        assert_eq!(batch.units_completed, 2);
        assert_eq!(batch.units_failed, 1);

        let version = f.db.get_version(&f.units[0].id, &f.pl.id).unwrap().unwrap();
        assert_eq!(version.translated_text.as_deref(), Some("fr: Source text number 0"));
        assert_eq!(version.status, TranslationStatus::Translated);
        assert_eq!(version.translation_source, TranslationSource::Llm);

        let failed = f.db.get_version(&f.units[1].id, &f.pl.id).unwrap().unwrap();
        assert_eq!(failed.status, TranslationStatus::Error);
        assert!(failed.translated_text.is_none());

        // clean LLM output is fed back into translation memory
        let tm = TranslationMemoryIndex::new(f.db.clone());
        let entry = tm.find_exact("Source text number 2", "fr").unwrap().unwrap();
        assert_eq!(entry.translated_text, "fr: Source text number 2");
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_chunked() {
        let f = fixture(5);
        let llm = Arc::new(MockLlm::new());
        let orchestrator = orchestrator(&f.db, &f.bus, llm.clone());

        let context = TranslationContext::new("mock").with_units_per_batch(2);
        let items = drain(orchestrator.translate_batch(&f.batch_id, context)).await;

        let snapshots: Vec<&TranslationProgress> =
            items.iter().map(|i| i.as_ref().expect("no errors")).collect();
        assert_eq!(snapshots[0].status, TranslationProgressStatus::InProgress);
        assert_eq!(snapshots[0].total_chunks, 3);
        for pair in snapshots.windows(2) {
            assert!(pair[1].processed_units >= pair[0].processed_units);
        }
        assert_eq!(llm.calls(), vec![2, 2, 1]);

        let last = snapshots.last().unwrap();
        assert_eq!(last.processed_units, 5);
        assert_eq!(last.current_chunk, 3);
        assert_eq!(last.progress_percent(), 100.0);
    }

    #[tokio::test]
    async fn test_each_unit_emits_its_own_snapshot() {
        let f = fixture(3);
        let mut llm = MockLlm::new();
        llm.omit_unit_ids.insert(f.units[1].id.clone());
        let orchestrator = orchestrator(&f.db, &f.bus, Arc::new(llm));

        let items = drain(orchestrator.translate_batch(&f.batch_id, TranslationContext::new("mock"))).await;
        let snapshots: Vec<&TranslationProgress> =
            items.iter().map(|i| i.as_ref().expect("no errors")).collect();

        let mut processed: Vec<usize> = snapshots.iter().map(|p| p.processed_units).collect();
        processed.dedup();
        assert_eq!(processed, vec![0, 1, 2, 3]);

        // all three land while the single chunk is validated
        let validating: Vec<(usize, usize)> = snapshots
            .iter()
            .filter(|p| p.phase == TranslationPhase::Validating)
            .map(|p| (p.successful_units, p.failed_units))
            .collect();
        assert_eq!(validating, vec![(0, 0), (1, 0), (1, 1), (2, 1)]);
    }

    #[tokio::test]
    async fn test_translation_memory_hits_skip_the_llm() {
        let (db, _temp_dir) = create_test_db();
        let (pl, units) = seed_units(
            &db,
            &["Attack the castle gate", "Recruit more archers", "Open the trade menu"],
        );
        let batch_id = create_batch(&db, &pl, &units);

        let tm = TranslationMemoryIndex::new(db.clone());
        tm.upsert_batch(&[
            TmUpsert::new("Open the trade menu", "Ouvrir le menu commerce", "fr"),
            TmUpsert::new("Recruit more archers!", "Recruter plus d'archers !", "fr"),
        ])
        .unwrap();

        let llm = Arc::new(MockLlm::new());
        let bus = EventBus::default();
        let orchestrator = orchestrator(&db, &bus, llm.clone());
        let items = drain(orchestrator.translate_batch(&batch_id, TranslationContext::new("mock"))).await;
        let progress = last_progress(&items);

        assert_eq!(progress.successful_units, 3);
        assert!((progress.tm_reuse_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(llm.calls(), vec![1]);

        let exact = db.get_version(&units[2].id, &pl.id).unwrap().unwrap();
        assert_eq!(exact.translation_source, TranslationSource::TmExact);
        assert_eq!(exact.status, TranslationStatus::Translated);
        assert_eq!(exact.translated_text.as_deref(), Some("Ouvrir le menu commerce"));

        // 1 - 1/21 = 0.952, above the 0.95 accept threshold
        let fuzzy = db.get_version(&units[1].id, &pl.id).unwrap().unwrap();
        assert_eq!(fuzzy.translation_source, TranslationSource::TmFuzzy);
        assert_eq!(fuzzy.status, TranslationStatus::NeedsReview);
        assert_eq!(fuzzy.translated_text.as_deref(), Some("Recruter plus d'archers !"));

        let llm_version = db.get_version(&units[0].id, &pl.id).unwrap().unwrap();
        assert_eq!(llm_version.translation_source, TranslationSource::Llm);

        let reused = tm.find_exact("Open the trade menu", "fr").unwrap().unwrap();
        assert_eq!(reused.usage_count, 2);
        let metrics = orchestrator.metrics().report();
        assert_eq!(metrics.tm_exact_hits, 1);
        assert_eq!(metrics.tm_fuzzy_hits, 1);
        assert_eq!(metrics.tm_misses, 1);
    }

    #[tokio::test]
    async fn test_skip_translation_memory_sends_everything_to_llm() {
        let f = fixture(2);
        TranslationMemoryIndex::new(f.db.clone())
            .upsert_batch(&[TmUpsert::new("Source text number 0", "Texte 0", "fr")])
            .unwrap();
        let llm = Arc::new(MockLlm::new());
        let orchestrator = orchestrator(&f.db, &f.bus, llm.clone());

        let context = TranslationContext::new("mock").skipping_translation_memory();
        let items = drain(orchestrator.translate_batch(&f.batch_id, context)).await;

        assert_eq!(last_progress(&items).successful_units, 2);
        assert_eq!(llm.calls(), vec![2]);
        let version = f.db.get_version(&f.units[0].id, &f.pl.id).unwrap().unwrap();
        assert_eq!(version.translation_source, TranslationSource::Llm);
    }

    // ==================== Validation Tests ====================

    #[tokio::test]
    async fn test_validation_errors_fail_and_warnings_need_review() {
        let (db, _temp_dir) = create_test_db();
        let (pl, units) = seed_units(&db, &["Deal {0} damage", "Hold the line"]);
        let batch_id = create_batch(&db, &pl, &units);

        let mut llm = MockLlm::new();
        llm.translate = Box::new(|source| {
            if source.contains("{0}") {
                "Infliger des dégâts".to_string()
            } else {
                source.to_string()
            }
        });
        let bus = EventBus::default();
        let orchestrator = orchestrator(&db, &bus, Arc::new(llm));
        let items = drain(orchestrator.translate_batch(&batch_id, TranslationContext::new("mock"))).await;
        let progress = last_progress(&items);

        assert_eq!(progress.status, TranslationProgressStatus::Completed);
        assert_eq!(progress.successful_units, 1);
        assert_eq!(progress.failed_units, 1);
        assert_eq!(progress.failed_unit_ids, vec![units[0].id.clone()]);

        let rejected = db.get_version(&units[0].id, &pl.id).unwrap().unwrap();
        assert_eq!(rejected.status, TranslationStatus::Error);
        assert!(rejected.translated_text.is_none());
        let issues: Vec<ValidationIssue> =
            serde_json::from_str(rejected.validation_issues.as_deref().expect("issues recorded"))
                .unwrap();
        assert!(!issues.is_empty());

        let review = db.get_version(&units[1].id, &pl.id).unwrap().unwrap();
        assert_eq!(review.status, TranslationStatus::NeedsReview);
        let issues = review.validation_issues.expect("issues recorded");
        assert!(issues.contains("identical"));

        // only clean translations are remembered
        let tm = TranslationMemoryIndex::new(db.clone());
        assert!(tm.find_exact("Hold the line", "fr").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_llm_rejection_fails_chunk_without_retry() {
        let f = fixture(3);
        let mut llm = MockLlm::new();
        llm.error_status = Some(400);
        let llm = Arc::new(llm);
        let orchestrator = orchestrator(&f.db, &f.bus, llm.clone());

        let items = drain(orchestrator.translate_batch(&f.batch_id, TranslationContext::new("mock"))).await;
        let progress = last_progress(&items);

        assert_eq!(progress.status, TranslationProgressStatus::Completed);
        assert_eq!(progress.failed_units, 3);
        assert_eq!(progress.successful_units, 0);
        assert!(progress.llm_logs[0].error.is_some());
        assert_eq!(llm.calls(), vec![3]);
        assert_eq!(orchestrator.metrics().llm_failures(), 1);

        let versions = f.db.list_versions(&f.pl.id).unwrap();
        assert_eq!(versions.len(), 3);
        assert!(versions.iter().all(|v| v.status == TranslationStatus::Error));
    }

    #[tokio::test]
    async fn test_failed_retranslation_keeps_previous_text() {
        let (db, _temp_dir) = create_test_db();
        let (pl, units) = seed_units(&db, &["Deal {0} damage"]);
        BulkPersistenceEngine::new(db.clone())
            .upsert_batch(&[TranslationVersion::new(
                &units[0].id,
                &pl.id,
                Some("Inflige {0} dégâts".to_string()),
                TranslationStatus::Translated,
                TranslationSource::Manual,
            )])
            .unwrap();
        let batch_id = create_batch(&db, &pl, &units);

        let mut llm = MockLlm::new();
        llm.translate = Box::new(|_| "Infliger des dégâts".to_string());
        let orchestrator = orchestrator(&db, &EventBus::default(), Arc::new(llm));
        let context = TranslationContext::new("mock").skipping_translation_memory();
        let items = drain(orchestrator.translate_batch(&batch_id, context)).await;
        assert_eq!(last_progress(&items).failed_units, 1);

        let version = db.get_version(&units[0].id, &pl.id).unwrap().unwrap();
        assert_eq!(version.status, TranslationStatus::Error);
        assert_eq!(version.translated_text.as_deref(), Some("Inflige {0} dégâts"));
        assert_eq!(version.translation_source, TranslationSource::Manual);
        assert!(version.validation_issues.is_some());
    }

    // ==================== Context Tests ====================

    #[tokio::test]
    async fn test_oversized_chunk_is_rejected() {
        let f = fixture(1);
        let orchestrator = orchestrator(&f.db, &f.bus, Arc::new(MockLlm::new()));
        let context = TranslationContext::new("mock").with_units_per_batch(101);

        let items = drain(orchestrator.translate_batch(&f.batch_id, context)).await;
        assert_eq!(items.len(), 1);
        assert!(matches!(
            items[0],
            Err(TranslationError::BatchSizeExceeded { requested: 101, max: 100 })
        ));
        assert_eq!(f.db.get_batch(&f.batch_id).unwrap().unwrap().status, "queued");
    }

    #[tokio::test]
    async fn test_unknown_batch_yields_not_found() {
        let f = fixture(1);
        let orchestrator = orchestrator(&f.db, &f.bus, Arc::new(MockLlm::new()));
        let items = drain(orchestrator.translate_batch("missing", TranslationContext::new("mock"))).await;
        assert!(matches!(items.last(), Some(Err(TranslationError::NotFound(_)))));
        assert!(orchestrator.active_batches().is_empty());
    }

    // ==================== Control Tests ====================

    #[tokio::test]
    async fn test_pause_and_resume_preserve_progress() {
        let f = fixture(4);
        let gate = Arc::new(Semaphore::new(0));
        let orchestrator = orchestrator(&f.db, &f.bus, Arc::new(MockLlm::gated(gate.clone())));

        let context = TranslationContext::new("mock").with_units_per_batch(2);
        let mut stream = orchestrator.translate_batch(&f.batch_id, context);
        wait_for(&mut stream, in_llm_phase).await;

        orchestrator.pause_translation(&f.batch_id).expect("pause");
        assert!(matches!(
            orchestrator.pause_translation(&f.batch_id),
            Err(TranslationError::InvalidState { .. })
        ));
        gate.add_permits(1);

        let paused = wait_for(&mut stream, |p| p.status == TranslationProgressStatus::Paused).await;
        assert_eq!(paused.processed_units, 2);
        assert_eq!(f.db.get_batch(&f.batch_id).unwrap().unwrap().status, "paused");

        // nothing happens while paused
        assert!(timeout(Duration::from_millis(100), stream.next()).await.is_err());
        assert_eq!(f.db.load_pending_batch_units(&f.batch_id).unwrap().len(), 2);

        orchestrator.resume_translation(&f.batch_id).expect("resume");
        assert!(matches!(
            orchestrator.resume_translation(&f.batch_id),
            Err(TranslationError::InvalidState { .. })
        ));
        gate.add_permits(1);

        let resumed = wait_for(&mut stream, |p| p.status == TranslationProgressStatus::InProgress).await;
        assert_eq!(resumed.processed_units, 2);

        let rest = drain(stream).await;
        let last = last_progress(&rest);
        assert_eq!(last.status, TranslationProgressStatus::Completed);
        assert_eq!(last.processed_units, 4);
        assert_eq!(last.successful_units, 4);
    }

    #[tokio::test]
    async fn test_unread_stream_stalls_the_batch() {
        let f = fixture(30);
        let orchestrator = orchestrator(&f.db, &f.bus, Arc::new(MockLlm::new()));

        let context = TranslationContext::new("mock")
            .with_units_per_batch(1)
            .skipping_translation_memory();
        let stream = orchestrator.translate_batch(&f.batch_id, context);
        tokio::time::sleep(Duration::from_millis(300)).await;

        // the buffer is full long before the last chunk
        assert_eq!(orchestrator.active_batches(), vec![f.batch_id.clone()]);
        assert!(!f.db.load_pending_batch_units(&f.batch_id).unwrap().is_empty());

        let items = drain(stream).await;
        let last = last_progress(&items);
        assert_eq!(last.status, TranslationProgressStatus::Completed);
        assert_eq!(last.successful_units, 30);
    }

    #[tokio::test]
    async fn test_resume_when_not_paused_is_invalid_state() {
        let f = fixture(1);
        let orchestrator = orchestrator(&f.db, &f.bus, Arc::new(MockLlm::new()));

        let err = orchestrator.resume_translation(&f.batch_id).unwrap_err();
        assert!(matches!(err, TranslationError::InvalidState { .. }));
        assert!(orchestrator.pause_translation(&f.batch_id).is_err());
        assert!(orchestrator.stop_translation(&f.batch_id).is_err());
        assert!(orchestrator.cancel_translation(&f.batch_id).is_err());
    }

    #[tokio::test]
    async fn test_cancel_abandons_in_flight_chunk() {
        let f = fixture(4);
        let gate = Arc::new(Semaphore::new(0));
        let orchestrator = orchestrator(&f.db, &f.bus, Arc::new(MockLlm::gated(gate.clone())));

        let context = TranslationContext::new("mock").with_units_per_batch(2);
        let mut stream = orchestrator.translate_batch(&f.batch_id, context.clone());
        wait_for(&mut stream, in_llm_phase).await;
        assert_eq!(orchestrator.active_batches(), vec![f.batch_id.clone()]);

        orchestrator.cancel_translation(&f.batch_id).expect("cancel");
        let rest = drain(stream).await;
        let last = last_progress(&rest);
        assert_eq!(last.status, TranslationProgressStatus::Cancelled);
        assert_eq!(last.processed_units, 0);

        assert_eq!(f.db.get_batch(&f.batch_id).unwrap().unwrap().status, "cancelled");
        assert_eq!(f.db.load_pending_batch_units(&f.batch_id).unwrap().len(), 4);
        assert!(f.db.list_versions(&f.pl.id).unwrap().is_empty());
        assert!(orchestrator.active_batches().is_empty());

        // a second run picks up the untouched units
        let rerun = orchestrator_with_open_llm(&f);
        let items = drain(rerun.translate_batch(&f.batch_id, context)).await;
        let last = last_progress(&items);
        assert_eq!(last.status, TranslationProgressStatus::Completed);
        assert_eq!(last.successful_units, 4);
    }

    fn orchestrator_with_open_llm(f: &Fixture) -> BatchOrchestrator {
        orchestrator(&f.db, &f.bus, Arc::new(MockLlm::new()))
    }

    #[tokio::test]
    async fn test_stop_persists_in_flight_chunk() {
        let f = fixture(4);
        let gate = Arc::new(Semaphore::new(0));
        let orchestrator = orchestrator(&f.db, &f.bus, Arc::new(MockLlm::gated(gate.clone())));

        let context = TranslationContext::new("mock").with_units_per_batch(2);
        let mut stream = orchestrator.translate_batch(&f.batch_id, context.clone());
        wait_for(&mut stream, in_llm_phase).await;

        orchestrator.stop_translation(&f.batch_id).expect("stop");
        assert!(orchestrator.stop_translation(&f.batch_id).is_err());
        gate.add_permits(1);

        let rest = drain(stream).await;
        let last = last_progress(&rest);
        assert_eq!(last.status, TranslationProgressStatus::Cancelled);
        assert_eq!(last.processed_units, 2);
        assert_eq!(last.successful_units, 2);

        assert_eq!(f.db.list_versions(&f.pl.id).unwrap().len(), 2);
        assert_eq!(f.db.load_pending_batch_units(&f.batch_id).unwrap().len(), 2);

        // already processed units are credited on the next run
        let rerun = orchestrator_with_open_llm(&f);
        let items = drain(rerun.translate_batch(&f.batch_id, context)).await;
        let first = items[0].as_ref().expect("progress");
        assert_eq!(first.processed_units, 2);
        assert_eq!(last_progress(&items).processed_units, 4);
    }

    #[tokio::test]
    async fn test_second_run_of_running_batch_is_rejected() {
        let f = fixture(2);
        let gate = Arc::new(Semaphore::new(0));
        let orchestrator = orchestrator(&f.db, &f.bus, Arc::new(MockLlm::gated(gate.clone())));

        let mut stream = orchestrator.translate_batch(&f.batch_id, TranslationContext::new("mock"));
        wait_for(&mut stream, in_llm_phase).await;

        let second = drain(orchestrator.translate_batch(&f.batch_id, TranslationContext::new("mock"))).await;
        assert!(matches!(second[0], Err(TranslationError::InvalidState { .. })));

        gate.add_permits(1);
        let rest = drain(stream).await;
        assert_eq!(last_progress(&rest).status, TranslationProgressStatus::Completed);
    }

    // ==================== Failure Tests ====================

    #[tokio::test]
    async fn test_save_error_fails_the_batch() {
        let f = fixture(2);
        f.db.with_connection(|conn| {
            conn.execute_batch(
                "CREATE TRIGGER reject_versions BEFORE INSERT ON translation_versions
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )?;
            Ok(())
        })
        .unwrap();
        let mut failures = f.bus.subscribe::<BatchFailed>();
        let orchestrator = orchestrator(&f.db, &f.bus, Arc::new(MockLlm::new()));

        let items = drain(orchestrator.translate_batch(&f.batch_id, TranslationContext::new("mock"))).await;
        assert!(matches!(items.last(), Some(Err(TranslationError::Database { .. }))));

        let batch = f.db.get_batch(&f.batch_id).unwrap().unwrap();
        assert_eq!(batch.status, "failed");
        assert!(batch.error_message.is_some());

        let event = timeout(Duration::from_secs(1), failures.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.batch_id, f.batch_id);
        assert!(orchestrator.active_batches().is_empty());
    }

    // ==================== Event Tests ====================

    #[tokio::test]
    async fn test_lifecycle_events_are_published_in_order() {
        let f = fixture(3);
        let mut events = f.bus.batch_events(&f.batch_id);
        let orchestrator = orchestrator(&f.db, &f.bus, Arc::new(MockLlm::new()));

        let context = TranslationContext::new("mock").with_units_per_batch(2);
        drain(orchestrator.translate_batch(&f.batch_id, context)).await;

        let mut types = Vec::new();
        loop {
            let event = timeout(Duration::from_secs(1), events.next())
                .await
                .unwrap()
                .unwrap();
            types.push(event.event_type());
            if event.is_terminal() {
                if let DomainEvent::BatchCompleted(completed) = &event {
                    assert_eq!(completed.successful_units, 3);
                }
                break;
            }
        }
        assert_eq!(
            types,
            vec![
                "batch_started",
                "translations_saved",
                "batch_progressed",
                "translations_saved",
                "batch_progressed",
                "batch_completed",
            ]
        );
    }
}
