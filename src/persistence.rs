//! Transactional writes of translation versions.
//!
//! Small writes go through the consistency triggers. Large imports drop the
//! progress, full-text and read-cache triggers, write in chunks, then replay the
//! three concerns set-based for the affected rows before the triggers are put
//! back. The triggers are restored whether or not the import succeeds.

use crate::db::schema::{self, TriggerGroup};
use crate::db::{trigger_exists, Database, TranslationVersion};
use crate::error::Result;
use crate::events::{EventBus, ProjectProgressChanged, TranslationsImported};
use chrono::Utc;
use rusqlite::types::ToSql;
use rusqlite::{params, params_from_iter, ParamsFromIter, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, error, info, warn};

pub const DEFAULT_BULK_THRESHOLD: usize = 50;
pub const DEFAULT_CHUNK_SIZE: usize = 500;

const INSERT_VERSION: &str = "INSERT INTO translation_versions
     (id, unit_id, project_language_id, translated_text, status, translation_source,
      validation_issues, created_at, updated_at)
 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportResult {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
}

impl ImportResult {
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.skipped
    }
}

#[derive(Debug, Clone)]
pub struct BulkPersistenceEngine {
    db: Database,
    bus: Option<EventBus>,
    bulk_threshold: usize,
    chunk_size: usize,
}

impl BulkPersistenceEngine {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            bus: None,
            bulk_threshold: DEFAULT_BULK_THRESHOLD,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Announce imports and progress changes on `bus`
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Imports larger than this use bulk mode
    pub fn with_bulk_threshold(mut self, threshold: usize) -> Self {
        self.bulk_threshold = threshold;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    // ==================== Trigger-backed Writes ====================

    /// Insert new versions in one transaction
    pub fn insert_batch(&self, versions: &[TranslationVersion]) -> Result<usize> {
        if versions.is_empty() {
            return Ok(0);
        }
        let inserted = self.db.with_transaction(|tx| {
            let mut stmt = tx.prepare(INSERT_VERSION)?;
            let mut inserted = 0;
            for version in versions {
                inserted += stmt.execute(version_params(version))?;
            }
            Ok(inserted)
        })?;

        debug!("Inserted {} translation versions", inserted);
        self.announce_progress(&project_language_ids(versions));
        Ok(inserted)
    }

    /// Insert or update versions keyed by `(unit_id, project_language_id)`.
    ///
    /// An existing row keeps its id and `created_at`.
    pub fn upsert_batch(&self, versions: &[TranslationVersion]) -> Result<usize> {
        if versions.is_empty() {
            return Ok(0);
        }
        let written = self.db.with_transaction(|tx| {
            let mut stmt = tx.prepare(&format!(
                "{} ON CONFLICT(unit_id, project_language_id) DO UPDATE SET
                     translated_text = excluded.translated_text,
                     status = excluded.status,
                     translation_source = excluded.translation_source,
                     validation_issues = excluded.validation_issues,
                     updated_at = excluded.updated_at",
                INSERT_VERSION
            ))?;
            let mut written = 0;
            for version in versions {
                written += stmt.execute(version_params(version))?;
            }
            Ok(written)
        })?;

        debug!("Upserted {} translation versions", written);
        self.announce_progress(&project_language_ids(versions));
        Ok(written)
    }

    // ==================== Import ====================

    /// Import versions, updating those listed in `existing_version_ids`.
    ///
    /// `on_progress(processed, total)` runs after every chunk and
    /// `is_cancelled` is checked before every chunk. After cancellation the
    /// chunks already written are kept and the rest count as skipped.
    pub fn import_batch<P, C>(
        &self,
        versions: &[TranslationVersion],
        existing_version_ids: &HashSet<String>,
        mut on_progress: P,
        is_cancelled: C,
    ) -> Result<ImportResult>
    where
        P: FnMut(usize, usize),
        C: Fn() -> bool,
    {
        if versions.is_empty() {
            return Ok(ImportResult::default());
        }

        let bulk = versions.len() > self.bulk_threshold;
        info!(
            "Importing {} translation versions ({} mode)",
            versions.len(),
            if bulk { "bulk" } else { "trigger" }
        );

        let result = if bulk {
            let outcome = self.db.with_transaction(|tx| {
                drop_trigger_groups(tx)?;
                let written = self.write_chunks(
                    tx,
                    versions,
                    existing_version_ids,
                    true,
                    &mut on_progress,
                    &is_cancelled,
                );
                let replayed = written.and_then(|result| {
                    replay_bulk_effects(tx)?;
                    Ok(result)
                });
                let restored = create_trigger_groups(tx);
                let result = replayed?;
                restored?;
                Ok(result)
            });
            if outcome.is_err() {
                // The rollback already restores the dropped triggers; recheck anyway
                if let Err(e) = self.repair_triggers() {
                    error!("Failed to restore triggers after aborted import: {}", e);
                }
            }
            outcome?
        } else {
            self.db.with_transaction(|tx| {
                self.write_chunks(
                    tx,
                    versions,
                    existing_version_ids,
                    false,
                    &mut on_progress,
                    &is_cancelled,
                )
            })?
        };

        info!(
            "Import finished: {} inserted, {} updated, {} skipped",
            result.inserted, result.updated, result.skipped
        );

        let pl_ids = project_language_ids(versions);
        if let Some(bus) = &self.bus {
            bus.publish(TranslationsImported {
                project_language_ids: pl_ids.iter().cloned().collect(),
                inserted: result.inserted,
                updated: result.updated,
                skipped: result.skipped,
                at: Utc::now(),
            });
        }
        self.announce_progress(&pl_ids);

        Ok(result)
    }

    fn write_chunks<P, C>(
        &self,
        tx: &Transaction<'_>,
        versions: &[TranslationVersion],
        existing_version_ids: &HashSet<String>,
        track_affected: bool,
        on_progress: &mut P,
        is_cancelled: &C,
    ) -> Result<ImportResult>
    where
        P: FnMut(usize, usize),
        C: Fn() -> bool,
    {
        if track_affected {
            tx.execute(schema::AFFECTED_TABLE_CREATE, [])?;
            tx.execute(schema::AFFECTED_TABLE_CLEAR, [])?;
        }

        let mut insert = tx.prepare(&format!("{} ON CONFLICT DO NOTHING", INSERT_VERSION))?;
        let mut update = tx.prepare(
            "UPDATE translation_versions SET
                 translated_text = ?2,
                 status = ?3,
                 translation_source = ?4,
                 validation_issues = ?5,
                 updated_at = ?6
             WHERE id = ?1",
        )?;
        let mut affected = if track_affected {
            Some(tx.prepare("INSERT OR IGNORE INTO temp.bulk_affected_versions (id) VALUES (?1)")?)
        } else {
            None
        };

        let total = versions.len();
        let mut result = ImportResult::default();
        let mut processed = 0;

        for (index, chunk) in versions.chunks(self.chunk_size).enumerate() {
            if is_cancelled() {
                result.skipped += total - processed;
                warn!(
                    "Import cancelled before chunk {}, {} versions skipped",
                    index + 1,
                    total - processed
                );
                break;
            }

            for version in chunk {
                let changed = if existing_version_ids.contains(&version.id) {
                    let changed = update.execute(params![
                        version.id,
                        version.translated_text,
                        version.status,
                        version.translation_source,
                        version.validation_issues,
                        version.updated_at
                    ])?;
                    if changed > 0 {
                        result.updated += 1;
                    }
                    changed
                } else {
                    let changed = insert.execute(version_params(version))?;
                    if changed > 0 {
                        result.inserted += 1;
                    }
                    changed
                };

                if changed == 0 {
                    result.skipped += 1;
                } else if let Some(affected) = affected.as_mut() {
                    affected.execute(params![version.id])?;
                }
            }

            processed += chunk.len();
            debug!("Import chunk {} written ({}/{})", index + 1, processed, total);
            on_progress(processed, total);
        }

        Ok(result)
    }

    // ==================== Maintenance ====================

    /// Recreate any missing consistency trigger, returning the names restored
    pub fn repair_triggers(&self) -> Result<Vec<&'static str>> {
        let repaired = self.db.with_transaction(|tx| {
            let mut repaired = Vec::new();
            for group in TriggerGroup::ALL {
                for (name, sql) in group.definitions() {
                    if !trigger_exists(tx, name)? {
                        tx.execute_batch(&sql)?;
                        repaired.push(name);
                    }
                }
            }
            Ok(repaired)
        })?;

        if !repaired.is_empty() {
            warn!("Recreated missing triggers: {}", repaired.join(", "));
        }
        Ok(repaired)
    }

    /// Recompute the progress percentage of the given project languages
    pub fn recompute_progress(&self, project_language_ids: &[String]) -> Result<()> {
        if project_language_ids.is_empty() {
            return Ok(());
        }
        self.db.with_transaction(|tx| {
            let sql = schema::progress_recompute_sql(&format!(
                "id IN ({})",
                crate::db::placeholders(project_language_ids.len())
            ));
            tx.execute(&sql, rusqlite::params_from_iter(project_language_ids))?;
            Ok(())
        })
    }

    fn announce_progress(&self, project_language_ids: &BTreeSet<String>) {
        let Some(bus) = &self.bus else {
            return;
        };
        for pl_id in project_language_ids {
            match self.db.get_project_language(pl_id) {
                Ok(Some(pl)) => {
                    bus.publish(ProjectProgressChanged {
                        project_id: pl.project_id,
                        project_language_id: pl.id,
                        progress_percent: pl.progress_percent,
                        at: Utc::now(),
                    });
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to read progress of {}: {}", pl_id, e),
            }
        }
    }
}

fn version_params(version: &TranslationVersion) -> ParamsFromIter<[&dyn ToSql; 9]> {
    params_from_iter([
        &version.id as &dyn ToSql,
        &version.unit_id as &dyn ToSql,
        &version.project_language_id as &dyn ToSql,
        &version.translated_text as &dyn ToSql,
        &version.status as &dyn ToSql,
        &version.translation_source as &dyn ToSql,
        &version.validation_issues as &dyn ToSql,
        &version.created_at as &dyn ToSql,
        &version.updated_at as &dyn ToSql,
    ])
}

fn project_language_ids(versions: &[TranslationVersion]) -> BTreeSet<String> {
    versions
        .iter()
        .map(|v| v.project_language_id.clone())
        .collect()
}

fn drop_trigger_groups(tx: &Transaction<'_>) -> Result<()> {
    for group in TriggerGroup::ALL {
        for name in group.names() {
            tx.execute_batch(&format!("DROP TRIGGER IF EXISTS {}", name))?;
        }
    }
    Ok(())
}

fn create_trigger_groups(tx: &Transaction<'_>) -> Result<()> {
    for group in TriggerGroup::ALL {
        for (_, sql) in group.definitions() {
            tx.execute_batch(&sql)?;
        }
    }
    Ok(())
}

/// Replay full-text, read-cache and progress maintenance for the affected versions
fn replay_bulk_effects(tx: &Transaction<'_>) -> Result<()> {
    tx.execute(schema::FTS_BULK_DELETE, [])?;
    tx.execute(schema::FTS_BULK_INSERT, [])?;
    tx.execute(schema::CACHE_BULK_REPLAY, [])?;
    tx.execute(
        &schema::progress_recompute_sql(
            "id IN (SELECT DISTINCT project_language_id FROM translation_versions \
             WHERE id IN (SELECT id FROM temp.bulk_affected_versions))",
        ),
        [],
    )?;
    tx.execute(schema::AFFECTED_TABLE_CLEAR, [])?;
    Ok(())
}
