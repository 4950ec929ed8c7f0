//! Batch rows: which units a batch covers and how far it got.
//!
//! Per-unit status lets a stopped or cancelled batch be resumed: reloading a
//! batch only returns units that are still pending.

use super::Database;
use crate::error::{Result, TranslationError};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchUnitStatus {
    Pending,
    Completed,
    Failed,
    Skipped,
}

impl BatchUnitStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub id: String,
    pub project_language_id: String,
    pub provider_id: String,
    pub status: String,
    pub units_count: usize,
    pub units_completed: usize,
    pub units_failed: usize,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A unit scheduled in a batch, joined with its source text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchUnit {
    pub unit_id: String,
    pub key: String,
    pub source_text: String,
    pub context: Option<String>,
    pub processing_order: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchUnitUpdate {
    pub unit_id: String,
    pub status: BatchUnitStatus,
    pub error_message: Option<String>,
}

impl Database {
    /// Create a queued batch over `unit_ids` in the given order
    pub fn create_batch(
        &self,
        project_language_id: &str,
        provider_id: &str,
        unit_ids: &[String],
    ) -> Result<String> {
        let batch_id = ulid::Ulid::new().to_string();
        self.with_transaction(|tx| {
            tx.execute(
                "INSERT INTO translation_batches
                     (id, project_language_id, provider_id, status, units_count, created_at)
                 VALUES (?1, ?2, ?3, 'queued', ?4, ?5)",
                params![
                    batch_id,
                    project_language_id,
                    provider_id,
                    unit_ids.len() as i64,
                    Utc::now()
                ],
            )?;
            let mut stmt = tx.prepare(
                "INSERT INTO translation_batch_units (batch_id, unit_id, processing_order, status)
                 VALUES (?1, ?2, ?3, 'pending')",
            )?;
            for (order, unit_id) in unit_ids.iter().enumerate() {
                stmt.execute(params![batch_id, unit_id, order as i64])?;
            }
            Ok(())
        })?;
        Ok(batch_id)
    }

    pub fn get_batch(&self, batch_id: &str) -> Result<Option<BatchRecord>> {
        self.with_connection(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, project_language_id, provider_id, status, units_count,
                            units_completed, units_failed, error_message, created_at,
                            started_at, completed_at
                     FROM translation_batches WHERE id = ?1",
                    params![batch_id],
                    |row| {
                        Ok(BatchRecord {
                            id: row.get(0)?,
                            project_language_id: row.get(1)?,
                            provider_id: row.get(2)?,
                            status: row.get(3)?,
                            units_count: row.get::<_, i64>(4)? as usize,
                            units_completed: row.get::<_, i64>(5)? as usize,
                            units_failed: row.get::<_, i64>(6)? as usize,
                            error_message: row.get(7)?,
                            created_at: row.get(8)?,
                            started_at: row.get(9)?,
                            completed_at: row.get(10)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    /// Units still pending in the batch, skipping obsolete units
    pub fn load_pending_batch_units(&self, batch_id: &str) -> Result<Vec<BatchUnit>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT tu.id, tu.key, tu.source_text, tu.context, bu.processing_order
                 FROM translation_batch_units bu
                 JOIN translation_units tu ON tu.id = bu.unit_id
                 WHERE bu.batch_id = ?1 AND bu.status = 'pending' AND tu.is_obsolete = 0
                 ORDER BY bu.processing_order",
            )?;
            let units = stmt
                .query_map(params![batch_id], |row| {
                    Ok(BatchUnit {
                        unit_id: row.get(0)?,
                        key: row.get(1)?,
                        source_text: row.get(2)?,
                        context: row.get(3)?,
                        processing_order: row.get(4)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(units)
        })
    }

    /// `(completed, failed)` unit counts already recorded for the batch
    pub fn batch_unit_counts(&self, batch_id: &str) -> Result<(usize, usize)> {
        self.with_connection(|conn| {
            let (completed, failed): (i64, i64) = conn.query_row(
                "SELECT
                     COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0),
                     COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0)
                 FROM translation_batch_units WHERE batch_id = ?1",
                params![batch_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok((completed as usize, failed as usize))
        })
    }

    /// Record per-unit outcomes and refresh the batch counters in one transaction
    pub fn record_batch_units(&self, batch_id: &str, updates: &[BatchUnitUpdate]) -> Result<()> {
        self.with_transaction(|tx| {
            let mut stmt = tx.prepare(
                "UPDATE translation_batch_units SET status = ?3, error_message = ?4
                 WHERE batch_id = ?1 AND unit_id = ?2",
            )?;
            for update in updates {
                stmt.execute(params![
                    batch_id,
                    update.unit_id,
                    update.status.as_str(),
                    update.error_message
                ])?;
            }
            tx.execute(
                "UPDATE translation_batches SET
                     units_completed = (SELECT COUNT(*) FROM translation_batch_units
                                        WHERE batch_id = ?1 AND status = 'completed'),
                     units_failed = (SELECT COUNT(*) FROM translation_batch_units
                                     WHERE batch_id = ?1 AND status = 'failed')
                 WHERE id = ?1",
                params![batch_id],
            )?;
            Ok(())
        })
    }

    pub fn mark_batch_started(&self, batch_id: &str) -> Result<()> {
        self.set_batch_status(batch_id, "in_progress", None, false)
    }

    /// Terminal or paused status; terminal statuses also stamp `completed_at`
    pub fn set_batch_status(
        &self,
        batch_id: &str,
        status: &str,
        error_message: Option<&str>,
        finished: bool,
    ) -> Result<()> {
        let now = Utc::now();
        let changed = self.with_connection(|conn| {
            Ok(conn.execute(
                "UPDATE translation_batches SET
                     status = ?2,
                     error_message = COALESCE(?3, error_message),
                     started_at = COALESCE(started_at, ?4),
                     completed_at = CASE WHEN ?5 THEN ?4 ELSE completed_at END
                 WHERE id = ?1",
                params![batch_id, status, error_message, now, finished],
            )?)
        })?;
        if changed == 0 {
            return Err(TranslationError::NotFound(format!("batch {}", batch_id)));
        }
        Ok(())
    }
}
