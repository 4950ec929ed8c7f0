//! Minimal project-language, unit and version access used by the pipeline.
//!
//! Full project CRUD belongs to the application layer; these are the reads and
//! writes the batch pipeline itself depends on.

use super::{Database, ProjectLanguage, TranslationUnit, TranslationVersion};
use crate::db::CachedTranslationRow;
use crate::error::Result;
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// Source string to register under a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUnit {
    pub key: String,
    pub source_text: String,
    pub context: Option<String>,
}

impl Database {
    /// Register a project/language pair, returning the existing row if present
    pub fn create_project_language(
        &self,
        project_id: &str,
        language_id: &str,
    ) -> Result<ProjectLanguage> {
        if let Some(existing) = self.find_project_language(project_id, language_id)? {
            return Ok(existing);
        }

        let id = ulid::Ulid::new().to_string();
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO project_languages (id, project_id, language_id, progress_percent, created_at)
                 VALUES (?1, ?2, ?3, 0, ?4)",
                params![id, project_id, language_id, Utc::now()],
            )?;
            Ok(())
        })?;

        Ok(ProjectLanguage {
            id,
            project_id: project_id.to_string(),
            language_id: language_id.to_string(),
            progress_percent: 0.0,
        })
    }

    pub fn find_project_language(
        &self,
        project_id: &str,
        language_id: &str,
    ) -> Result<Option<ProjectLanguage>> {
        self.with_connection(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, project_id, language_id, progress_percent
                     FROM project_languages WHERE project_id = ?1 AND language_id = ?2",
                    params![project_id, language_id],
                    row_to_project_language,
                )
                .optional()?)
        })
    }

    pub fn get_project_language(&self, id: &str) -> Result<Option<ProjectLanguage>> {
        self.with_connection(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, project_id, language_id, progress_percent
                     FROM project_languages WHERE id = ?1",
                    params![id],
                    row_to_project_language,
                )
                .optional()?)
        })
    }

    /// Insert (or refresh the text of) units keyed by `(project_id, key)`
    pub fn insert_units(&self, project_id: &str, units: &[NewUnit]) -> Result<Vec<TranslationUnit>> {
        let now = Utc::now();
        self.with_transaction(|tx| {
            let mut stmt = tx.prepare(
                "INSERT INTO translation_units
                     (id, project_id, key, source_text, context, is_obsolete, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?6)
                 ON CONFLICT(project_id, key) DO UPDATE SET
                     source_text = excluded.source_text,
                     context = excluded.context,
                     updated_at = excluded.updated_at",
            )?;
            let mut select = tx.prepare(
                "SELECT id, project_id, key, source_text, context, is_obsolete, created_at, updated_at
                 FROM translation_units WHERE project_id = ?1 AND key = ?2",
            )?;

            let mut inserted = Vec::with_capacity(units.len());
            for unit in units {
                let id = ulid::Ulid::new().to_string();
                stmt.execute(params![
                    id,
                    project_id,
                    unit.key,
                    unit.source_text,
                    unit.context,
                    now
                ])?;
                inserted.push(select.query_row(params![project_id, unit.key], row_to_unit)?);
            }
            Ok(inserted)
        })
    }

    /// Flag a unit as obsolete. Units are never physically removed.
    pub fn mark_unit_obsolete(&self, unit_id: &str) -> Result<bool> {
        self.with_connection(|conn| {
            let changed = conn.execute(
                "UPDATE translation_units SET is_obsolete = 1, updated_at = ?2
                 WHERE id = ?1 AND is_obsolete = 0",
                params![unit_id, Utc::now()],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn get_version(
        &self,
        unit_id: &str,
        project_language_id: &str,
    ) -> Result<Option<TranslationVersion>> {
        self.with_connection(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, unit_id, project_language_id, translated_text, status,
                            translation_source, validation_issues, created_at, updated_at
                     FROM translation_versions
                     WHERE unit_id = ?1 AND project_language_id = ?2",
                    params![unit_id, project_language_id],
                    row_to_version,
                )
                .optional()?)
        })
    }

    pub fn list_versions(&self, project_language_id: &str) -> Result<Vec<TranslationVersion>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, unit_id, project_language_id, translated_text, status,
                        translation_source, validation_issues, created_at, updated_at
                 FROM translation_versions
                 WHERE project_language_id = ?1
                 ORDER BY id",
            )?;
            let versions = stmt
                .query_map(params![project_language_id], row_to_version)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(versions)
        })
    }

    /// Rows of the denormalized read cache for a project language, ordered by unit key
    pub fn cached_translations(&self, project_language_id: &str) -> Result<Vec<CachedTranslationRow>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT version_id, unit_id, project_language_id, project_id, unit_key,
                        source_text, translated_text, status, translation_source
                 FROM translation_view_cache
                 WHERE project_language_id = ?1
                 ORDER BY unit_key",
            )?;
            let rows = stmt
                .query_map(params![project_language_id], |row| {
                    Ok(CachedTranslationRow {
                        version_id: row.get(0)?,
                        unit_id: row.get(1)?,
                        project_language_id: row.get(2)?,
                        project_id: row.get(3)?,
                        unit_key: row.get(4)?,
                        source_text: row.get(5)?,
                        translated_text: row.get(6)?,
                        status: row.get(7)?,
                        translation_source: row.get(8)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// `(version_id, translated_text)` pairs held by the versions full-text index
    pub fn indexed_version_texts(&self) -> Result<Vec<(String, String)>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT version_id, translated_text FROM translation_versions_fts
                 ORDER BY version_id",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Ids of versions whose translated text matches a full-text query
    pub fn search_versions(&self, query: &str, limit: usize) -> Result<Vec<String>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT version_id FROM translation_versions_fts
                 WHERE translation_versions_fts MATCH ?1
                 ORDER BY bm25(translation_versions_fts)
                 LIMIT ?2",
            )?;
            let ids = stmt
                .query_map(params![query, limit as i64], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }
}

fn row_to_project_language(row: &Row<'_>) -> rusqlite::Result<ProjectLanguage> {
    Ok(ProjectLanguage {
        id: row.get(0)?,
        project_id: row.get(1)?,
        language_id: row.get(2)?,
        progress_percent: row.get(3)?,
    })
}

fn row_to_unit(row: &Row<'_>) -> rusqlite::Result<TranslationUnit> {
    Ok(TranslationUnit {
        id: row.get(0)?,
        project_id: row.get(1)?,
        key: row.get(2)?,
        source_text: row.get(3)?,
        context: row.get(4)?,
        is_obsolete: row.get::<_, i64>(5)? != 0,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

pub(crate) fn row_to_version(row: &Row<'_>) -> rusqlite::Result<TranslationVersion> {
    Ok(TranslationVersion {
        id: row.get(0)?,
        unit_id: row.get(1)?,
        project_language_id: row.get(2)?,
        translated_text: row.get(3)?,
        status: row.get(4)?,
        translation_source: row.get(5)?,
        validation_issues: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}
