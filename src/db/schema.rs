//! Relational schema, full-text indexes and consistency triggers.
//!
//! `translation_versions` has three groups of dependent triggers (progress
//! recompute, full-text sync, read-cache sync). Bulk imports drop and recreate
//! exactly those groups, so their definitions live here as data.

use super::models::TranslationStatus;

/// Tables and indexes, safe to run on every startup.
pub const TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS project_languages (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    language_id TEXT NOT NULL,
    progress_percent REAL NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    UNIQUE(project_id, language_id)
);

CREATE TABLE IF NOT EXISTS translation_units (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    key TEXT NOT NULL,
    source_text TEXT NOT NULL,
    context TEXT,
    is_obsolete INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(project_id, key)
);

CREATE TABLE IF NOT EXISTS translation_versions (
    id TEXT PRIMARY KEY,
    unit_id TEXT NOT NULL REFERENCES translation_units(id),
    project_language_id TEXT NOT NULL REFERENCES project_languages(id),
    translated_text TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    translation_source TEXT NOT NULL DEFAULT 'manual',
    validation_issues TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(unit_id, project_language_id)
);

CREATE INDEX IF NOT EXISTS idx_versions_project_language
    ON translation_versions(project_language_id, status);

CREATE VIRTUAL TABLE IF NOT EXISTS translation_versions_fts USING fts5(
    version_id UNINDEXED,
    translated_text
);

CREATE TABLE IF NOT EXISTS translation_view_cache (
    version_id TEXT PRIMARY KEY,
    unit_id TEXT NOT NULL,
    project_language_id TEXT NOT NULL,
    project_id TEXT NOT NULL,
    unit_key TEXT NOT NULL,
    source_text TEXT NOT NULL,
    translated_text TEXT,
    status TEXT NOT NULL,
    translation_source TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(unit_id, project_language_id)
);

CREATE TABLE IF NOT EXISTS translation_memory (
    id TEXT PRIMARY KEY,
    source_hash TEXT NOT NULL,
    target_language_id TEXT NOT NULL,
    source_text TEXT NOT NULL,
    translated_text TEXT NOT NULL,
    usage_count INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    last_used_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(source_hash, target_language_id)
);

CREATE VIRTUAL TABLE IF NOT EXISTS translation_memory_fts USING fts5(
    source_text,
    translated_text,
    entry_id UNINDEXED,
    target_language_id UNINDEXED
);

CREATE TABLE IF NOT EXISTS translation_batches (
    id TEXT PRIMARY KEY,
    project_language_id TEXT NOT NULL REFERENCES project_languages(id),
    provider_id TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'queued',
    units_count INTEGER NOT NULL DEFAULT 0,
    units_completed INTEGER NOT NULL DEFAULT 0,
    units_failed INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT
);

CREATE TABLE IF NOT EXISTS translation_batch_units (
    batch_id TEXT NOT NULL REFERENCES translation_batches(id),
    unit_id TEXT NOT NULL REFERENCES translation_units(id),
    processing_order INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    error_message TEXT,
    PRIMARY KEY (batch_id, unit_id)
);
"#;

/// Translation memory full-text sync. Never disabled.
pub const TM_TRIGGERS: &str = r#"
CREATE TRIGGER IF NOT EXISTS trg_tm_fts_insert AFTER INSERT ON translation_memory
BEGIN
    INSERT INTO translation_memory_fts(source_text, translated_text, entry_id, target_language_id)
    VALUES (NEW.source_text, NEW.translated_text, NEW.id, NEW.target_language_id);
END;

CREATE TRIGGER IF NOT EXISTS trg_tm_fts_update AFTER UPDATE OF source_text, translated_text ON translation_memory
WHEN OLD.source_text IS NOT NEW.source_text OR OLD.translated_text IS NOT NEW.translated_text
BEGIN
    DELETE FROM translation_memory_fts WHERE entry_id = OLD.id;
    INSERT INTO translation_memory_fts(source_text, translated_text, entry_id, target_language_id)
    VALUES (NEW.source_text, NEW.translated_text, NEW.id, NEW.target_language_id);
END;

CREATE TRIGGER IF NOT EXISTS trg_tm_fts_delete AFTER DELETE ON translation_memory
BEGIN
    DELETE FROM translation_memory_fts WHERE entry_id = OLD.id;
END;

CREATE TRIGGER IF NOT EXISTS trg_versions_fts_delete AFTER DELETE ON translation_versions
BEGIN
    DELETE FROM translation_versions_fts WHERE version_id = OLD.id;
    DELETE FROM translation_view_cache WHERE version_id = OLD.id;
END;
"#;

/// Dependent triggers on `translation_versions`, grouped by the concern they maintain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerGroup {
    Progress,
    FullText,
    ReadCache,
}

impl TriggerGroup {
    pub const ALL: [TriggerGroup; 3] = [
        TriggerGroup::Progress,
        TriggerGroup::FullText,
        TriggerGroup::ReadCache,
    ];

    /// `(trigger name, CREATE statement)` pairs for this group.
    pub fn definitions(self) -> Vec<(&'static str, String)> {
        match self {
            TriggerGroup::Progress => vec![
                (
                    "trg_versions_progress_insert",
                    format!(
                        "CREATE TRIGGER IF NOT EXISTS trg_versions_progress_insert \
                         AFTER INSERT ON translation_versions BEGIN {}; END;",
                        progress_recompute_sql("id = NEW.project_language_id")
                    ),
                ),
                (
                    "trg_versions_progress_update",
                    format!(
                        "CREATE TRIGGER IF NOT EXISTS trg_versions_progress_update \
                         AFTER UPDATE OF status ON translation_versions BEGIN {}; END;",
                        progress_recompute_sql("id = NEW.project_language_id")
                    ),
                ),
            ],
            TriggerGroup::FullText => vec![
                (
                    "trg_versions_fts_insert",
                    "CREATE TRIGGER IF NOT EXISTS trg_versions_fts_insert \
                     AFTER INSERT ON translation_versions WHEN NEW.translated_text IS NOT NULL \
                     BEGIN \
                         INSERT INTO translation_versions_fts(version_id, translated_text) \
                         VALUES (NEW.id, NEW.translated_text); \
                     END;"
                        .to_string(),
                ),
                (
                    "trg_versions_fts_update",
                    "CREATE TRIGGER IF NOT EXISTS trg_versions_fts_update \
                     AFTER UPDATE OF translated_text ON translation_versions \
                     BEGIN \
                         DELETE FROM translation_versions_fts WHERE version_id = OLD.id; \
                         INSERT INTO translation_versions_fts(version_id, translated_text) \
                         SELECT NEW.id, NEW.translated_text WHERE NEW.translated_text IS NOT NULL; \
                     END;"
                        .to_string(),
                ),
            ],
            TriggerGroup::ReadCache => vec![
                (
                    "trg_versions_cache_insert",
                    format!(
                        "CREATE TRIGGER IF NOT EXISTS trg_versions_cache_insert \
                         AFTER INSERT ON translation_versions BEGIN {}; END;",
                        cache_upsert_from_new_sql()
                    ),
                ),
                (
                    "trg_versions_cache_update",
                    format!(
                        "CREATE TRIGGER IF NOT EXISTS trg_versions_cache_update \
                         AFTER UPDATE ON translation_versions BEGIN {}; END;",
                        cache_upsert_from_new_sql()
                    ),
                ),
            ],
        }
    }

    pub fn names(self) -> Vec<&'static str> {
        self.definitions().into_iter().map(|(name, _)| name).collect()
    }
}

/// Recompute `progress_percent` for the project languages selected by `filter`.
///
/// Shared by the per-row trigger and the bulk replay so both paths agree.
pub fn progress_recompute_sql(filter: &str) -> String {
    let done = TranslationStatus::ALL
        .iter()
        .filter(|status| status.counts_as_done())
        .map(|status| format!("'{}'", status.as_str()))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "UPDATE project_languages SET progress_percent = ( \
             SELECT CASE WHEN COUNT(tu.id) = 0 THEN 0.0 \
                 ELSE ROUND(100.0 * SUM(CASE WHEN tv.status IN ({}) \
                     THEN 1 ELSE 0 END) / COUNT(tu.id), 2) END \
             FROM translation_units tu \
             LEFT JOIN translation_versions tv \
                 ON tv.unit_id = tu.id AND tv.project_language_id = project_languages.id \
             WHERE tu.project_id = project_languages.project_id AND tu.is_obsolete = 0 \
         ) WHERE {}",
        done, filter
    )
}

fn cache_upsert_from_new_sql() -> &'static str {
    "INSERT OR REPLACE INTO translation_view_cache \
         (version_id, unit_id, project_language_id, project_id, unit_key, source_text, \
          translated_text, status, translation_source, updated_at) \
     SELECT NEW.id, NEW.unit_id, NEW.project_language_id, tu.project_id, tu.key, tu.source_text, \
            NEW.translated_text, NEW.status, NEW.translation_source, NEW.updated_at \
     FROM translation_units tu WHERE tu.id = NEW.unit_id"
}

/// Set-based read-cache refresh for every version id listed in `temp.bulk_affected_versions`.
pub const CACHE_BULK_REPLAY: &str = "INSERT OR REPLACE INTO translation_view_cache \
         (version_id, unit_id, project_language_id, project_id, unit_key, source_text, \
          translated_text, status, translation_source, updated_at) \
     SELECT tv.id, tv.unit_id, tv.project_language_id, tu.project_id, tu.key, tu.source_text, \
            tv.translated_text, tv.status, tv.translation_source, tv.updated_at \
     FROM translation_versions tv \
     JOIN translation_units tu ON tu.id = tv.unit_id \
     WHERE tv.id IN (SELECT id FROM temp.bulk_affected_versions)";

pub const FTS_BULK_DELETE: &str = "DELETE FROM translation_versions_fts \
     WHERE version_id IN (SELECT id FROM temp.bulk_affected_versions)";

pub const FTS_BULK_INSERT: &str = "INSERT INTO translation_versions_fts(version_id, translated_text) \
     SELECT id, translated_text FROM translation_versions \
     WHERE translated_text IS NOT NULL \
       AND id IN (SELECT id FROM temp.bulk_affected_versions)";

pub const AFFECTED_TABLE_CREATE: &str =
    "CREATE TEMP TABLE IF NOT EXISTS bulk_affected_versions (id TEXT PRIMARY KEY)";

pub const AFFECTED_TABLE_CLEAR: &str = "DELETE FROM temp.bulk_affected_versions";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_group_has_unique_trigger_names() {
        let mut names: Vec<&str> = TriggerGroup::ALL
            .iter()
            .flat_map(|group| group.names())
            .collect();
        let total = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), total);
        assert_eq!(total, 6);
    }

    #[test]
    fn test_definitions_are_idempotent_creates() {
        for group in TriggerGroup::ALL {
            for (name, sql) in group.definitions() {
                assert!(sql.starts_with("CREATE TRIGGER IF NOT EXISTS"));
                assert!(sql.contains(name));
            }
        }
    }

    #[test]
    fn test_progress_sql_uses_filter() {
        let sql = progress_recompute_sql("id = 'pl-1'");
        assert!(sql.ends_with("WHERE id = 'pl-1'"));
    }

    #[test]
    fn test_progress_sql_counts_done_statuses_only() {
        let sql = progress_recompute_sql("1 = 1");
        assert!(sql.contains("IN ('translated', 'reviewed', 'approved')"));
        assert!(!sql.contains("'needs_review'"));
        assert!(!sql.contains("'error'"));
    }
}
